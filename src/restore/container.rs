//! Ephemeral Instance
//!
//! A disposable PostgreSQL server driven through the Docker CLI. The
//! container is published on loopback only, labelled with the run id and
//! removed on `terminate`, or on drop if the run never got that far.

use crate::config::{DockerConfig, PullPolicy};
use crate::error::{environment_error, AppError, AppResult};
use crate::introspection::{CatalogSource, PostgresCatalog};
use deadpool_postgres::{Config, ManagerConfig, RecyclingMethod, Runtime};
use std::path::Path;
use std::process::Output;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::Instant;
use tokio_postgres::NoTls;
use tracing::{debug, info, warn};

/// Log line PostgreSQL prints once after bootstrap and once when serving
pub const READY_LINE: &str = "database system is ready to accept connections";

/// Readiness must be observed this many times before connecting
pub const READY_OCCURRENCES: usize = 2;

const ENGINE_PORT: &str = "5432/tcp";
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Exit status and combined stdout/stderr of a command run inside the instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub output: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    fn from_process(out: Output) -> Self {
        let mut output = String::from_utf8_lossy(&out.stdout).into_owned();
        output.push_str(&String::from_utf8_lossy(&out.stderr));
        Self {
            exit_code: out.status.code().unwrap_or(-1),
            output,
        }
    }
}

/// Capabilities the restore orchestrator needs from a disposable database
#[allow(async_fn_in_trait)]
pub trait EphemeralInstance {
    type Catalog: CatalogSource;

    /// Start the instance and wait until it accepts connections
    async fn provision(&mut self) -> AppResult<()>;

    /// Copy a host file into the instance's filesystem
    async fn copy_in(&mut self, host_path: &Path, dest: &str) -> AppResult<()>;

    /// Run a command inside the instance; a non-zero exit is not an error
    async fn exec(&self, cmd: &[&str]) -> AppResult<ExecOutput>;

    /// Open a catalog connection to the restored database
    async fn connect(&self) -> AppResult<Self::Catalog>;

    /// Tear the instance down; calling it again is a no-op
    async fn terminate(&mut self) -> AppResult<()>;
}

/// Credentials for the ephemeral server
#[derive(Debug, Clone)]
pub struct InstanceCredentials {
    pub user: String,
    pub password: String,
    pub db_name: String,
}

/// PostgreSQL in a Docker container
pub struct DockerPostgres {
    docker: DockerConfig,
    image: String,
    credentials: InstanceCredentials,
    run_id: String,
    container_id: Option<String>,
    host_port: Option<u16>,
    /// `docker run` was issued; a container may exist even without an id
    launched: bool,
}

impl DockerPostgres {
    pub fn new(
        docker: DockerConfig,
        image: impl Into<String>,
        credentials: InstanceCredentials,
        run_id: impl Into<String>,
    ) -> Self {
        Self {
            docker,
            image: image.into(),
            credentials,
            run_id: run_id.into(),
            container_id: None,
            host_port: None,
            launched: false,
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.docker.binary);
        cmd.kill_on_drop(true);
        cmd
    }

    async fn output(&self, mut cmd: Command, what: &str) -> AppResult<Output> {
        cmd.output()
            .await
            .map_err(|e| environment_error(format!("failed to run {} {}: {}", self.docker.binary, what, e)))
    }

    /// Run a docker subcommand that must succeed, returning its stdout
    async fn docker(&self, args: &[&str]) -> AppResult<String> {
        let mut cmd = self.command();
        cmd.args(args);
        let out = self.output(cmd, args.first().copied().unwrap_or_default()).await?;
        if !out.status.success() {
            return Err(environment_error(format!(
                "{} {} failed: {}",
                self.docker.binary,
                args.join(" "),
                String::from_utf8_lossy(&out.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
    }

    fn run_label(&self) -> String {
        format!("restorable.run={}", self.run_id)
    }

    /// Containers carrying this run's label, running or not
    async fn labelled_containers(&self) -> AppResult<Vec<String>> {
        let filter = format!("label={}", self.run_label());
        let out = self.docker(&["ps", "-aq", "--filter", &filter]).await?;
        Ok(container_ids(&out))
    }

    fn container(&self) -> AppResult<&str> {
        self.container_id
            .as_deref()
            .ok_or_else(|| AppError::Internal("ephemeral instance not provisioned".to_string()))
    }

    async fn start_container(&mut self) -> AppResult<()> {
        if self.docker.pull_policy == PullPolicy::Always {
            info!("Pulling image {}", self.image);
            self.docker(&["pull", &self.image]).await?;
        }

        let label = self.run_label();
        let user = format!("POSTGRES_USER={}", self.credentials.user);
        let db = format!("POSTGRES_DB={}", self.credentials.db_name);
        let mut args = vec![
            "run", "-d", "--label", label.as_str(), "-e", user.as_str(), "-e", db.as_str(),
            // value comes from this process's environment, not the command line
            "-e", "POSTGRES_PASSWORD",
            "-p", "127.0.0.1::5432",
        ];
        if let Some(network) = &self.docker.network {
            args.push("--network");
            args.push(network);
        }
        args.push(&self.image);

        let mut cmd = self.command();
        cmd.args(&args)
            .env("POSTGRES_PASSWORD", &self.credentials.password);
        self.launched = true;
        let out = self.output(cmd, "run").await?;
        if !out.status.success() {
            return Err(environment_error(format!(
                "could not start postgres container from {}: {}",
                self.image,
                String::from_utf8_lossy(&out.stderr).trim()
            )));
        }

        let id = String::from_utf8_lossy(&out.stdout).trim().to_string();
        info!("Started container {} ({})", short_id(&id), self.image);
        self.container_id = Some(id);
        Ok(())
    }

    /// Poll the container log until the readiness line has been seen twice
    async fn wait_ready(&self) -> AppResult<()> {
        let id = self.container()?;
        let timeout = Duration::from_secs(self.docker.startup_timeout_seconds);
        let deadline = Instant::now() + timeout;

        loop {
            let mut cmd = self.command();
            cmd.args(["logs", id]);
            let logs = ExecOutput::from_process(self.output(cmd, "logs").await?).output;
            let seen = count_ready_lines(&logs);
            if seen >= READY_OCCURRENCES {
                debug!("Readiness observed {} times", seen);
                return Ok(());
            }

            let running = self
                .docker(&["inspect", "-f", "{{.State.Running}}", id])
                .await?;
            if running != "true" {
                return Err(environment_error(format!(
                    "container {} exited during startup:\n{}",
                    short_id(id),
                    tail(&logs, 20)
                )));
            }

            if Instant::now() >= deadline {
                return Err(environment_error(format!(
                    "database did not become ready within {}s",
                    timeout.as_secs()
                )));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn resolve_port(&mut self) -> AppResult<()> {
        let id = self.container()?.to_string();
        let mapping = self.docker(&["port", &id, ENGINE_PORT]).await?;
        let port = parse_host_port(&mapping).ok_or_else(|| {
            environment_error(format!("could not parse published port from '{}'", mapping))
        })?;
        debug!("Engine published on 127.0.0.1:{}", port);
        self.host_port = Some(port);
        Ok(())
    }
}

impl EphemeralInstance for DockerPostgres {
    type Catalog = PostgresCatalog;

    async fn provision(&mut self) -> AppResult<()> {
        self.start_container().await?;
        self.wait_ready().await?;
        self.resolve_port().await?;
        info!("Database container ready");
        Ok(())
    }

    async fn copy_in(&mut self, host_path: &Path, dest: &str) -> AppResult<()> {
        let target = format!("{}:{}", self.container()?, dest);
        let source = host_path.to_string_lossy().into_owned();
        self.docker(&["cp", &source, &target]).await?;
        Ok(())
    }

    async fn exec(&self, cmd: &[&str]) -> AppResult<ExecOutput> {
        let id = self.container()?;
        let mut command = self.command();
        command
            .args(["exec", "-e", "PGPASSWORD", id])
            .args(cmd)
            .env("PGPASSWORD", &self.credentials.password);
        let out = self.output(command, "exec").await?;
        Ok(ExecOutput::from_process(out))
    }

    async fn connect(&self) -> AppResult<PostgresCatalog> {
        let port = self
            .host_port
            .ok_or_else(|| AppError::Internal("ephemeral instance has no published port".to_string()))?;

        let mut cfg = Config::new();
        cfg.host = Some("127.0.0.1".to_string());
        cfg.port = Some(port);
        cfg.user = Some(self.credentials.user.clone());
        cfg.password = Some(self.credentials.password.clone());
        cfg.dbname = Some(self.credentials.db_name.clone());
        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });

        let pool = cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| environment_error(format!("failed to create pool: {}", e)))?;

        let client = pool.get().await?;
        client.query_one("SELECT 1", &[]).await?;

        Ok(PostgresCatalog::new(pool))
    }

    async fn terminate(&mut self) -> AppResult<()> {
        self.host_port = None;
        let ids = match self.container_id.take() {
            Some(id) => vec![id],
            // Cancelled or failed inside `docker run`: find it by label
            None if self.launched => self.labelled_containers().await?,
            None => return Ok(()),
        };
        self.launched = false;

        let mut result = Ok(());
        for id in ids {
            match self.docker(&["rm", "-f", "-v", &id]).await {
                Ok(_) => info!("Removed container {}", short_id(&id)),
                Err(e) => {
                    warn!("Failed to remove container {}: {}", short_id(&id), e);
                    result = Err(e);
                }
            }
        }
        result
    }
}

impl Drop for DockerPostgres {
    fn drop(&mut self) {
        // Only reached when terminate never ran (panic, cancellation)
        let ids = match self.container_id.take() {
            Some(id) => vec![id],
            None if self.launched => {
                let listed = std::process::Command::new(&self.docker.binary)
                    .args(["ps", "-aq", "--filter", &format!("label={}", self.run_label())])
                    .output();
                match listed {
                    Ok(out) => container_ids(&String::from_utf8_lossy(&out.stdout)),
                    Err(e) => {
                        warn!("Failed to list containers for run {}: {}", self.run_id, e);
                        return;
                    }
                }
            }
            None => return,
        };

        for id in ids {
            warn!("Container {} dropped without cleanup, removing", short_id(&id));
            let removed = std::process::Command::new(&self.docker.binary)
                .args(["rm", "-f", "-v", &id])
                .output();
            if let Err(e) = removed {
                warn!("Failed to remove container {}: {}", short_id(&id), e);
            }
        }
    }
}

/// Number of readiness lines in a container log
pub fn count_ready_lines(logs: &str) -> usize {
    logs.lines().filter(|line| line.contains(READY_LINE)).count()
}

/// Host port from `docker port` output such as `127.0.0.1:49153`
pub fn parse_host_port(mapping: &str) -> Option<u16> {
    mapping
        .lines()
        .find_map(|line| line.trim().rsplit_once(':'))
        .and_then(|(_, port)| port.parse().ok())
}

fn container_ids(ps_output: &str) -> Vec<String> {
    ps_output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

fn short_id(id: &str) -> &str {
    &id[..id.len().min(12)]
}

fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}
