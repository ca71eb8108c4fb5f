//! Application configuration module
//!
//! Loads the YAML settings file, applies `RESTORABLE__*` environment
//! overrides and validates the result before any run starts.

use crate::error::{config_error, AppError, AppResult};
use config::{Config, Environment, File, FileFormat};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use validator::Validate;

/// Project ids name the baseline file, so they must be path-safe
pub static PROJECT_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*$").expect("valid project id pattern"));

/// Environment variable that points at an alternative config file
pub const CONFIG_PATH_ENV: &str = "RESTORABLE_CONFIG";
/// Config file format version understood by this build
pub const CONFIG_VERSION: u32 = 1;

/// Project identity
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ProjectConfig {
    #[validate(regex(path = *PROJECT_ID_RE, message = "project id must be alphanumeric with . _ -"))]
    pub id: String,
    #[validate(length(min = 1, message = "project name must not be empty"))]
    pub name: String,
}

/// Local machine settings
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CliConfig {
    pub machine_id: Option<String>,
    pub report_dir: Option<PathBuf>,
    pub baseline_dir: Option<PathBuf>,
    pub temp_dir: Option<PathBuf>,
}

/// `backup.local`
#[derive(Debug, Clone, Deserialize)]
pub struct LocalBackupConfig {
    pub path: PathBuf,
}

/// `backup.command`
#[derive(Debug, Clone, Deserialize)]
pub struct CommandBackupConfig {
    pub exec: String,
    pub timeout_seconds: Option<u64>,
}

/// `backup.s3`
#[derive(Debug, Clone, Deserialize)]
pub struct S3BackupConfig {
    /// Custom endpoint (MinIO and friends); implies path-style addressing
    pub endpoint: Option<String>,
    pub bucket: String,
    #[serde(default = "default_s3_region")]
    pub region: String,
    pub access_key_env: String,
    pub secret_key_env: String,
    /// Object key, or a prefix ending in `/` to take the newest object under it
    pub prefix: String,
}

/// Where the backup artifact comes from
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct BackupConfig {
    /// Kind string selecting the source variant
    #[validate(length(min = 1, message = "backup.source must be set"))]
    pub source: String,
    pub local: Option<LocalBackupConfig>,
    pub command: Option<CommandBackupConfig>,
    pub s3: Option<S3BackupConfig>,
}

/// Artifact decryption. The identity comes from `private_key_path` when
/// set, otherwise from the environment variable named by `private_key_env`.
#[derive(Debug, Clone, Deserialize)]
pub struct EncryptionConfig {
    pub method: String,
    pub private_key_path: Option<PathBuf>,
    pub private_key_env: Option<String>,
}

/// Ephemeral instance credentials and image
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct RestoreConfig {
    pub docker_image: Option<String>,
    #[serde(default = "default_db_user")]
    #[validate(length(min = 1))]
    pub user: String,
    pub password_env: Option<String>,
    #[serde(default = "default_db_name")]
    #[validate(length(min = 1))]
    pub db_name: String,
}

impl Default for RestoreConfig {
    fn default() -> Self {
        Self {
            docker_image: None,
            user: default_db_user(),
            password_env: None,
            db_name: default_db_name(),
        }
    }
}

impl RestoreConfig {
    /// Password for the ephemeral instance.
    ///
    /// A configured `password_env` must be present; without one a random
    /// password is generated since the instance never outlives the run.
    pub fn resolve_password(&self) -> AppResult<String> {
        match &self.password_env {
            Some(var) => std::env::var(var).map_err(|_| {
                config_error(format!("database password environment variable {} not set", var))
            }),
            None => Ok(random_password()),
        }
    }
}

/// Database engine identity
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct DatabaseConfig {
    #[serde(rename = "type")]
    pub db_type: String,
    #[validate(range(min = 9, max = 99, message = "unsupported major version"))]
    pub major_version: u32,
    #[serde(default)]
    #[validate(nested)]
    pub restore: RestoreConfig,
}

impl DatabaseConfig {
    /// Image used for the ephemeral instance
    pub fn docker_image(&self) -> String {
        self.restore
            .docker_image
            .clone()
            .unwrap_or_else(|| format!("{}:{}", self.db_type, self.major_version))
    }
}

/// When to pull the engine image
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PullPolicy {
    #[default]
    Missing,
    Always,
}

/// Container runtime settings
#[derive(Debug, Clone, Deserialize)]
pub struct DockerConfig {
    #[serde(default = "default_docker_binary")]
    pub binary: String,
    pub network: Option<String>,
    #[serde(default)]
    pub pull_policy: PullPolicy,
    /// Deadline for the whole run
    #[serde(default = "default_timeout_minutes")]
    pub timeout_minutes: u64,
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_seconds: u64,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            binary: default_docker_binary(),
            network: None,
            pull_policy: PullPolicy::default(),
            timeout_minutes: default_timeout_minutes(),
            startup_timeout_seconds: default_startup_timeout(),
        }
    }
}

/// What happens to the baseline after a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BaselinePolicy {
    /// Save only when no baseline exists yet
    #[default]
    Frozen,
    /// Overwrite after every run with zero failed checks
    Refresh,
}

/// `verification.row_counts`
#[derive(Debug, Clone, Deserialize)]
pub struct RowCountsConfig {
    #[serde(default = "default_warn_threshold")]
    pub warn_threshold_percent: u32,
}

impl Default for RowCountsConfig {
    fn default() -> Self {
        Self {
            warn_threshold_percent: default_warn_threshold(),
        }
    }
}

/// Checker selection and thresholds
#[derive(Debug, Clone, Deserialize)]
pub struct VerificationConfig {
    #[serde(default = "default_checks")]
    pub checks: Vec<String>,
    #[serde(default)]
    pub baseline_policy: BaselinePolicy,
    #[serde(default)]
    pub row_counts: RowCountsConfig,
    #[serde(default = "default_min_non_empty_tables")]
    pub min_non_empty_tables: usize,
    #[serde(default)]
    pub min_total_rows: i64,
    /// Zero disables the limit
    #[serde(default)]
    pub max_restore_duration_seconds: u64,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            checks: default_checks(),
            baseline_policy: BaselinePolicy::default(),
            row_counts: RowCountsConfig::default(),
            min_non_empty_tables: default_min_non_empty_tables(),
            min_total_rows: 0,
            max_restore_duration_seconds: 0,
        }
    }
}

/// Report signing key
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SigningConfig {
    pub private_key_path: Option<PathBuf>,
}

impl SigningConfig {
    /// `foo.key` pairs with `foo.pub`
    pub fn public_key_path(&self) -> Option<PathBuf> {
        self.private_key_path.as_deref().map(public_key_path_for)
    }
}

/// Complete application settings
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct Settings {
    #[serde(default = "default_config_version")]
    pub version: u32,
    #[validate(nested)]
    pub project: ProjectConfig,
    #[serde(default)]
    pub cli: CliConfig,
    #[validate(nested)]
    pub backup: BackupConfig,
    pub encryption: Option<EncryptionConfig>,
    #[validate(nested)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub docker: DockerConfig,
    #[serde(default)]
    pub verification: VerificationConfig,
    #[serde(default)]
    pub signing: SigningConfig,
}

impl Settings {
    /// Load settings from the config file and environment.
    ///
    /// Resolution order for the file: explicit path, `RESTORABLE_CONFIG`,
    /// then `$HOME/.restorable/config.yaml`.
    pub fn load(path: Option<&Path>) -> AppResult<Self> {
        // Load .env file if it exists (ignore errors if file not found)
        let _ = dotenvy::dotenv();

        let path = match path {
            Some(p) => p.to_path_buf(),
            None => std::env::var_os(CONFIG_PATH_ENV)
                .map(PathBuf::from)
                .unwrap_or_else(|| restorable_home().join("config.yaml")),
        };

        if !path.exists() {
            return Err(config_error(format!(
                "config file not found at {}. Create one or pass --config",
                path.display()
            )));
        }

        let builder = Config::builder()
            .add_source(File::from(path.as_path()).format(FileFormat::Yaml).required(true))
            .add_source(
                Environment::with_prefix("RESTORABLE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            );

        let settings = Self::from_builder(builder)?;
        tracing::debug!("Loaded configuration from {}", path.display());
        Ok(settings)
    }

    /// Parse settings from an in-memory YAML document
    #[cfg(test)]
    pub(crate) fn from_yaml(yaml: &str) -> AppResult<Self> {
        Self::from_builder(Config::builder().add_source(File::from_str(yaml, FileFormat::Yaml)))
    }

    fn from_builder(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> AppResult<Self> {
        let settings: Settings = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| config_error(format!("failed to parse configuration: {}", e)))?;

        settings
            .validate()
            .map_err(|e| config_error(format!("invalid configuration: {}", e)))?;
        settings.check_supported()?;
        Ok(settings)
    }

    fn check_supported(&self) -> AppResult<()> {
        if self.version != CONFIG_VERSION {
            return Err(config_error(format!(
                "unsupported config version {} (expected {})",
                self.version, CONFIG_VERSION
            )));
        }
        if self.database.db_type != "postgres" {
            return Err(config_error(format!(
                "unsupported database type: {}",
                self.database.db_type
            )));
        }
        if let Some(enc) = &self.encryption {
            if enc.method != "age" {
                return Err(config_error(format!(
                    "unsupported encryption method: {}",
                    enc.method
                )));
            }
        }
        if self.docker.timeout_minutes == 0 || self.docker.startup_timeout_seconds == 0 {
            return Err(config_error("docker timeouts must be positive"));
        }
        Ok(())
    }

    pub fn machine_id(&self) -> String {
        self.cli
            .machine_id
            .clone()
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| "unknown".to_string())
    }

    pub fn report_dir(&self) -> PathBuf {
        self.cli
            .report_dir
            .clone()
            .unwrap_or_else(|| restorable_home().join("reports"))
    }

    pub fn baseline_dir(&self) -> PathBuf {
        self.cli
            .baseline_dir
            .clone()
            .unwrap_or_else(|| restorable_home().join("schemas"))
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.cli.temp_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

/// `$HOME/.restorable`
pub fn restorable_home() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".restorable")
}

/// Replace a trailing `.key` with `.pub`, or append `.pub`
pub fn public_key_path_for(private: &Path) -> PathBuf {
    match private.extension() {
        Some(ext) if ext == "key" => private.with_extension("pub"),
        _ => {
            let mut s = private.as_os_str().to_os_string();
            s.push(".pub");
            PathBuf::from(s)
        }
    }
}

fn random_password() -> String {
    use rand::distributions::Alphanumeric;
    use rand::Rng;
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect()
}

fn default_config_version() -> u32 {
    CONFIG_VERSION
}

fn default_s3_region() -> String {
    "us-east-1".to_string()
}

fn default_db_user() -> String {
    "postgres".to_string()
}

fn default_db_name() -> String {
    "restorable_verify".to_string()
}

fn default_docker_binary() -> String {
    "docker".to_string()
}

fn default_timeout_minutes() -> u64 {
    30
}

fn default_startup_timeout() -> u64 {
    300
}

fn default_warn_threshold() -> u32 {
    5
}

fn default_min_non_empty_tables() -> usize {
    1
}

fn default_checks() -> Vec<String> {
    [
        "tables_exist",
        "table_count",
        "new_tables",
        "column_changes",
        "row_counts",
        "non_empty_tables",
        "total_row_count",
        "restore_duration",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
