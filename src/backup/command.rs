use crate::backup::BackupStream;
use crate::error::{environment_error, AppResult};
use std::io::Cursor;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// Backup produced on stdout by a shell command
#[derive(Debug, Clone)]
pub struct CommandSource {
    exec: String,
    timeout: Duration,
}

impl CommandSource {
    pub fn new(exec: impl Into<String>, timeout: Duration) -> Self {
        Self {
            exec: exec.into(),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run `sh -c <exec>` to completion and return its stdout
    pub async fn acquire(&self) -> AppResult<BackupStream> {
        debug!("Running backup command: {}", self.exec);
        let child = Command::new("sh")
            .arg("-c")
            .arg(&self.exec)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| environment_error(format!("failed to start backup command: {}", e)))?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                environment_error(format!(
                    "command timed out after {}s: {}",
                    self.timeout.as_secs(),
                    self.exec
                ))
            })?
            .map_err(|e| environment_error(format!("backup command failed: {}", e)))?;

        if !output.status.success() {
            return Err(environment_error(format!(
                "command failed: {}\nstderr: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        debug!("Backup command produced {} bytes", output.stdout.len());
        Ok(Box::new(Cursor::new(output.stdout)))
    }

    pub fn identifier(&self) -> String {
        format!("command:{}", self.exec)
    }
}
