//! Restore Orchestrator
//!
//! Stages the backup stream on disk, copies it into the ephemeral instance
//! and loads it with `pg_restore`, falling back to `psql` for plain SQL
//! dumps. Extraction is only possible after a successful restore.

use crate::backup::BackupStream;
use crate::error::{AppError, AppResult};
use crate::introspection::{self, MetricsSnapshot, SchemaSnapshot};
use crate::restore::container::{EphemeralInstance, ExecOutput};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempPath;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Where the staged artifact lands inside the instance
pub const CONTAINER_BACKUP_PATH: &str = "/tmp/backup.dump";

const STAGING_BUFFER: usize = 64 * 1024;

/// Drives one restore into one ephemeral instance
pub struct RestoreOrchestrator<I: EphemeralInstance> {
    instance: I,
    user: String,
    db_name: String,
    temp_dir: PathBuf,
    staged: Option<TempPath>,
    catalog: Option<I::Catalog>,
    restore_duration: Option<Duration>,
}

impl<I: EphemeralInstance> RestoreOrchestrator<I> {
    pub fn new(
        instance: I,
        user: impl Into<String>,
        db_name: impl Into<String>,
        temp_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            instance,
            user: user.into(),
            db_name: db_name.into(),
            temp_dir: temp_dir.into(),
            staged: None,
            catalog: None,
            restore_duration: None,
        }
    }

    /// Provision the instance and load the artifact into it
    pub async fn restore(&mut self, stream: BackupStream) -> AppResult<()> {
        self.instance
            .provision()
            .await
            .map_err(|e| e.in_stage("provision"))?;

        let staged = self
            .stage(stream)
            .await
            .map_err(|e| e.in_stage("stage artifact"))?;
        let staged_path = staged.to_path_buf();
        self.staged = Some(staged);

        self.instance
            .copy_in(&staged_path, CONTAINER_BACKUP_PATH)
            .await
            .map_err(|e| e.in_stage("copy artifact"))?;

        let duration = self.load().await?;
        self.restore_duration = Some(duration);

        let catalog = self
            .instance
            .connect()
            .await
            .map_err(|e| e.in_stage("connect"))?;
        self.catalog = Some(catalog);
        Ok(())
    }

    /// Stream the artifact to a temp file, hashing it on the way
    async fn stage(&self, mut stream: BackupStream) -> AppResult<TempPath> {
        let temp = tempfile::Builder::new()
            .prefix("restorable-backup-")
            .suffix(".dump")
            .tempfile_in(&self.temp_dir)?;
        let mut file = tokio::fs::File::from_std(temp.reopen()?);
        let path = temp.into_temp_path();

        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; STAGING_BUFFER];
        let mut total: u64 = 0;
        loop {
            let n = stream.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            file.write_all(&buf[..n]).await?;
            total += n as u64;
        }
        file.flush().await?;

        let digest: String = hasher
            .finalize()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect();
        info!("Staged backup artifact: {} bytes, sha256 {}", total, digest);
        Ok(path)
    }

    /// Primary then fallback restore; returns the successful attempt's duration
    async fn load(&self) -> AppResult<Duration> {
        info!("Attempting restore with pg_restore");
        let started = Instant::now();
        let primary = self
            .instance
            .exec(&[
                "pg_restore",
                "--username",
                &self.user,
                "--dbname",
                &self.db_name,
                "--no-password",
                "--verbose",
                "--no-owner",
                CONTAINER_BACKUP_PATH,
            ])
            .await
            .map_err(|e| e.in_stage("pg_restore"))?;
        let primary_duration = started.elapsed();
        debug!("pg_restore output:\n{}", primary.output);

        if primary.success() {
            info!("Restore completed with pg_restore in {:?}", primary_duration);
            return Ok(primary_duration);
        }

        warn!(
            "pg_restore failed (exit {}), attempting restore with psql",
            primary.exit_code
        );
        let started = Instant::now();
        let fallback = self
            .instance
            .exec(&[
                "psql",
                "--username",
                &self.user,
                "--dbname",
                &self.db_name,
                "--no-password",
                // Any failing statement must fail the load as a whole
                "--set",
                "ON_ERROR_STOP=1",
                "--single-transaction",
                "--file",
                CONTAINER_BACKUP_PATH,
            ])
            .await
            .map_err(|e| e.in_stage("psql"))?;
        let fallback_duration = started.elapsed();
        debug!("psql output:\n{}", fallback.output);

        if !fallback.success() {
            return Err(both_failed(&primary, &fallback));
        }

        info!("Restore completed with psql in {:?}", fallback_duration);
        Ok(fallback_duration)
    }

    fn catalog(&self) -> AppResult<&I::Catalog> {
        self.catalog.as_ref().ok_or_else(|| {
            AppError::Internal("database connection not established; call restore first".to_string())
        })
    }

    pub async fn extract_schema(&self) -> AppResult<SchemaSnapshot> {
        introspection::extract_schema(self.catalog()?)
            .await
            .map_err(|e| e.in_stage("extract schema"))
    }

    pub async fn extract_metrics(&self) -> AppResult<MetricsSnapshot> {
        let duration = self.restore_duration.unwrap_or_default();
        introspection::extract_metrics(self.catalog()?, duration)
            .await
            .map_err(|e| e.in_stage("extract metrics"))
    }

    /// Drop connections, remove the staging file and tear the instance down.
    ///
    /// Safe after partial failure and on repeated calls.
    pub async fn cleanup(&mut self) -> AppResult<()> {
        self.catalog = None;

        let mut first_error = None;
        if let Some(staged) = self.staged.take() {
            let path = staged.to_path_buf();
            if let Err(e) = staged.close() {
                warn!("Failed to remove staging file {}: {}", path.display(), e);
                first_error = Some(AppError::Io(e));
            }
        }

        if let Err(e) = self.instance.terminate().await {
            first_error.get_or_insert(e.in_stage("cleanup"));
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    #[cfg(test)]
    pub(crate) fn staged_path(&self) -> Option<&std::path::Path> {
        self.staged.as_deref()
    }

    #[cfg(test)]
    pub(crate) fn instance(&self) -> &I {
        &self.instance
    }
}

fn both_failed(primary: &ExecOutput, fallback: &ExecOutput) -> AppError {
    AppError::Restore(format!(
        "all restore methods failed.\n\npg_restore (exit {}):\n{}\n\npsql (exit {}):\n{}",
        primary.exit_code, primary.output, fallback.exit_code, fallback.output
    ))
}
