//! Backup Acquisition Module
//!
//! Backup sources selected by the `backup.source` kind string, and the
//! optional age decryptor that wraps their stream.

pub mod command;
pub mod decrypt;
pub mod local;
pub mod s3;

pub use command::CommandSource;
pub use decrypt::AgeDecryptor;
pub use local::LocalSource;
pub use s3::S3Source;

use crate::config::BackupConfig;
use crate::error::{config_error, AppResult};
use std::time::Duration;
use tokio::io::AsyncRead;

/// A backup artifact as a byte stream
pub type BackupStream = Box<dyn AsyncRead + Send + Unpin>;

/// Default bound on a `command` source
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(600);

/// Configured backup source
#[derive(Debug, Clone)]
pub enum BackupSource {
    Local(LocalSource),
    Command(CommandSource),
    S3(S3Source),
}

impl BackupSource {
    /// Build the source named by `backup.source`; unknown kinds fail loudly
    pub fn from_config(config: &BackupConfig) -> AppResult<Self> {
        match config.source.as_str() {
            "local" => {
                let local = config
                    .local
                    .as_ref()
                    .filter(|l| !l.path.as_os_str().is_empty())
                    .ok_or_else(|| config_error("backup source is 'local' but path is not configured"))?;
                Ok(Self::Local(LocalSource::new(local.path.clone())))
            }
            "command" => {
                let command = config
                    .command
                    .as_ref()
                    .filter(|c| !c.exec.trim().is_empty())
                    .ok_or_else(|| config_error("backup source is 'command' but exec is not configured"))?;
                let timeout = command
                    .timeout_seconds
                    .map(Duration::from_secs)
                    .unwrap_or(DEFAULT_COMMAND_TIMEOUT);
                Ok(Self::Command(CommandSource::new(command.exec.clone(), timeout)))
            }
            "s3" => {
                let s3 = config
                    .s3
                    .as_ref()
                    .filter(|s| !s.bucket.is_empty() && !s.prefix.is_empty())
                    .ok_or_else(|| config_error("backup source is 's3' but bucket or prefix is not configured"))?;
                Ok(Self::S3(S3Source::from_config(s3)?))
            }
            other => Err(config_error(format!("unsupported backup source type: {}", other))),
        }
    }

    /// Retrieve the artifact
    pub async fn acquire(&self) -> AppResult<BackupStream> {
        match self {
            Self::Local(source) => source.acquire().await,
            Self::Command(source) => source.acquire().await,
            Self::S3(source) => source.acquire().await,
        }
    }

    /// Source description recorded in the report
    pub fn identifier(&self) -> String {
        match self {
            Self::Local(source) => source.identifier(),
            Self::Command(source) => source.identifier(),
            Self::S3(source) => source.identifier(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CommandBackupConfig, LocalBackupConfig};
    use crate::error::AppError;

    fn backup(source: &str) -> BackupConfig {
        BackupConfig {
            source: source.to_string(),
            local: None,
            command: None,
            s3: None,
        }
    }

    #[test]
    fn test_local_source_from_config() {
        let mut cfg = backup("local");
        cfg.local = Some(LocalBackupConfig {
            path: "/var/backups/app.dump".into(),
        });
        let source = BackupSource::from_config(&cfg).unwrap();
        assert_eq!(source.identifier(), "local:/var/backups/app.dump");
    }

    #[test]
    fn test_command_source_defaults_timeout() {
        let mut cfg = backup("command");
        cfg.command = Some(CommandBackupConfig {
            exec: "pg_dump -Fc app".into(),
            timeout_seconds: None,
        });
        match BackupSource::from_config(&cfg).unwrap() {
            BackupSource::Command(c) => {
                assert_eq!(c.timeout(), DEFAULT_COMMAND_TIMEOUT);
                assert_eq!(c.identifier(), "command:pg_dump -Fc app");
            }
            other => panic!("unexpected source {:?}", other),
        }
    }

    #[test]
    fn test_missing_section_and_unknown_kind_are_config_errors() {
        assert!(matches!(
            BackupSource::from_config(&backup("local")),
            Err(AppError::Config(_))
        ));
        assert!(matches!(
            BackupSource::from_config(&backup("s3")),
            Err(AppError::Config(_))
        ));
        let err = BackupSource::from_config(&backup("ftp")).unwrap_err();
        assert!(err.to_string().contains("unsupported backup source type: ftp"));
    }
}
