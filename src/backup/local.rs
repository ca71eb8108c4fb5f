use crate::backup::BackupStream;
use crate::error::{environment_error, AppResult};
use std::path::PathBuf;

/// Backup file on the local filesystem
#[derive(Debug, Clone)]
pub struct LocalSource {
    path: PathBuf,
}

impl LocalSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub async fn acquire(&self) -> AppResult<BackupStream> {
        let file = tokio::fs::File::open(&self.path).await.map_err(|e| {
            environment_error(format!(
                "failed to open local backup file at {}: {}",
                self.path.display(),
                e
            ))
        })?;
        Ok(Box::new(file))
    }

    pub fn identifier(&self) -> String {
        format!("local:{}", self.path.display())
    }
}
