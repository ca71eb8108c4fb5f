//! Baseline Store
//!
//! Persists the last trusted schema snapshot per project, one JSON file each.
//! Last write wins; there is no history.

use crate::config::PROJECT_ID_RE;
use crate::error::{config_error, AppError, AppResult};
use crate::introspection::SchemaSnapshot;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::info;

/// File-backed store of baseline snapshots
pub struct BaselineStore {
    base_path: PathBuf,
}

impl BaselineStore {
    /// Open the store, creating its directory when missing
    pub async fn open(base_path: impl Into<PathBuf>) -> AppResult<Self> {
        let base_path = base_path.into();
        fs::create_dir_all(&base_path).await.map_err(|e| {
            AppError::Internal(format!(
                "failed to create baseline directory {}: {}",
                base_path.display(),
                e
            ))
        })?;
        Ok(Self { base_path })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn path_for(&self, project_id: &str) -> AppResult<PathBuf> {
        if !PROJECT_ID_RE.is_match(project_id) {
            return Err(config_error(format!("invalid project id: {:?}", project_id)));
        }
        Ok(self.base_path.join(format!("{}.json", project_id)))
    }

    /// Persist a snapshot as the project's baseline, replacing any previous one
    pub async fn save(&self, project_id: &str, snapshot: &SchemaSnapshot) -> AppResult<()> {
        let path = self.path_for(project_id)?;
        let data = serde_json::to_vec_pretty(snapshot)?;

        // Write beside the target and rename so a crash never leaves half a baseline
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, &data).await?;
        fs::rename(&tmp, &path).await?;

        info!(
            "Saved baseline for project {}: {} tables",
            project_id,
            snapshot.tables.len()
        );
        Ok(())
    }

    /// Load the baseline for a project; `None` means first run
    pub async fn load(&self, project_id: &str) -> AppResult<Option<SchemaSnapshot>> {
        let path = self.path_for(project_id)?;
        let data = match fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(AppError::Internal(format!(
                    "failed to read baseline {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        let snapshot = serde_json::from_slice(&data).map_err(|e| {
            AppError::Internal(format!("failed to parse baseline {}: {}", path.display(), e))
        })?;
        Ok(Some(snapshot))
    }

    /// Whether a baseline has been recorded for the project
    pub async fn exists(&self, project_id: &str) -> AppResult<bool> {
        let path = self.path_for(project_id)?;
        Ok(fs::try_exists(&path).await?)
    }
}
