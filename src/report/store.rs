//! Report Store
//!
//! One file per run, named `<YYYYmmdd_HHMMSS>_<id>.json`, written once and
//! never updated in place. Files appear complete or not at all: content goes
//! to a hidden `.tmp` sibling that is renamed into place.

use crate::error::{AppError, AppResult};
use crate::report::model::Report;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Listing entry for a stored report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub project_id: String,
    pub success: bool,
    pub signed: bool,
    pub path: PathBuf,
}

/// Directory of persisted reports
pub struct ReportStore {
    dir: PathBuf,
}

impl ReportStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn file_name(report: &Report) -> String {
        format!("{}_{}.json", report.timestamp.format("%Y%m%d_%H%M%S"), report.id)
    }

    /// Persist a report; fails rather than replacing an existing file
    pub async fn write(&self, report: &Report) -> AppResult<PathBuf> {
        fs::create_dir_all(&self.dir).await.map_err(|e| {
            AppError::Internal(format!(
                "failed to create report directory {}: {}",
                self.dir.display(),
                e
            ))
        })?;

        let name = Self::file_name(report);
        let path = self.dir.join(&name);
        if fs::try_exists(&path).await? {
            return Err(AppError::Internal(format!(
                "report {} already exists",
                path.display()
            )));
        }
        let data = serde_json::to_vec_pretty(report)?;

        let temp = self.dir.join(format!(".{}.tmp", name));
        if let Err(e) = Self::write_temp(&temp, &data).await {
            let _ = fs::remove_file(&temp).await;
            return Err(AppError::Internal(format!(
                "failed to write report {}: {}",
                path.display(),
                e
            )));
        }
        fs::rename(&temp, &path).await.map_err(|e| {
            AppError::Internal(format!("failed to move report into {}: {}", path.display(), e))
        })?;
        Ok(path)
    }

    async fn write_temp(temp: &Path, data: &[u8]) -> std::io::Result<()> {
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(temp)
            .await?;
        file.write_all(data).await?;
        file.flush().await?;
        file.sync_all().await
    }

    pub async fn load(path: &Path) -> AppResult<Report> {
        let data = fs::read(path).await.map_err(|e| {
            AppError::Internal(format!("failed to read report {}: {}", path.display(), e))
        })?;
        serde_json::from_slice(&data).map_err(|e| {
            AppError::Internal(format!("failed to parse report {}: {}", path.display(), e))
        })
    }

    /// All readable reports, newest first
    pub async fn list(&self) -> AppResult<Vec<ReportEntry>> {
        let mut dir = match fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().map_or(true, |ext| ext != "json") || !entry.file_type().await?.is_file() {
                continue;
            }
            match Self::load(&path).await {
                Ok(report) => entries.push(ReportEntry {
                    id: report.id,
                    timestamp: report.timestamp,
                    project_id: report.project_id,
                    success: report.summary.success,
                    signed: report.signature.is_some(),
                    path,
                }),
                Err(e) => debug!("Skipping unreadable report: {}", e),
            }
        }

        entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| b.id.cmp(&a.id)));
        Ok(entries)
    }

    /// Resolve a report by exact id, unique id prefix, then file name fragment
    pub async fn find(&self, query: &str) -> AppResult<(Report, PathBuf)> {
        let entries = self.list().await?;

        if let Some(entry) = entries.iter().find(|e| e.id == query) {
            return Ok((Self::load(&entry.path).await?, entry.path.clone()));
        }

        let prefixed: Vec<&ReportEntry> = entries.iter().filter(|e| e.id.starts_with(query)).collect();
        match prefixed.len() {
            1 => return Ok((Self::load(&prefixed[0].path).await?, prefixed[0].path.clone())),
            n if n > 1 => {
                return Err(AppError::NotFound(format!(
                    "ambiguous report ID {:?} matches {} reports",
                    query, n
                )))
            }
            _ => {}
        }

        let by_name: Vec<&ReportEntry> = entries
            .iter()
            .filter(|e| {
                e.path
                    .file_name()
                    .map_or(false, |name| name.to_string_lossy().contains(query))
            })
            .collect();
        match by_name.as_slice() {
            [entry] => Ok((Self::load(&entry.path).await?, entry.path.clone())),
            _ => Err(AppError::NotFound(format!("report not found: {}", query))),
        }
    }
}

/// Byte count for display (`1.50 MB`)
pub fn format_bytes(bytes: i64) -> String {
    const KB: i64 = 1024;
    const MB: i64 = 1024 * KB;
    const GB: i64 = 1024 * MB;

    match bytes {
        b if b >= GB => format!("{:.2} GB", b as f64 / GB as f64),
        b if b >= MB => format!("{:.2} MB", b as f64 / MB as f64),
        b if b >= KB => format!("{:.2} KB", b as f64 / KB as f64),
        b => format!("{} bytes", b),
    }
}
