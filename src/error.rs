//! Error handling module
//!
//! Provides the error taxonomy for a verification run and the mapping from
//! each error class to the process exit code.

use thiserror::Error;

/// Exit code: every check passed
pub const EXIT_SUCCESS: i32 = 0;
/// Exit code: run completed, only warning-level checks failed
pub const EXIT_WARNINGS: i32 = 1;
/// Exit code: a critical check failed, or the backup could not be restored
pub const EXIT_CRITICAL: i32 = 2;
/// Exit code: malformed or missing settings
pub const EXIT_CONFIG: i32 = 3;
/// Exit code: the environment (docker, network, ephemeral instance) failed
pub const EXIT_ENVIRONMENT: i32 = 4;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Environment error: {0}")]
    Environment(String),

    #[error("Restore failed: {0}")]
    Restore(String),

    #[error("Database error: {0}")]
    Database(#[from] tokio_postgres::Error),

    #[error("Pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Signing error: {0}")]
    Signing(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Process exit code for an error that aborted the run
    pub fn exit_code(&self) -> i32 {
        match self {
            AppError::Config(_) => EXIT_CONFIG,
            AppError::Environment(_) | AppError::Pool(_) => EXIT_ENVIRONMENT,
            AppError::Restore(_) => EXIT_CRITICAL,
            AppError::Database(_)
            | AppError::Io(_)
            | AppError::Serialization(_)
            | AppError::Signing(_)
            | AppError::NotFound(_)
            | AppError::Internal(_) => EXIT_CRITICAL,
        }
    }

    /// Prefix the message with the pipeline stage that produced it
    pub fn in_stage(self, stage: &str) -> Self {
        match self {
            AppError::Config(msg) => AppError::Config(format!("{}: {}", stage, msg)),
            AppError::Environment(msg) => AppError::Environment(format!("{}: {}", stage, msg)),
            AppError::Restore(msg) => AppError::Restore(format!("{}: {}", stage, msg)),
            AppError::Signing(msg) => AppError::Signing(format!("{}: {}", stage, msg)),
            AppError::NotFound(msg) => AppError::NotFound(format!("{}: {}", stage, msg)),
            AppError::Internal(msg) => AppError::Internal(format!("{}: {}", stage, msg)),
            AppError::Database(e) => AppError::Internal(format!("{}: database error: {}", stage, e)),
            AppError::Pool(e) => AppError::Environment(format!("{}: pool error: {}", stage, e)),
            AppError::Io(e) => AppError::Internal(format!("{}: I/O error: {}", stage, e)),
            AppError::Serialization(e) => {
                AppError::Internal(format!("{}: serialization error: {}", stage, e))
            }
        }
    }
}

/// Result type alias used across the crate
pub type AppResult<T> = Result<T, AppError>;

/// Helper function to create a configuration error
pub fn config_error(msg: impl Into<String>) -> AppError {
    AppError::Config(msg.into())
}

/// Helper function to create an environment error
pub fn environment_error(msg: impl Into<String>) -> AppError {
    AppError::Environment(msg.into())
}
