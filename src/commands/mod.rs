//! CLI command handlers
//!
//! Each handler returns the process exit code for a run that completed;
//! errors that abort a command are mapped by `AppError::exit_code`.

pub mod keygen;
pub mod report;
pub mod verify;
pub mod version;
