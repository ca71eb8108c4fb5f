//! Restore Module
//!
//! Loads a backup artifact into a disposable database instance:
//! - Ephemeral instance abstraction and its Docker implementation
//! - Restore orchestrator (staging, primary/fallback restore, extraction, cleanup)

pub mod container;
pub mod postgres;

pub use container::{DockerPostgres, EphemeralInstance};
pub use postgres::RestoreOrchestrator;
