//! Schema Snapshot Module
//!
//! Everything that compares a freshly restored schema to what was trusted before:
//! - Baseline store (last accepted snapshot per project)
//! - Snapshot diff (missing, new and changed tables)
//! - Checker framework (severity-tagged verification rules)

pub mod diff;
pub mod rules;
pub mod store;

pub use rules::CheckEngine;
pub use store::BaselineStore;
