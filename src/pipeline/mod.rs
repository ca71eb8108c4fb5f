//! Verification Pipeline Module
//!
//! One linear run per invocation:
//! acquire → decrypt → restore → extract → check → report → sign →
//! persist → baseline update → cleanup.
//!
//! The whole run is bounded by a single deadline; teardown of the ephemeral
//! instance happens on every exit path.

pub mod orchestrator;
pub mod types;

pub use orchestrator::VerifyPipeline;
pub use types::{RunOutcome, SigningState};
