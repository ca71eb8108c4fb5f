//! Pipeline Types - outcome of a verification run

use crate::config::BaselinePolicy;
use crate::error::{EXIT_CRITICAL, EXIT_SUCCESS, EXIT_WARNINGS};
use crate::report::Report;
use std::fmt;
use std::path::PathBuf;

/// Externally visible result of a completed run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Success,
    /// Only warning-level checks failed
    Warnings,
    /// A critical check failed or the report could not be signed
    Failed,
}

impl RunStatus {
    pub fn exit_code(self) -> i32 {
        match self {
            RunStatus::Success => EXIT_SUCCESS,
            RunStatus::Warnings => EXIT_WARNINGS,
            RunStatus::Failed => EXIT_CRITICAL,
        }
    }
}

/// What happened to the report signature
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SigningState {
    Signed,
    /// No signing key configured
    Unsigned,
    Failed(String),
}

/// What happened to the project baseline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaselineAction {
    /// No baseline existed; this run's schema became it
    Created,
    /// Refresh policy replaced it after a clean run
    Refreshed,
    /// Frozen policy left the existing baseline alone
    Kept,
    /// Refresh policy skipped the update because checks failed
    SkippedFailedChecks,
    /// Signing failed, so the baseline was not touched
    SkippedSigningFailure,
}

impl BaselineAction {
    /// Decide the baseline update; runs only after the report is persisted
    pub fn decide(
        policy: BaselinePolicy,
        baseline_exists: bool,
        failed_checks: usize,
        signing: &SigningState,
    ) -> Self {
        if matches!(signing, SigningState::Failed(_)) {
            return BaselineAction::SkippedSigningFailure;
        }
        if !baseline_exists {
            return BaselineAction::Created;
        }
        match policy {
            BaselinePolicy::Frozen => BaselineAction::Kept,
            BaselinePolicy::Refresh if failed_checks == 0 => BaselineAction::Refreshed,
            BaselinePolicy::Refresh => BaselineAction::SkippedFailedChecks,
        }
    }

    pub fn writes(self) -> bool {
        matches!(self, BaselineAction::Created | BaselineAction::Refreshed)
    }
}

impl fmt::Display for BaselineAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            BaselineAction::Created => "created from this run",
            BaselineAction::Refreshed => "refreshed from this run",
            BaselineAction::Kept => "kept unchanged (frozen policy)",
            BaselineAction::SkippedFailedChecks => "kept unchanged (checks failed)",
            BaselineAction::SkippedSigningFailure => "kept unchanged (signing failed)",
        };
        f.write_str(text)
    }
}

/// A run that reached the checking stage and persisted its report
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub report: Report,
    pub report_path: PathBuf,
    pub signing: SigningState,
    pub baseline: BaselineAction,
}

impl RunOutcome {
    pub fn status(&self) -> RunStatus {
        let summary = &self.report.summary;
        if summary.critical_failures > 0 || matches!(self.signing, SigningState::Failed(_)) {
            RunStatus::Failed
        } else if summary.warning_failures > 0 {
            RunStatus::Warnings
        } else {
            RunStatus::Success
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.status().exit_code()
    }
}
