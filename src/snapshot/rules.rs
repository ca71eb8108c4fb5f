//! Checker Framework
//!
//! Stateless rules evaluated against the restored schema, the project
//! baseline and the run's metrics. Each checker produces exactly one
//! severity-tagged result; the engine runs them in configured order.

use crate::config::VerificationConfig;
use crate::error::{config_error, AppResult};
use crate::introspection::{MetricsSnapshot, SchemaSnapshot};
use crate::snapshot::diff::{ChangeType, DiffEngine};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Check severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    /// Failure makes the run unsuccessful
    Critical,
    Warning,
    Info,
}

impl std::fmt::Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(match self {
            Level::Critical => "critical",
            Level::Warning => "warning",
            Level::Info => "info",
        })
    }
}

/// Outcome of one checker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: String,
    pub level: Level,
    pub passed: bool,
    pub message: String,
}

impl CheckResult {
    fn pass(name: &str, level: Level, message: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            level,
            passed: true,
            message: message.into(),
        }
    }

    fn fail(name: &str, level: Level, message: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            level,
            passed: false,
            message: message.into(),
        }
    }
}

/// A verification rule
pub trait Checker: Send + Sync {
    /// Kind string this checker is selected by
    fn kind(&self) -> &'static str;

    fn check(
        &self,
        current: &SchemaSnapshot,
        baseline: Option<&SchemaSnapshot>,
        metrics: Option<&MetricsSnapshot>,
    ) -> CheckResult;
}

const NO_BASELINE: &str = "No baseline schema available (first verification run)";

/// Every baseline table must still exist
pub struct TablesExistChecker;

impl Checker for TablesExistChecker {
    fn kind(&self) -> &'static str {
        "tables_exist"
    }

    fn check(
        &self,
        current: &SchemaSnapshot,
        baseline: Option<&SchemaSnapshot>,
        _metrics: Option<&MetricsSnapshot>,
    ) -> CheckResult {
        let Some(baseline) = baseline else {
            return CheckResult::pass(self.kind(), Level::Critical, NO_BASELINE);
        };

        let missing = DiffEngine::diff(baseline, current).missing_tables;
        if missing.is_empty() {
            CheckResult::pass(
                self.kind(),
                Level::Critical,
                format!("All {} expected tables present", baseline.tables.len()),
            )
        } else {
            CheckResult::fail(
                self.kind(),
                Level::Critical,
                format!("Missing {} tables: {}", missing.len(), missing.join(", ")),
            )
        }
    }
}

/// Growth passes, shrinkage fails
pub struct TableCountChecker;

impl Checker for TableCountChecker {
    fn kind(&self) -> &'static str {
        "table_count"
    }

    fn check(
        &self,
        current: &SchemaSnapshot,
        baseline: Option<&SchemaSnapshot>,
        _metrics: Option<&MetricsSnapshot>,
    ) -> CheckResult {
        let now = current.tables.len();
        let Some(baseline) = baseline else {
            return CheckResult::pass(
                self.kind(),
                Level::Warning,
                format!("Found {} tables (no baseline for comparison)", now),
            );
        };

        let before = baseline.tables.len();
        match now.cmp(&before) {
            std::cmp::Ordering::Equal => CheckResult::pass(
                self.kind(),
                Level::Warning,
                format!("Table count matches baseline: {} tables", now),
            ),
            std::cmp::Ordering::Greater => CheckResult::pass(
                self.kind(),
                Level::Warning,
                format!("Table count increased: {} tables (+{} from baseline)", now, now - before),
            ),
            std::cmp::Ordering::Less => CheckResult::fail(
                self.kind(),
                Level::Warning,
                format!("Table count decreased: {} tables (-{} from baseline)", now, before - now),
            ),
        }
    }
}

/// Reports tables added since the baseline; never fails
pub struct NewTablesChecker;

impl Checker for NewTablesChecker {
    fn kind(&self) -> &'static str {
        "new_tables"
    }

    fn check(
        &self,
        current: &SchemaSnapshot,
        baseline: Option<&SchemaSnapshot>,
        _metrics: Option<&MetricsSnapshot>,
    ) -> CheckResult {
        let Some(baseline) = baseline else {
            return CheckResult::pass(self.kind(), Level::Info, NO_BASELINE);
        };

        let added = DiffEngine::diff(baseline, current).new_tables;
        let message = if added.is_empty() {
            "No new tables detected".to_string()
        } else {
            format!("Found {} new tables: {}", added.len(), added.join(", "))
        };
        CheckResult::pass(self.kind(), Level::Info, message)
    }
}

/// Dropped columns and type/nullability changes on surviving tables
pub struct ColumnChangesChecker;

impl Checker for ColumnChangesChecker {
    fn kind(&self) -> &'static str {
        "column_changes"
    }

    fn check(
        &self,
        current: &SchemaSnapshot,
        baseline: Option<&SchemaSnapshot>,
        _metrics: Option<&MetricsSnapshot>,
    ) -> CheckResult {
        let Some(baseline) = baseline else {
            return CheckResult::pass(self.kind(), Level::Warning, NO_BASELINE);
        };

        let diff = DiffEngine::diff(baseline, current);
        let breaking: Vec<String> = diff
            .breaking_column_changes()
            .map(|c| format!("{} ({})", c.object_path, c.description))
            .collect();
        let added = diff
            .column_changes
            .iter()
            .filter(|c| c.change_type == ChangeType::Added)
            .count();

        if breaking.is_empty() {
            CheckResult::pass(
                self.kind(),
                Level::Warning,
                format!("No column changes on existing tables ({} columns added)", added),
            )
        } else {
            CheckResult::fail(
                self.kind(),
                Level::Warning,
                format!("{} column changes: {}", breaking.len(), breaking.join("; ")),
            )
        }
    }
}

/// Row-count comparison against the baseline.
///
/// Baselines only hold schema, so with a baseline present this reports
/// the current total as an informational pass.
pub struct RowCountChecker {
    pub warn_threshold_percent: u32,
}

impl Checker for RowCountChecker {
    fn kind(&self) -> &'static str {
        "row_counts"
    }

    fn check(
        &self,
        _current: &SchemaSnapshot,
        baseline: Option<&SchemaSnapshot>,
        metrics: Option<&MetricsSnapshot>,
    ) -> CheckResult {
        match (baseline, metrics) {
            (Some(_), Some(metrics)) => CheckResult::pass(
                self.kind(),
                Level::Warning,
                format!(
                    "Row count check skipped (no baseline metrics to compare against {}% threshold). Current total rows: {}",
                    self.warn_threshold_percent,
                    metrics.total_rows()
                ),
            ),
            _ => CheckResult::pass(
                self.kind(),
                Level::Warning,
                "No baseline available for row count comparison",
            ),
        }
    }
}

/// At least `minimum_tables` tables hold data
pub struct NonEmptyTablesChecker {
    pub minimum_tables: usize,
}

impl Checker for NonEmptyTablesChecker {
    fn kind(&self) -> &'static str {
        "non_empty_tables"
    }

    fn check(
        &self,
        _current: &SchemaSnapshot,
        _baseline: Option<&SchemaSnapshot>,
        metrics: Option<&MetricsSnapshot>,
    ) -> CheckResult {
        let Some(metrics) = metrics else {
            return CheckResult::fail(self.kind(), Level::Warning, "No metrics available to check table data");
        };

        let with_data = metrics.table_metrics.iter().filter(|t| t.row_count > 0).count();
        if with_data >= self.minimum_tables {
            CheckResult::pass(
                self.kind(),
                Level::Warning,
                format!("{}/{} tables have data", with_data, metrics.table_metrics.len()),
            )
        } else {
            CheckResult::fail(
                self.kind(),
                Level::Warning,
                format!("Only {} tables have data (minimum: {})", with_data, self.minimum_tables),
            )
        }
    }
}

/// Sum of all row counts meets `minimum_rows`
pub struct TotalRowCountChecker {
    pub minimum_rows: i64,
}

impl Checker for TotalRowCountChecker {
    fn kind(&self) -> &'static str {
        "total_row_count"
    }

    fn check(
        &self,
        _current: &SchemaSnapshot,
        _baseline: Option<&SchemaSnapshot>,
        metrics: Option<&MetricsSnapshot>,
    ) -> CheckResult {
        let Some(metrics) = metrics else {
            return CheckResult::fail(self.kind(), Level::Warning, "No metrics available");
        };

        let total = metrics.total_rows();
        if total >= self.minimum_rows {
            CheckResult::pass(self.kind(), Level::Warning, format!("Total row count: {}", total))
        } else {
            CheckResult::fail(
                self.kind(),
                Level::Warning,
                format!("Total row count {} is below minimum {}", total, self.minimum_rows),
            )
        }
    }
}

/// Informational unless a positive maximum is configured and exceeded
pub struct RestoreDurationChecker {
    /// Zero disables the limit
    pub max_seconds: u64,
}

impl Checker for RestoreDurationChecker {
    fn kind(&self) -> &'static str {
        "restore_duration"
    }

    fn check(
        &self,
        _current: &SchemaSnapshot,
        _baseline: Option<&SchemaSnapshot>,
        metrics: Option<&MetricsSnapshot>,
    ) -> CheckResult {
        let Some(metrics) = metrics else {
            return CheckResult::pass(self.kind(), Level::Info, "No metrics available");
        };

        let secs = metrics.restore_duration().as_secs();
        if self.max_seconds > 0 && secs > self.max_seconds {
            CheckResult::fail(
                self.kind(),
                Level::Warning,
                format!("Restore took {} seconds (maximum: {})", secs, self.max_seconds),
            )
        } else {
            CheckResult::pass(self.kind(), Level::Info, format!("Restore completed in {} seconds", secs))
        }
    }
}

/// Build a checker from its kind string; unknown kinds are a configuration error
pub fn build_checker(kind: &str, config: &VerificationConfig) -> AppResult<Box<dyn Checker>> {
    let checker: Box<dyn Checker> = match kind {
        "tables_exist" => Box::new(TablesExistChecker),
        "table_count" => Box::new(TableCountChecker),
        "new_tables" => Box::new(NewTablesChecker),
        "column_changes" => Box::new(ColumnChangesChecker),
        "row_counts" => Box::new(RowCountChecker {
            warn_threshold_percent: config.row_counts.warn_threshold_percent,
        }),
        "non_empty_tables" => Box::new(NonEmptyTablesChecker {
            minimum_tables: config.min_non_empty_tables,
        }),
        "total_row_count" => Box::new(TotalRowCountChecker {
            minimum_rows: config.min_total_rows,
        }),
        "restore_duration" => Box::new(RestoreDurationChecker {
            max_seconds: config.max_restore_duration_seconds,
        }),
        other => return Err(config_error(format!("unknown checker kind: {}", other))),
    };
    Ok(checker)
}

/// Failed-check tallies by level
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FailureCounts {
    pub critical: usize,
    pub warning: usize,
    pub info: usize,
}

/// Runs an ordered list of checkers
pub struct CheckEngine {
    checkers: Vec<Box<dyn Checker>>,
}

impl CheckEngine {
    /// Build the configured checkers, failing on the first unknown kind
    pub fn from_config(config: &VerificationConfig) -> AppResult<Self> {
        let checkers = config
            .checks
            .iter()
            .map(|kind| build_checker(kind, config))
            .collect::<AppResult<Vec<_>>>()?;
        Ok(Self { checkers })
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.checkers.iter().map(|c| c.kind()).collect()
    }

    /// Evaluate every checker; results keep checker order
    pub fn run(
        &self,
        current: &SchemaSnapshot,
        baseline: Option<&SchemaSnapshot>,
        metrics: Option<&MetricsSnapshot>,
    ) -> Vec<CheckResult> {
        self.checkers
            .iter()
            .map(|checker| {
                let result = checker.check(current, baseline, metrics);
                debug!(
                    check = result.name.as_str(),
                    passed = result.passed,
                    "{}",
                    result.message
                );
                result
            })
            .collect()
    }
}

pub fn has_critical_failure(results: &[CheckResult]) -> bool {
    results.iter().any(|r| r.level == Level::Critical && !r.passed)
}

pub fn count_failures(results: &[CheckResult]) -> FailureCounts {
    results
        .iter()
        .filter(|r| !r.passed)
        .fold(FailureCounts::default(), |mut counts, r| {
            match r.level {
                Level::Critical => counts.critical += 1,
                Level::Warning => counts.warning += 1,
                Level::Info => counts.info += 1,
            }
            counts
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::introspection::{Column, Table, TableMetrics};
    use pretty_assertions::assert_eq;

    fn schema(names: &[&str]) -> SchemaSnapshot {
        SchemaSnapshot::new(names.iter().map(|n| Table::new("public", *n, vec![])).collect())
    }

    fn metrics(rows: &[i64], duration_secs: u64) -> MetricsSnapshot {
        MetricsSnapshot {
            timestamp: crate::introspection::now(),
            restore_duration_ns: duration_secs * 1_000_000_000,
            db_size_bytes: 1024,
            table_metrics: rows
                .iter()
                .enumerate()
                .map(|(i, r)| TableMetrics {
                    name: format!("t{}", i),
                    schema: "public".into(),
                    row_count: *r,
                })
                .collect(),
        }
    }

    fn engine() -> CheckEngine {
        CheckEngine::from_config(&VerificationConfig::default()).unwrap()
    }

    fn result<'a>(results: &'a [CheckResult], name: &str) -> &'a CheckResult {
        results.iter().find(|r| r.name == name).unwrap()
    }

    #[test]
    fn test_comparison_with_itself_passes() {
        let s = schema(&["a", "b", "c"]);
        for checker in [&TablesExistChecker as &dyn Checker, &TableCountChecker] {
            assert!(checker.check(&s, Some(&s), None).passed);
        }
    }

    #[test]
    fn test_first_run_schema_checks_pass_with_no_baseline_message() {
        let current = schema(&["x", "y"]);
        let results = engine().run(&current, None, Some(&metrics(&[3, 4], 1)));

        for name in ["tables_exist", "table_count", "new_tables", "column_changes", "row_counts"] {
            let r = result(&results, name);
            assert!(r.passed, "{} should pass", name);
            assert!(r.message.to_lowercase().contains("no baseline"), "{}: {}", name, r.message);
        }
    }

    #[test]
    fn test_missing_table_fails_and_count_decreases() {
        let baseline = schema(&["a", "b", "c"]);
        let current = schema(&["a", "b"]);

        let exist = TablesExistChecker.check(&current, Some(&baseline), None);
        assert!(!exist.passed);
        assert_eq!(exist.message, "Missing 1 tables: public.c");

        let count = TableCountChecker.check(&current, Some(&baseline), None);
        assert!(!count.passed);
        assert_eq!(count.message, "Table count decreased: 2 tables (-1 from baseline)");
    }

    #[test]
    fn test_new_table_is_growth() {
        let baseline = schema(&["a", "b"]);
        let current = schema(&["a", "b", "c"]);

        assert!(TablesExistChecker.check(&current, Some(&baseline), None).passed);

        let count = TableCountChecker.check(&current, Some(&baseline), None);
        assert!(count.passed);
        assert!(count.message.contains("increased"));

        let new = NewTablesChecker.check(&current, Some(&baseline), None);
        assert!(new.passed);
        assert_eq!(new.message, "Found 1 new tables: public.c");
    }

    #[test]
    fn test_column_type_change_is_warning() {
        let col = |ty: &str| Column {
            name: "amount".into(),
            data_type: ty.into(),
            nullable: false,
        };
        let baseline = SchemaSnapshot::new(vec![Table::new("public", "orders", vec![col("numeric")])]);
        let current = SchemaSnapshot::new(vec![Table::new("public", "orders", vec![col("integer")])]);

        let r = ColumnChangesChecker.check(&current, Some(&baseline), None);

        assert!(!r.passed);
        assert_eq!(r.level, Level::Warning);
        assert!(r.message.contains("public.orders.amount"));
    }

    #[test]
    fn test_metric_checks() {
        let m = metrics(&[0, 0, 5], 2);
        let s = schema(&[]);

        let non_empty = NonEmptyTablesChecker { minimum_tables: 2 }.check(&s, None, Some(&m));
        assert!(!non_empty.passed);
        assert_eq!(non_empty.message, "Only 1 tables have data (minimum: 2)");

        let total = TotalRowCountChecker { minimum_rows: 5 }.check(&s, None, Some(&m));
        assert!(total.passed);

        let missing = TotalRowCountChecker { minimum_rows: 0 }.check(&s, None, None);
        assert!(!missing.passed);
    }

    #[test]
    fn test_restore_duration_escalates_only_with_limit() {
        let s = schema(&[]);
        let slow = metrics(&[], 120);

        let unlimited = RestoreDurationChecker { max_seconds: 0 }.check(&s, None, Some(&slow));
        assert!(unlimited.passed);
        assert_eq!(unlimited.level, Level::Info);

        let limited = RestoreDurationChecker { max_seconds: 60 }.check(&s, None, Some(&slow));
        assert!(!limited.passed);
        assert_eq!(limited.level, Level::Warning);
    }

    #[test]
    fn test_unknown_kind_fails_loudly() {
        let mut config = VerificationConfig::default();
        config.checks.push("schema_magic".into());
        let err = CheckEngine::from_config(&config).err().unwrap();
        assert!(err.to_string().contains("unknown checker kind: schema_magic"));
    }

    #[test]
    fn test_engine_keeps_configured_order() {
        let mut config = VerificationConfig::default();
        config.checks = vec!["restore_duration".into(), "tables_exist".into()];
        let engine = CheckEngine::from_config(&config).unwrap();
        assert_eq!(engine.kinds(), vec!["restore_duration", "tables_exist"]);

        let results = engine.run(&schema(&["a"]), None, Some(&metrics(&[1], 0)));
        let names: Vec<_> = results.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["restore_duration", "tables_exist"]);
    }

    #[test]
    fn test_failure_tallies() {
        let results = vec![
            CheckResult::fail("a", Level::Critical, ""),
            CheckResult::fail("b", Level::Warning, ""),
            CheckResult::fail("c", Level::Warning, ""),
            CheckResult::pass("d", Level::Critical, ""),
        ];
        assert!(has_critical_failure(&results));
        assert_eq!(
            count_failures(&results),
            FailureCounts {
                critical: 1,
                warning: 2,
                info: 0
            }
        );
    }
}
