//! Verification Report Model

use crate::error::{AppError, AppResult};
use crate::introspection::{self, rfc3339_micros, MetricsSnapshot, SchemaSnapshot};
use crate::snapshot::rules::{count_failures, has_critical_failure, CheckResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Report format version written by this build
pub const REPORT_VERSION: &str = "1";

/// The signed artifact of one verification run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    pub version: String,
    pub id: String,
    #[serde(with = "rfc3339_micros")]
    pub timestamp: DateTime<Utc>,
    pub project_id: String,
    pub project_name: String,
    pub machine_id: String,
    pub backup_source: String,
    pub database: DatabaseInfo,
    pub schema: SchemaSnapshot,
    pub metrics: MetricsSnapshot,
    pub checks: Vec<CheckResult>,
    pub summary: Summary,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl Report {
    pub fn is_signed(&self) -> bool {
        self.signature.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseInfo {
    #[serde(rename = "type")]
    pub db_type: String,
    pub major_version: u32,
    pub size_bytes: i64,
}

/// Pass/fail overview derived from the check results
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub success: bool,
    pub total_checks: usize,
    pub passed_checks: usize,
    pub failed_checks: usize,
    pub critical_failures: usize,
    pub warning_failures: usize,
    pub restore_duration: String,
}

impl Summary {
    /// `success` holds exactly when no critical check failed
    pub fn compute(checks: &[CheckResult], metrics: &MetricsSnapshot) -> Self {
        let failures = count_failures(checks);
        let passed = checks.iter().filter(|c| c.passed).count();

        Self {
            success: !has_critical_failure(checks),
            total_checks: checks.len(),
            passed_checks: passed,
            failed_checks: checks.len() - passed,
            critical_failures: failures.critical,
            warning_failures: failures.warning,
            restore_duration: format_duration(metrics.restore_duration()),
        }
    }
}

/// Accumulates the fields of a report and computes its summary
pub struct ReportBuilder {
    version: &'static str,
    id: Option<String>,
    timestamp: DateTime<Utc>,
    project: Option<(String, String)>,
    machine_id: Option<String>,
    backup_source: Option<String>,
    database: Option<(String, u32)>,
    schema: Option<SchemaSnapshot>,
    metrics: Option<MetricsSnapshot>,
    checks: Vec<CheckResult>,
}

impl ReportBuilder {
    pub fn new(version: &'static str) -> Self {
        Self {
            version,
            id: None,
            timestamp: introspection::now(),
            project: None,
            machine_id: None,
            backup_source: None,
            database: None,
            schema: None,
            metrics: None,
            checks: Vec::new(),
        }
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn project(mut self, id: impl Into<String>, name: impl Into<String>) -> Self {
        self.project = Some((id.into(), name.into()));
        self
    }

    pub fn machine_id(mut self, machine_id: impl Into<String>) -> Self {
        self.machine_id = Some(machine_id.into());
        self
    }

    pub fn backup_source(mut self, source: impl Into<String>) -> Self {
        self.backup_source = Some(source.into());
        self
    }

    pub fn database(mut self, db_type: impl Into<String>, major_version: u32) -> Self {
        self.database = Some((db_type.into(), major_version));
        self
    }

    pub fn schema(mut self, schema: SchemaSnapshot) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn metrics(mut self, metrics: MetricsSnapshot) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn checks(mut self, checks: Vec<CheckResult>) -> Self {
        self.checks = checks;
        self
    }

    /// Finalize the report; every identity field must have been set
    pub fn build(self) -> AppResult<Report> {
        let missing = |field: &str| AppError::Internal(format!("report is missing {}", field));

        let id = self.id.ok_or_else(|| missing("id"))?;
        let (project_id, project_name) = self.project.ok_or_else(|| missing("project"))?;
        let machine_id = self.machine_id.ok_or_else(|| missing("machine id"))?;
        let backup_source = self.backup_source.ok_or_else(|| missing("backup source"))?;
        let (db_type, major_version) = self.database.ok_or_else(|| missing("database"))?;
        let schema = self.schema.ok_or_else(|| missing("schema"))?;
        let metrics = self.metrics.ok_or_else(|| missing("metrics"))?;

        let summary = Summary::compute(&self.checks, &metrics);
        Ok(Report {
            version: self.version.to_string(),
            id,
            timestamp: self.timestamp,
            project_id,
            project_name,
            machine_id,
            backup_source,
            database: DatabaseInfo {
                db_type,
                major_version,
                size_bytes: metrics.db_size_bytes,
            },
            schema,
            metrics,
            checks: self.checks,
            summary,
            signature: None,
        })
    }
}

/// Human duration such as `850ms`, `12.345s` or `1m2.5s`
pub fn format_duration(d: Duration) -> String {
    let nanos = d.as_nanos();
    match nanos {
        0 => "0s".to_string(),
        n if n < 1_000 => format!("{}ns", n),
        n if n < 1_000_000 => format!("{}µs", decimal(n, 3)),
        n if n < 1_000_000_000 => format!("{}ms", decimal(n, 6)),
        n => {
            let total_secs = n / 1_000_000_000;
            let secs = decimal((total_secs % 60) * 1_000_000_000 + n % 1_000_000_000, 9);
            let (hours, minutes) = (total_secs / 3600, (total_secs % 3600) / 60);
            if hours > 0 {
                format!("{}h{}m{}s", hours, minutes, secs)
            } else if minutes > 0 {
                format!("{}m{}s", minutes, secs)
            } else {
                format!("{}s", secs)
            }
        }
    }
}

/// `value / 10^scale` with trailing fractional zeros dropped
fn decimal(value: u128, scale: u32) -> String {
    let unit = 10u128.pow(scale);
    let (whole, frac) = (value / unit, value % unit);
    if frac == 0 {
        return whole.to_string();
    }
    let digits = format!("{:0width$}", frac, width = scale as usize);
    format!("{}.{}", whole, digits.trim_end_matches('0'))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::introspection::{Table, TableMetrics};
    use crate::snapshot::rules::Level;
    use pretty_assertions::assert_eq;

    fn check(name: &str, level: Level, passed: bool) -> CheckResult {
        CheckResult {
            name: name.into(),
            level,
            passed,
            message: format!("{} message", name),
        }
    }

    pub(crate) fn sample_report() -> Report {
        let metrics = MetricsSnapshot {
            timestamp: introspection::now(),
            restore_duration_ns: 12_345_000_000,
            db_size_bytes: 9_437_184,
            table_metrics: vec![TableMetrics {
                name: "users".into(),
                schema: "public".into(),
                row_count: 42,
            }],
        };
        ReportBuilder::new(REPORT_VERSION)
            .id("6f1c1a9e-3d1f-4c38-9f0c-2b1b1b7c9a10")
            .project("billing-db", "Billing")
            .machine_id("ci-runner-7")
            .backup_source("local:/var/backups/billing.dump")
            .database("postgres", 16)
            .schema(SchemaSnapshot::new(vec![Table::new("public", "users", vec![])]))
            .metrics(metrics)
            .checks(vec![
                check("tables_exist", Level::Critical, true),
                check("table_count", Level::Warning, false),
                check("new_tables", Level::Info, true),
            ])
            .build()
            .unwrap()
    }

    #[test]
    fn test_summary_counts_are_consistent() {
        let cases = vec![
            vec![],
            vec![check("a", Level::Critical, false)],
            vec![
                check("a", Level::Critical, true),
                check("b", Level::Warning, false),
                check("c", Level::Info, false),
            ],
        ];
        let metrics = sample_report().metrics;

        for checks in cases {
            let s = Summary::compute(&checks, &metrics);
            assert_eq!(s.passed_checks + s.failed_checks, s.total_checks);
            assert_eq!(s.success, s.critical_failures == 0);
        }
    }

    #[test]
    fn test_builder_fills_summary_and_database() {
        let report = sample_report();

        assert_eq!(report.version, "1");
        assert_eq!(report.database.size_bytes, 9_437_184);
        assert_eq!(
            report.summary,
            Summary {
                success: true,
                total_checks: 3,
                passed_checks: 2,
                failed_checks: 1,
                critical_failures: 0,
                warning_failures: 1,
                restore_duration: "12.345s".into(),
            }
        );
        assert!(!report.is_signed());
    }

    #[test]
    fn test_builder_requires_identity_fields() {
        let err = ReportBuilder::new(REPORT_VERSION).id("x").build().unwrap_err();
        assert!(err.to_string().contains("report is missing project"));
    }

    #[test]
    fn test_unsigned_report_omits_signature_field() {
        let json = serde_json::to_value(sample_report()).unwrap();
        assert!(json.get("signature").is_none());
        assert_eq!(json["database"]["type"], "postgres");
        assert_eq!(json["checks"][0]["level"], "critical");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::ZERO), "0s");
        assert_eq!(format_duration(Duration::from_nanos(750)), "750ns");
        assert_eq!(format_duration(Duration::from_micros(1500)), "1.5ms");
        assert_eq!(format_duration(Duration::from_millis(850)), "850ms");
        assert_eq!(format_duration(Duration::from_millis(12_345)), "12.345s");
        assert_eq!(format_duration(Duration::from_millis(62_500)), "1m2.5s");
        assert_eq!(format_duration(Duration::from_secs(3600)), "1h0m0s");
    }
}
