use crate::config::Settings;
use crate::error::{config_error, AppResult, EXIT_CRITICAL, EXIT_SUCCESS};
use crate::report::sign::{load_verifying_key, verify};
use crate::report::store::format_bytes;
use crate::report::{Report, ReportStore};
use clap::{Args, Subcommand};
use std::collections::HashMap;
use std::path::PathBuf;

#[derive(Args, Debug)]
pub struct ReportArgs {
    #[command(subcommand)]
    pub command: ReportCommand,
}

#[derive(Subcommand, Debug)]
pub enum ReportCommand {
    /// List stored reports, newest first.
    List,
    /// Show one report by id, id prefix or file name fragment.
    Show {
        id: String,
        /// Print the stored JSON instead of a summary.
        #[arg(long)]
        json: bool,
    },
    /// Check a report's signature against the public key.
    Verify {
        id: String,
        /// Public key file; defaults to the `.pub` next to the signing key.
        #[arg(long)]
        public_key: Option<PathBuf>,
    },
}

pub async fn run(args: &ReportArgs, settings: &Settings) -> AppResult<i32> {
    let store = ReportStore::new(settings.report_dir());

    match &args.command {
        ReportCommand::List => list(&store).await,
        ReportCommand::Show { id, json } => {
            let (report, path) = store.find(id).await?;
            if *json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("File: {}", path.display());
                print!("{}", render(&report));
            }
            Ok(EXIT_SUCCESS)
        }
        ReportCommand::Verify { id, public_key } => {
            let key_path = public_key
                .clone()
                .or_else(|| settings.signing.public_key_path())
                .ok_or_else(|| {
                    config_error("no public key: pass --public-key or set signing.private_key_path")
                })?;
            let key = load_verifying_key(&key_path)?;
            let (report, _) = store.find(id).await?;

            if verify(&report, &key)? {
                println!("Signature valid for report {}", report.id);
                Ok(EXIT_SUCCESS)
            } else {
                println!("Signature INVALID for report {}", report.id);
                Ok(EXIT_CRITICAL)
            }
        }
    }
}

async fn list(store: &ReportStore) -> AppResult<i32> {
    let entries = store.list().await?;
    if entries.is_empty() {
        println!("No reports found");
        return Ok(EXIT_SUCCESS);
    }

    println!("{:<36}  {:<20}  {:<20}  {:<7}  SIGNED", "ID", "TIMESTAMP", "PROJECT", "STATUS");
    for entry in entries {
        println!(
            "{:<36}  {:<20}  {:<20}  {:<7}  {}",
            entry.id,
            entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
            entry.project_id,
            if entry.success { "PASS" } else { "FAIL" },
            if entry.signed { "yes" } else { "no" },
        );
    }
    Ok(EXIT_SUCCESS)
}

/// Human-readable rendering used by `report show`
pub fn render(report: &Report) -> String {
    let summary = &report.summary;
    let mut out = String::new();
    let mut line = |s: String| {
        out.push_str(&s);
        out.push('\n');
    };

    line(format!("Report:    {} (format v{})", report.id, report.version));
    line(format!("Timestamp: {}", report.timestamp.to_rfc3339()));
    line(format!("Project:   {} ({})", report.project_name, report.project_id));
    line(format!("Machine:   {}", report.machine_id));
    line(format!("Backup:    {}", report.backup_source));
    line(format!(
        "Database:  {} {} ({})",
        report.database.db_type,
        report.database.major_version,
        format_bytes(report.database.size_bytes)
    ));
    line(format!("Restore:   {}", summary.restore_duration));
    line(format!(
        "Result:    {} ({}/{} checks passed, {} critical, {} warning failures)",
        if summary.success { "PASS" } else { "FAIL" },
        summary.passed_checks,
        summary.total_checks,
        summary.critical_failures,
        summary.warning_failures
    ));
    line(format!(
        "Signature: {}",
        if report.is_signed() { "present" } else { "none" }
    ));

    line(String::new());
    line("Checks:".to_string());
    for check in &report.checks {
        line(format!(
            "  [{}] {:<8} {}: {}",
            if check.passed { "ok" } else { "!!" },
            check.level,
            check.name,
            check.message
        ));
    }

    let rows: HashMap<String, i64> = report
        .metrics
        .table_metrics
        .iter()
        .map(|m| (m.qualified_name(), m.row_count))
        .collect();
    line(String::new());
    line(format!("Tables ({}):", report.schema.tables.len()));
    for table in &report.schema.tables {
        let name = table.qualified_name();
        let count = rows
            .get(&name)
            .map_or_else(|| "-".to_string(), |c| c.to_string());
        line(format!("  {:<40} {:>3} columns {:>12} rows", name, table.columns.len(), count));
    }
    out
}
