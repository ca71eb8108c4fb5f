use crate::config::Settings;
use crate::error::AppResult;
use crate::pipeline::{RunOutcome, SigningState, VerifyPipeline};
use clap::Args;
use tracing::info;

#[derive(Args, Debug)]
pub struct VerifyArgs {}

pub async fn run(_args: &VerifyArgs, settings: Settings) -> AppResult<i32> {
    let pipeline = VerifyPipeline::new(settings);
    info!(run_id = pipeline.run_id(), "Verification run");

    let outcome = pipeline.run().await?;
    print_summary(&outcome);
    Ok(outcome.exit_code())
}

fn print_summary(outcome: &RunOutcome) {
    let report = &outcome.report;
    let summary = &report.summary;

    println!("Report:    {}", outcome.report_path.display());
    println!("Project:   {} ({})", report.project_name, report.project_id);
    println!(
        "Checks:    {}/{} passed ({} critical, {} warning failures)",
        summary.passed_checks, summary.total_checks, summary.critical_failures, summary.warning_failures
    );
    println!("Restore:   {}", summary.restore_duration);
    let signature = match &outcome.signing {
        SigningState::Signed => "signed".to_string(),
        SigningState::Unsigned => "unsigned (no signing key configured)".to_string(),
        SigningState::Failed(reason) => format!("FAILED: {}", reason),
    };
    println!("Signature: {}", signature);
    println!("Baseline:  {}", outcome.baseline);

    for check in report.checks.iter().filter(|c| !c.passed) {
        println!("  FAIL [{}] {}: {}", check.level, check.name, check.message);
    }
    println!("Status:    {:?}", outcome.status());
}
