//! restorable - backup restore verification
//!
//! Proves a database backup can actually be restored: the artifact is
//! loaded into a throwaway PostgreSQL container, its schema and row counts
//! are checked against the project baseline, and the outcome is written as
//! a signed report.
//!
//! Exit codes: 0 success, 1 warnings only, 2 critical failure,
//! 3 configuration error, 4 environment error.

mod backup;
mod commands;
mod config;
mod error;
mod introspection;
mod pipeline;
mod report;
mod restore;
mod snapshot;

use crate::commands::keygen::KeygenArgs;
use crate::commands::report::ReportArgs;
use crate::commands::verify::VerifyArgs;
use crate::commands::version::VersionArgs;
use crate::config::Settings;
use crate::error::{AppResult, EXIT_ENVIRONMENT};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "restorable", version, about = "Verify that database backups restore")]
struct Cli {
    /// Config file (default: $RESTORABLE_CONFIG or ~/.restorable/config.yaml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Debug logging for this crate.
    #[arg(short, long, global = true)]
    verbose: bool,
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Compact)]
    log_format: LogFormat,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Restore the configured backup and verify it.
    Verify(VerifyArgs),
    /// Inspect stored reports.
    Report(ReportArgs),
    /// Generate an Ed25519 signing key pair.
    Keygen(KeygenArgs),
    /// Print the version.
    Version(VersionArgs),
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Compact,
    Json,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_format);

    let code = tokio::select! {
        result = dispatch(&cli) => match result {
            Ok(code) => code,
            Err(e) => {
                error!("{}", e);
                e.exit_code()
            }
        },
        _ = shutdown_signal() => {
            warn!("Run cancelled, ephemeral resources are being released");
            EXIT_ENVIRONMENT
        }
    };

    std::process::exit(code);
}

async fn dispatch(cli: &Cli) -> AppResult<i32> {
    match &cli.command {
        Command::Verify(args) => {
            let settings = Settings::load(cli.config.as_deref())?;
            info!("Configuration loaded for project {}", settings.project.id);
            commands::verify::run(args, settings).await
        }
        Command::Report(args) => {
            let settings = Settings::load(cli.config.as_deref())?;
            commands::report::run(args, &settings).await
        }
        Command::Keygen(args) => {
            // An explicit --output works without a config file
            let settings = match Settings::load(cli.config.as_deref()) {
                Ok(settings) => Some(settings),
                Err(e) if args.output.is_some() => {
                    tracing::debug!("Ignoring configuration for keygen: {}", e);
                    None
                }
                Err(e) => return Err(e),
            };
            commands::keygen::run(args, settings.as_ref())
        }
        Command::Version(args) => Ok(commands::version::run(args)),
    }
}

/// Initialize tracing with structured logging on stderr
fn init_tracing(verbose: bool, format: LogFormat) {
    let default_filter = if verbose { "info,restorable=debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let registry = tracing_subscriber::registry().with(env_filter);
    match format {
        LogFormat::Compact => registry
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(verbose)
                    .with_level(true)
                    .compact(),
            )
            .init(),
        LogFormat::Json => registry
            .with(fmt::layer().with_writer(std::io::stderr).json())
            .init(),
    }
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received terminate signal");
        },
    }
}
