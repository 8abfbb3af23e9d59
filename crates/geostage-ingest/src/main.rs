//! Geostage - geospatial dataset ingestion tool

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use geostage_common::logging::{init_logging, LogLevel};
use geostage_ingest::config::GlobalSettings;
use geostage_ingest::mapping::MappingSet;
use geostage_ingest::orchestrator::Orchestrator;
use geostage_ingest::sources::load_inventory;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const EXIT_CONFIG_ERROR: u8 = 1;
const EXIT_CANCELLED: u8 = 2;
const EXIT_BUDGET_EXCEEDED: u8 = 3;

#[derive(Parser, Debug)]
#[command(name = "geostage")]
#[command(author, version, about = "Geospatial dataset ingestion and staging")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Parser, Debug)]
enum Command {
    /// Run the ingestion pipeline
    Run {
        /// Global settings document
        #[arg(long, default_value = "config/config.yaml")]
        config: PathBuf,

        /// Source inventory document
        #[arg(long, default_value = "config/sources.yaml")]
        sources: PathBuf,

        /// Name-mapping overrides document
        #[arg(long, default_value = "config/mappings.yaml")]
        mappings: PathBuf,
    },

    /// Validate the configuration documents without fetching anything
    Validate {
        /// Global settings document
        #[arg(long, default_value = "config/config.yaml")]
        config: PathBuf,

        /// Source inventory document
        #[arg(long, default_value = "config/sources.yaml")]
        sources: PathBuf,

        /// Name-mapping overrides document
        #[arg(long, default_value = "config/mappings.yaml")]
        mappings: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            // The logging subscriber may not exist yet when configuration
            // loading fails, so report on both channels.
            error!(error = %e, "Run aborted");
            eprintln!("geostage: {:#}", e);
            ExitCode::from(EXIT_CONFIG_ERROR)
        },
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    match cli.command {
        Command::Run {
            config,
            sources,
            mappings,
        } => {
            let settings = GlobalSettings::load(&config)?;

            let mut log_config = settings.logging.clone().with_env_overrides()?;
            if cli.verbose {
                log_config.level = LogLevel::Debug;
            }
            init_logging(&log_config)?;

            let inventory = load_inventory(&sources)?;
            let mapping_set = MappingSet::load(&mappings)?;

            let cancel = CancellationToken::new();
            spawn_signal_handler(cancel.clone());

            let orchestrator = Orchestrator::new(settings, inventory, mapping_set);
            let result = orchestrator.run(cancel).await?;

            if result.budget_exceeded {
                error!(
                    failed = result.report.failed_sources(),
                    "Run exceeded the failure budget"
                );
                return Ok(ExitCode::from(EXIT_BUDGET_EXCEEDED));
            }
            if result.cancelled {
                warn!("Run cancelled before completion");
                return Ok(ExitCode::from(EXIT_CANCELLED));
            }
            info!("Run complete");
            Ok(ExitCode::SUCCESS)
        },

        Command::Validate {
            config,
            sources,
            mappings,
        } => {
            let settings = GlobalSettings::load(&config)?;
            let log_config = settings.logging.clone().with_env_overrides()?;
            init_logging(&log_config)?;

            let inventory = load_inventory(&sources)?;
            let mapping_set = MappingSet::load(&mappings)?;
            info!(
                environment = %settings.environment,
                sources = inventory.len(),
                enabled = inventory.iter().filter(|s| s.enabled).count(),
                mappings = mapping_set.len(),
                "Configuration valid"
            );
            Ok(ExitCode::SUCCESS)
        },
    }
}

/// Interrupt and termination signals trigger graceful cancellation: every
/// in-flight source aborts at its next cancellation check.
fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut terminate = match tokio::signal::unix::signal(
                tokio::signal::unix::SignalKind::terminate(),
            ) {
                Ok(signal) => signal,
                Err(e) => {
                    warn!(error = %e, "Cannot install SIGTERM handler");
                    let _ = ctrl_c.await;
                    cancel.cancel();
                    return;
                },
            };
            tokio::select! {
                _ = ctrl_c => info!("Interrupt received, cancelling run"),
                _ = terminate.recv() => info!("Termination signal received, cancelling run"),
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
            info!("Interrupt received, cancelling run");
        }
        cancel.cancel();
    });
}
