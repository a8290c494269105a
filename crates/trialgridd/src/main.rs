//! trialgridd — the TrialGrid daemon.
//!
//! Loads the daemon configuration, starts the trial pipeline with dry-run
//! stage handlers, runs a batch of trials to completion and prints a JSON
//! summary of the outcome.
//!
//! # Usage
//!
//! ```text
//! trialgridd run --config trialgrid.toml --trials trials.json
//! trialgridd check-config --config trialgrid.toml
//! ```

mod dry_run;
mod trials;

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use trialgrid_core::TrialGridConfig;
use trialgrid_scheduler::Pipeline;

use crate::trials::TrialSummary;

#[derive(Parser)]
#[command(name = "trialgridd", about = "TrialGrid daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a batch of trials through the pipeline.
    Run {
        /// Daemon configuration (TOML). Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// JSON array of trials to submit.
        #[arg(long)]
        trials: PathBuf,

        #[arg(long, value_enum, default_value = "text")]
        log_format: LogFormat,

        /// Give up waiting for unfinished trials after this many seconds.
        #[arg(long, default_value = "3600")]
        timeout_secs: u64,
    },
    /// Validate a configuration file and print the effective settings.
    CheckConfig {
        #[arg(long)]
        config: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            trials,
            log_format,
            timeout_secs,
        } => {
            init_tracing(log_format);
            let config = load_config(config.as_deref())?;
            run(config, &trials, Duration::from_secs(timeout_secs)).await
        }
        Command::CheckConfig { config } => {
            let config = TrialGridConfig::from_file(&config)?;
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,trialgridd=debug,trialgrid=debug"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<TrialGridConfig> {
    match path {
        Some(path) => {
            let config = TrialGridConfig::from_file(path)?;
            info!(path = %path.display(), "configuration loaded");
            Ok(config)
        }
        None => Ok(TrialGridConfig::default()),
    }
}

async fn run(config: TrialGridConfig, trials_path: &Path, timeout: Duration) -> anyhow::Result<()> {
    info!("TrialGrid daemon starting");

    let mut specs = trials::load_trials(trials_path)?;
    trials::override_windows(&mut specs, config.dry_run.window_secs);
    info!(count = specs.len(), path = %trials_path.display(), "trials loaded");

    let factory = dry_run::factory(&config.dry_run)?;
    let pipeline = Pipeline::start(&config, factory);

    for spec in specs {
        let id = spec.id.clone();
        if let Err(e) = pipeline.submit(spec).await {
            error!(trial = %id, error = %e, "trial rejected");
        }
    }

    // Stop early on Ctrl-C.
    tokio::select! {
        idle = pipeline.wait_idle(timeout) => {
            if !idle {
                warn!(timeout = ?timeout, "timed out waiting for trials");
            }
        }
        signal = tokio::signal::ctrl_c() => {
            match signal {
                Ok(()) => info!("shutdown signal received"),
                Err(e) => error!(error = %e, "failed to listen for shutdown signal"),
            }
        }
    }

    let summary: Vec<TrialSummary> = pipeline
        .trials()
        .await
        .into_iter()
        .map(TrialSummary::from)
        .collect();
    println!("{}", serde_json::to_string_pretty(&summary)?);

    pipeline.shutdown().await;
    info!("TrialGrid daemon stopped");
    Ok(())
}
