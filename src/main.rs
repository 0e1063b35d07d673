//! Hearth
//!
//! Runs a single analysis pass over the configured event history and prints
//! the run diagnostics as JSON on stdout.

use anyhow::Context;
use clap::Parser;
use hearth::analysis::RunOutcome;
use hearth::config::{init_logging, Config};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "hearth")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Learn routines, chains and correlations from smart-home history")]
struct Args {
    /// Config file (default: standard locations, then environment)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the events CSV path
    #[arg(long)]
    events: Option<String>,

    /// Override the automation firings CSV path
    #[arg(long)]
    automations: Option<String>,

    /// Override the pattern database path
    #[arg(long)]
    db: Option<String>,

    /// Override the analysis settings path
    #[arg(long)]
    settings: Option<String>,

    /// Print compact JSON instead of pretty-printed
    #[arg(long)]
    compact: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load_with_env(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::load_default(),
    };
    if let Some(events) = args.events {
        config.events.csv_path = events;
    }
    if let Some(automations) = args.automations {
        config.events.automations_csv_path = Some(automations);
    }
    if let Some(db) = args.db {
        config.store.path = db;
    }
    if let Some(settings) = args.settings {
        config.analysis.settings_path = settings;
    }

    init_logging(&config.logging);

    tracing::info!("Hearth v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        events = %config.events.csv_path,
        db = %config.store.path,
        settings = %config.analysis.settings_path,
        "Starting one-shot analysis"
    );

    let engine = config.build_engine().context("initialising analysis engine")?;

    let diagnostics = match engine.run_now().await {
        RunOutcome::Finished(diagnostics) => diagnostics,
        RunOutcome::AlreadyRunning => anyhow::bail!("an analysis pass is already running"),
    };

    let json = if args.compact {
        serde_json::to_string(&diagnostics)?
    } else {
        serde_json::to_string_pretty(&diagnostics)?
    };
    println!("{}", json);

    if !diagnostics.is_completed() {
        anyhow::bail!("analysis pass aborted");
    }

    Ok(())
}
