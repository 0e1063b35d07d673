//! Hearth API Server
//!
//! Run with: cargo run --bin hearth-api
//!
//! # Configuration
//!
//! Reads `config.toml` from the standard locations (see [`hearth::config`]),
//! then applies environment overrides:
//! - `HEARTH_API_HOST`: Host to bind to (default: 0.0.0.0)
//! - `HEARTH_API_PORT`: Port to listen on (default: 8086)
//! - `HEARTH_DB_PATH`: Pattern database
//! - `HEARTH_EVENTS_CSV`: Event history export
//! - `HEARTH_SETTINGS`: Analysis settings file
//! - `RUST_LOG`: Log filter (default: hearth=info)

use anyhow::Context;
use hearth::api::{serve, AppState};
use hearth::config::{init_logging, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load_default();
    init_logging(&config.logging);

    tracing::info!("Starting Hearth API server v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Pattern database: {}", config.store.path);
    tracing::info!("Event history: {}", config.events.csv_path);
    tracing::info!("Analysis settings: {}", config.analysis.settings_path);

    let engine = config.build_engine().context("initialising analysis engine")?;

    let api_config = config.api.to_server_config();
    let state = AppState::new(engine, api_config.clone());

    tracing::info!("Starting server on {}", api_config.addr());
    serve(state, &api_config).await?;

    tracing::info!("Hearth API server stopped");
    Ok(())
}
