//! # Hearth
//!
//! Smart-home behaviour mining: learns daily routines, action chains and
//! state correlations from device event history and keeps them as learned
//! patterns a user can accept, reject or turn into automations.
//!
//! ## Features
//!
//! - **Time-based routines**: circular statistics over time of day, weekday
//!   filters and sun-relative offsets
//! - **Event chains**: "A then B within a window", with stricter rules for
//!   chains that cross rooms
//! - **Correlations**: per-target co-occurrence ratios, trivial partners
//!   dropped, strongest links kept per trigger
//! - **Durable lifecycle**: confidence blending, sticky rejections and a
//!   janitor for patterns no longer observed
//!
//! ## Modules
//!
//! - [`events`]: Event model and history sources
//! - [`settings`]: Exclusions, domain flags and tunables
//! - [`filter`]: Ingestion and filter stage
//! - [`detect`]: The three detectors and their shared statistics
//! - [`patterns`]: Pattern store, upsert manager and janitor
//! - [`analysis`]: Analysis pass orchestration and diagnostics
//! - [`api`]: REST API server with Axum
//! - [`config`]: Service configuration and logging setup
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use hearth::analysis::{AnalysisEngine, RunOutcome};
//! use hearth::events::CsvEventSource;
//! use hearth::patterns::SqlitePatternStore;
//! use hearth::settings::FileSettingsProvider;
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = Arc::new(SqlitePatternStore::open(Path::new("patterns.db"))?);
//!     let source = Arc::new(CsvEventSource::new("events.csv"));
//!     let settings = Arc::new(FileSettingsProvider::new("settings.toml"));
//!
//!     let engine = AnalysisEngine::new(source, settings, store);
//!
//!     if let RunOutcome::Finished(diagnostics) = engine.run_now().await {
//!         println!("{} candidates accepted", diagnostics.accepted());
//!     }
//!
//!     Ok(())
//! }
//! ```

pub mod analysis;
pub mod api;
pub mod config;
pub mod detect;
pub mod events;
pub mod filter;
pub mod patterns;
pub mod settings;

// Re-export top-level types for convenience
pub use analysis::{
    AnalysisEngine, AnalysisError, AnalysisStatus, RunDiagnostics, RunOutcome, StartOutcome,
};

pub use events::{
    AutomationFiring, CsvEventSource, EventContext, EventSource, MemoryEventSource, StateEvent,
};

pub use settings::{AnalysisSettings, FileSettingsProvider, SettingsProvider, StaticSettings, Tunables};

pub use detect::{CorrelationDetector, Detector, DetectorKind, SequenceDetector, TimeBasedDetector};

pub use patterns::{
    LearnedPattern, PatternFilter, PatternManager, PatternStatus, PatternStore, PatternType,
    SqlitePatternStore, StoreError, StoreResult,
};

pub use api::{build_router, serve, ApiError, AppState};

pub use config::{Config, ConfigError, LoggingConfig};
