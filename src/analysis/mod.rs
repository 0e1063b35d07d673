//! Analysis Orchestrator
//!
//! One pass ties the stages together:
//!
//! 1. load settings (defaults on failure)
//! 2. ping the store and prefetch the run cache
//! 3. read events and automation firings for the lookback
//! 4. filter, then run every detector on the blocking pool
//! 5. upsert each detector's candidates
//! 6. sweep stale observed patterns
//!
//! `AnalysisEngine` owns the run lock and the last pass's diagnostics.

pub mod context;
pub mod diagnostics;
pub mod engine;
pub mod error;

pub use context::RunContext;
pub use diagnostics::{AnalysisStatus, DetectorDiagnostics, PassOutcome, RunDiagnostics};
pub use engine::{default_detectors, AnalysisEngine, RunOutcome, StartOutcome};
pub use error::{AnalysisError, AnalysisResult};
