//! Pass-fatal errors

use crate::events::SourceError;
use crate::patterns::StoreError;
use crate::settings::SettingsError;
use thiserror::Error;

/// Failures that abort a whole analysis pass
///
/// Everything else (bad event rows, bad tunables, a failing detector, a
/// single detector's upsert) is recorded in the diagnostics and the pass
/// goes on.
#[derive(Error, Debug)]
pub enum AnalysisError {
    /// The pattern store could not be reached at pass start
    #[error("Pattern store unavailable: {0}")]
    StoreUnavailable(#[source] StoreError),

    /// The event or automation history could not be read
    #[error("Event source unreadable: {0}")]
    Source(#[from] SourceError),

    /// Settings failed to load and no earlier copy exists
    #[error("Settings unavailable: {0}")]
    Settings(#[source] SettingsError),

    /// A blocking task was cancelled or panicked
    #[error("Task failed: {0}")]
    Task(String),
}

impl From<tokio::task::JoinError> for AnalysisError {
    fn from(e: tokio::task::JoinError) -> Self {
        AnalysisError::Task(e.to_string())
    }
}

pub type AnalysisResult<T> = Result<T, AnalysisError>;
