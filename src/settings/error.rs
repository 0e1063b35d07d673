//! Settings error types

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while loading analysis settings
///
/// A failed load never means "no exclusions": the orchestrator reuses the
/// last settings it loaded, or aborts the pass when it has none.
#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Failed to read settings file {path:?}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("Failed to parse settings: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid entity exclusion pattern {pattern:?}: {error}")]
    InvalidPattern { pattern: String, error: String },

    #[error("Settings provider unavailable: {0}")]
    Unavailable(String),
}

/// Result type alias for settings operations
pub type SettingsResult<T> = Result<T, SettingsError>;
