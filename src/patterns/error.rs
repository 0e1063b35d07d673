//! Pattern store error types

use crate::patterns::types::PatternStatus;
use thiserror::Error;

/// Errors raised by the pattern store and the upsert manager
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLite operation failed
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A stored payload could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// No pattern with the given id
    #[error("Pattern not found: {0}")]
    NotFound(String),

    /// The requested status change is not allowed from the current status
    #[error("Cannot {action} pattern in status '{from}'")]
    InvalidTransition {
        action: &'static str,
        from: PatternStatus,
    },

    /// The store could not be reached
    #[error("Pattern store unavailable: {0}")]
    Unavailable(String),

    /// The connection lock was poisoned by a panicking writer
    #[error("Lock error: {0}")]
    Lock(String),

    /// I/O operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// Result type alias for pattern store operations
pub type StoreResult<T> = Result<T, StoreError>;
