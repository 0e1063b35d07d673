//! Event source error types

use thiserror::Error;

/// Errors raised while reading from an event source
#[derive(Error, Debug)]
pub enum SourceError {
    /// I/O operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// CSV export could not be read
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// A row could not be turned into an event
    #[error("Parse error: {0}")]
    Parse(String),

    /// The upstream store is not reachable
    #[error("Event source unavailable: {0}")]
    Unavailable(String),
}

/// A malformed individual event; the event is skipped, the pass continues
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Event has an empty entity id")]
    EmptyEntityId,

    #[error("Entity id '{0}' has no domain prefix")]
    MissingDomain(String),

    #[error("Entity '{0}' reported an empty state")]
    EmptyState(String),

    #[error("Entity '{entity_id}' reported domain '{domain}'")]
    DomainMismatch { entity_id: String, domain: String },
}

impl ValidationError {
    /// Short stable label used as a diagnostics key
    pub fn reason(&self) -> &'static str {
        match self {
            ValidationError::EmptyEntityId => "empty_entity_id",
            ValidationError::MissingDomain(_) => "missing_domain",
            ValidationError::EmptyState(_) => "empty_state",
            ValidationError::DomainMismatch { .. } => "domain_mismatch",
        }
    }
}

/// Result type alias for event source operations
pub type SourceResult<T> = Result<T, SourceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ValidationError::MissingDomain("kitchen".to_string());
        assert_eq!(err.to_string(), "Entity id 'kitchen' has no domain prefix");
        assert_eq!(err.reason(), "missing_domain");

        let err = SourceError::Unavailable("recorder offline".to_string());
        assert_eq!(err.to_string(), "Event source unavailable: recorder offline");
    }
}
