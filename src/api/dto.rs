//! Data Transfer Objects
//!
//! Request and response types for the API endpoints.
//! These types are serialized/deserialized to/from JSON.

use crate::analysis::RunDiagnostics;
use crate::api::error::{ApiError, ApiResult};
use crate::patterns::{LearnedPattern, PatternFilter, PatternStatus, PatternType};
use serde::{Deserialize, Serialize};

// ============================================
// PATTERN DTOs
// ============================================

/// Query string of `GET /api/v1/patterns`
#[derive(Debug, Default, Deserialize)]
pub struct PatternListQuery {
    pub status: Option<String>,
    #[serde(rename = "type")]
    pub pattern_type: Option<String>,
    pub room: Option<String>,
}

impl PatternListQuery {
    pub fn to_filter(&self) -> ApiResult<PatternFilter> {
        let mut filter = PatternFilter::default();

        if let Some(status) = non_empty(&self.status) {
            filter = filter.status(status.parse::<PatternStatus>().map_err(ApiError::Validation)?);
        }
        if let Some(pattern_type) = non_empty(&self.pattern_type) {
            filter = filter.pattern_type(
                pattern_type
                    .parse::<PatternType>()
                    .map_err(ApiError::Validation)?,
            );
        }
        if let Some(room) = non_empty(&self.room) {
            filter = filter.room(room);
        }

        Ok(filter)
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// Pattern list response
#[derive(Debug, Serialize, Deserialize)]
pub struct PatternListResponse {
    pub total: usize,
    pub patterns: Vec<LearnedPattern>,
}

/// Body of `POST /api/v1/patterns/:id/reject`
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct RejectRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

/// Body of `PUT /api/v1/patterns/:id/test-mode`
#[derive(Debug, Serialize, Deserialize)]
pub struct TestModeRequest {
    pub enabled: bool,
}

// ============================================
// ANALYSIS DTOs
// ============================================

/// Response of `POST /api/v1/analysis`
#[derive(Debug, Serialize, Deserialize)]
pub struct StartAnalysisResponse {
    /// "started" or "already_running"
    pub status: String,
}

/// Response of `GET /api/v1/analysis/status`
#[derive(Debug, Serialize)]
pub struct AnalysisStatusResponse {
    pub running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run: Option<RunDiagnostics>,
}

// ============================================
// HEALTH DTOs
// ============================================

/// Full health status
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// "healthy" or "unhealthy"
    pub status: String,
    /// Pattern store status
    pub store: String,
    pub analysis_running: bool,
    pub uptime_seconds: u64,
    pub version: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_to_filter() {
        let query = PatternListQuery {
            status: Some("observed".to_string()),
            pattern_type: Some("event_chain".to_string()),
            room: Some(" ".to_string()),
        };
        let filter = query.to_filter().unwrap();
        assert_eq!(filter.status, Some(PatternStatus::Observed));
        assert_eq!(filter.pattern_type, Some(PatternType::EventChain));
        assert_eq!(filter.room_id, None);

        let bad = PatternListQuery {
            status: Some("sleeping".to_string()),
            ..Default::default()
        };
        assert!(matches!(bad.to_filter(), Err(ApiError::Validation(_))));
    }
}
