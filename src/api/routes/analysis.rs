//! Analysis Routes
//!
//! - POST /api/v1/analysis - Start a pass (no-op while one is running)
//! - GET /api/v1/analysis/status - Running flag and last diagnostics

use axum::{extract::State, http::StatusCode, Json};
use std::sync::Arc;

use crate::analysis::StartOutcome;
use crate::api::dto::{AnalysisStatusResponse, StartAnalysisResponse};
use crate::api::state::AppState;

/// POST /api/v1/analysis
///
/// Returns 202 when a pass was started and 200 when one is already in
/// flight. Requests are never queued.
pub async fn start_analysis(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<StartAnalysisResponse>) {
    match state.engine.start() {
        StartOutcome::Started => {
            tracing::info!("Analysis pass started on request");
            (
                StatusCode::ACCEPTED,
                Json(StartAnalysisResponse {
                    status: "started".to_string(),
                }),
            )
        }
        StartOutcome::AlreadyRunning => (
            StatusCode::OK,
            Json(StartAnalysisResponse {
                status: "already_running".to_string(),
            }),
        ),
    }
}

/// GET /api/v1/analysis/status
pub async fn analysis_status(State(state): State<Arc<AppState>>) -> Json<AnalysisStatusResponse> {
    let status = state.engine.status().await;
    Json(AnalysisStatusResponse {
        running: status.running,
        last_run: status.last_run,
    })
}
