//! Pattern Routes
//!
//! Queries and single-row status operations on learned patterns.
//!
//! - GET /api/v1/patterns?status=&type=&room= - List patterns
//! - GET /api/v1/patterns/:id - Get a pattern
//! - POST /api/v1/patterns/:id/reject - Reject (sticky)
//! - POST /api/v1/patterns/:id/reactivate - Back to suggested
//! - POST /api/v1/patterns/:id/enable - Activate
//! - POST /api/v1/patterns/:id/disable - Disable
//! - PUT /api/v1/patterns/:id/test-mode - Toggle test mode
//! - DELETE /api/v1/patterns/:id - Delete

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use std::sync::Arc;

use crate::api::dto::{PatternListQuery, PatternListResponse, RejectRequest, TestModeRequest};
use crate::api::error::{ApiError, ApiResult};
use crate::api::state::AppState;
use crate::patterns::{LearnedPattern, PatternManager, StoreResult};

/// Run a store operation on the blocking pool
async fn with_manager<T, F>(state: &AppState, op: F) -> ApiResult<T>
where
    F: FnOnce(&PatternManager) -> StoreResult<T> + Send + 'static,
    T: Send + 'static,
{
    let manager = state.manager().clone();
    tokio::task::spawn_blocking(move || op(&manager))
        .await
        .map_err(|e| ApiError::Internal(format!("Store task failed: {}", e)))?
        .map_err(ApiError::from)
}

/// GET /api/v1/patterns
pub async fn list_patterns(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PatternListQuery>,
) -> ApiResult<Json<PatternListResponse>> {
    let filter = query.to_filter()?;
    let patterns = with_manager(&state, move |m| m.list(&filter)).await?;

    Ok(Json(PatternListResponse {
        total: patterns.len(),
        patterns,
    }))
}

/// GET /api/v1/patterns/:id
pub async fn get_pattern(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<LearnedPattern>> {
    let pattern = with_manager(&state, move |m| m.get(&id)).await?;
    Ok(Json(pattern))
}

/// POST /api/v1/patterns/:id/reject
///
/// The body is optional; `{"reason": "..."}` records why.
pub async fn reject_pattern(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Option<Json<RejectRequest>>,
) -> ApiResult<Json<LearnedPattern>> {
    let reason = body.and_then(|Json(req)| req.reason);
    let pattern = with_manager(&state, move |m| m.reject(&id, reason.as_deref())).await?;

    tracing::info!(pattern_id = %pattern.id, identity_key = %pattern.identity_key, "Pattern rejected");
    Ok(Json(pattern))
}

/// POST /api/v1/patterns/:id/reactivate
pub async fn reactivate_pattern(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<LearnedPattern>> {
    let pattern = with_manager(&state, move |m| m.reactivate(&id)).await?;
    Ok(Json(pattern))
}

/// POST /api/v1/patterns/:id/enable
pub async fn enable_pattern(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<LearnedPattern>> {
    let pattern = with_manager(&state, move |m| m.enable(&id)).await?;
    Ok(Json(pattern))
}

/// POST /api/v1/patterns/:id/disable
pub async fn disable_pattern(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<LearnedPattern>> {
    let pattern = with_manager(&state, move |m| m.disable(&id)).await?;
    Ok(Json(pattern))
}

/// PUT /api/v1/patterns/:id/test-mode
pub async fn set_test_mode(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<TestModeRequest>,
) -> ApiResult<Json<LearnedPattern>> {
    let pattern = with_manager(&state, move |m| m.set_test_mode(&id, req.enabled)).await?;
    Ok(Json(pattern))
}

/// DELETE /api/v1/patterns/:id
pub async fn delete_pattern(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    let deleted_id = id.clone();
    with_manager(&state, move |m| m.delete(&id)).await?;

    tracing::info!(pattern_id = %deleted_id, "Pattern deleted");
    Ok(StatusCode::NO_CONTENT)
}
