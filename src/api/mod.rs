//! Hearth REST API
//!
//! HTTP API over the pattern store and the analysis engine, built with Axum.
//!
//! # Endpoints
//!
//! ## Patterns
//! - `GET /api/v1/patterns` - List patterns (`?status=&type=&room=`)
//! - `GET /api/v1/patterns/:id` - Get a pattern
//! - `POST /api/v1/patterns/:id/reject` - Reject a pattern
//! - `POST /api/v1/patterns/:id/reactivate` - Reactivate a rejected or disabled pattern
//! - `POST /api/v1/patterns/:id/enable` - Enable a pattern
//! - `POST /api/v1/patterns/:id/disable` - Disable a pattern
//! - `PUT /api/v1/patterns/:id/test-mode` - Toggle test mode
//! - `DELETE /api/v1/patterns/:id` - Delete a pattern
//!
//! ## Analysis
//! - `POST /api/v1/analysis` - Start an analysis pass
//! - `GET /api/v1/analysis/status` - Running flag and last run diagnostics
//!
//! ## Health
//! - `GET /health/live` - Liveness probe
//! - `GET /health/ready` - Readiness probe
//! - `GET /health` - Full health status
//!
//! # Example
//!
//! ```rust,ignore
//! use hearth::analysis::AnalysisEngine;
//! use hearth::api::{serve, ApiConfig, AppState};
//! use hearth::events::CsvEventSource;
//! use hearth::patterns::SqlitePatternStore;
//! use hearth::settings::StaticSettings;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = Arc::new(SqlitePatternStore::open("patterns.db")?);
//!     let source = Arc::new(CsvEventSource::new("history.csv"));
//!     let engine = AnalysisEngine::new(source, Arc::new(StaticSettings::default()), store);
//!
//!     let config = ApiConfig::default();
//!     serve(AppState::new(engine, config.clone()), &config).await?;
//!     Ok(())
//! }
//! ```

pub mod dto;
pub mod error;
pub mod routes;
pub mod state;

pub use error::{ApiError, ApiResult};
pub use state::{ApiConfig, AppState};

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post, put},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tower_http::{cors::CorsLayer, timeout::TimeoutLayer, trace::TraceLayer};

/// Build the API router with all routes and middleware
pub fn build_router(state: AppState) -> Router {
    let max_body_size = state.config.max_body_size;
    let request_timeout = Duration::from_millis(state.config.request_timeout_ms);

    let api_routes = Router::new()
        // Pattern routes
        .route("/patterns", get(routes::patterns::list_patterns))
        .route(
            "/patterns/:id",
            get(routes::patterns::get_pattern).delete(routes::patterns::delete_pattern),
        )
        .route("/patterns/:id/reject", post(routes::patterns::reject_pattern))
        .route(
            "/patterns/:id/reactivate",
            post(routes::patterns::reactivate_pattern),
        )
        .route("/patterns/:id/enable", post(routes::patterns::enable_pattern))
        .route("/patterns/:id/disable", post(routes::patterns::disable_pattern))
        .route("/patterns/:id/test-mode", put(routes::patterns::set_test_mode))
        // Analysis routes
        .route("/analysis", post(routes::analysis::start_analysis))
        .route("/analysis/status", get(routes::analysis::analysis_status))
        .layer(DefaultBodyLimit::max(max_body_size));

    let health_routes = Router::new()
        .route("/live", get(routes::health::liveness))
        .route("/ready", get(routes::health::readiness))
        .route("/", get(routes::health::full_health));

    // Create shared state
    let shared_state = Arc::new(state);

    Router::new()
        .nest("/api/v1", api_routes)
        .nest("/health", health_routes)
        .layer(TimeoutLayer::new(request_timeout))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(shared_state)
}

/// Start the API server
pub async fn serve(state: AppState, config: &ApiConfig) -> Result<(), ApiError> {
    let router = build_router(state);

    let addr = config.addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Hearth API listening on {}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| ApiError::Internal(format!("Server error: {}", e)))?;

    tracing::info!("Hearth API shut down gracefully");
    Ok(())
}

/// Wait for shutdown signal
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, starting graceful shutdown");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::AnalysisEngine;
    use crate::events::fixtures::chain;
    use crate::events::MemoryEventSource;
    use crate::patterns::{
        LearnedPattern, PatternFilter, PatternStore, PatternType, SqlitePatternStore,
    };
    use crate::settings::StaticSettings;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use tower::util::ServiceExt;

    struct TestApp {
        router: Router,
        engine: AnalysisEngine,
    }

    fn create_test_app() -> TestApp {
        let store: Arc<dyn PatternStore> = Arc::new(SqlitePatternStore::in_memory().unwrap());
        let events = chain(
            ("binary_sensor.hall_motion", "on", Some("hall")),
            ("light.hall", "on", Some("hall")),
            1..=8,
            18,
            30,
            4,
        );
        let engine = AnalysisEngine::new(
            Arc::new(MemoryEventSource::with_events(events)),
            Arc::new(StaticSettings::default()),
            store,
        );
        let router = build_router(AppState::new(engine.clone(), ApiConfig::default()));

        TestApp { router, engine }
    }

    /// Run one pass and return the stored event chain
    async fn seeded_pattern(app: &TestApp) -> LearnedPattern {
        app.engine.run_now().await;
        let manager = app.engine.manager().clone();
        let mut patterns = tokio::task::spawn_blocking(move || {
            manager.list(&PatternFilter::default().pattern_type(PatternType::EventChain))
        })
        .await
        .unwrap()
        .unwrap();
        assert_eq!(patterns.len(), 1);
        assert_eq!(patterns[0].room_id.as_deref(), Some("hall"));
        patterns.remove(0)
    }

    async fn send(router: &Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_req(uri: &str, body: Option<&str>) -> Request<Body> {
        let builder = Request::builder().method("POST").uri(uri);
        match body {
            Some(json) => builder
                .header("Content-Type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_health_live() {
        let app = create_test_app();
        let (status, _) = send(&app.router, get_req("/health/live")).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_health_ready() {
        let app = create_test_app();
        let (status, _) = send(&app.router, get_req("/health/ready")).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_health_full() {
        let app = create_test_app();
        let (status, body) = send(&app.router, get_req("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["store"], "ok");
        assert_eq!(body["analysis_running"], false);
    }

    #[tokio::test]
    async fn test_list_patterns_empty() {
        let app = create_test_app();
        let (status, body) = send(&app.router, get_req("/api/v1/patterns")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], 0);
    }

    #[tokio::test]
    async fn test_list_patterns_rejects_unknown_status() {
        let app = create_test_app();
        let (status, body) = send(&app.router, get_req("/api/v1/patterns?status=sleeping")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_list_patterns_with_filters() {
        let app = create_test_app();
        seeded_pattern(&app).await;

        let (_, body) = send(
            &app.router,
            get_req("/api/v1/patterns?type=event_chain&room=hall"),
        )
        .await;
        assert_eq!(body["total"], 1);

        let (_, body) = send(&app.router, get_req("/api/v1/patterns?room=kitchen")).await;
        assert_eq!(body["total"], 0);
    }

    #[tokio::test]
    async fn test_get_pattern_not_found() {
        let app = create_test_app();
        let (status, body) = send(&app.router, get_req("/api/v1/patterns/nope")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "PATTERN_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_reject_then_reactivate() {
        let app = create_test_app();
        let pattern = seeded_pattern(&app).await;

        let uri = format!("/api/v1/patterns/{}/reject", pattern.id);
        let (status, body) = send(
            &app.router,
            post_req(&uri, Some(r#"{"reason": "I turn it on by hand"}"#)),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "rejected");
        assert_eq!(body["rejection_reason"], "I turn it on by hand");

        // Enabling a rejected pattern is not a valid transition
        let uri = format!("/api/v1/patterns/{}/enable", pattern.id);
        let (status, body) = send(&app.router, post_req(&uri, None)).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"]["code"], "INVALID_TRANSITION");

        let uri = format!("/api/v1/patterns/{}/reactivate", pattern.id);
        let (status, body) = send(&app.router, post_req(&uri, None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "suggested");
    }

    #[tokio::test]
    async fn test_reject_without_body() {
        let app = create_test_app();
        let pattern = seeded_pattern(&app).await;

        let uri = format!("/api/v1/patterns/{}/reject", pattern.id);
        let (status, body) = send(&app.router, post_req(&uri, None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "rejected");
    }

    #[tokio::test]
    async fn test_test_mode_and_delete() {
        let app = create_test_app();
        let pattern = seeded_pattern(&app).await;

        let uri = format!("/api/v1/patterns/{}/test-mode", pattern.id);
        let request = Request::builder()
            .method("PUT")
            .uri(&uri)
            .header("Content-Type", "application/json")
            .body(Body::from(r#"{"enabled": true}"#))
            .unwrap();
        let (status, body) = send(&app.router, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["test_mode"], true);

        let uri = format!("/api/v1/patterns/{}", pattern.id);
        let request = Request::builder()
            .method("DELETE")
            .uri(&uri)
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(&app.router, request).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, _) = send(&app.router, get_req(&uri)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_analysis_status_after_run() {
        let app = create_test_app();
        app.engine.run_now().await;

        let (status, body) = send(&app.router, get_req("/api/v1/analysis/status")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["running"], false);
        assert_eq!(body["last_run"]["outcome"]["state"], "completed");
    }

    #[tokio::test]
    async fn test_start_analysis() {
        let app = create_test_app();
        let (status, body) = send(&app.router, post_req("/api/v1/analysis", None)).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["status"], "started");
    }
}
