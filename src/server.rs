//! HTTP surface of the host application.

use axum::{
    extract::State,
    http::StatusCode,
    middleware,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use tracing::error;

use crate::audit::middleware::capture_request;
use crate::audit::AuditRecorder;

#[derive(Debug, Clone)]
pub struct AppState {
    pub recorder: AuditRecorder,
    /// Whether inbound requests are recorded.
    pub capture: bool,
}

impl AppState {
    pub fn new(recorder: AuditRecorder, capture: bool) -> Self {
        Self { recorder, capture }
    }
}

/// Service routes, with request capture installed when enabled.
pub fn router(state: AppState) -> Router {
    let routes = Router::new()
        .route("/health", get(health_check))
        .route("/audit/verify", get(verify_endpoint))
        .with_state(state.clone());

    if state.capture {
        with_audit(routes, state.recorder)
    } else {
        routes
    }
}

/// Record every request that reaches `router`.
pub fn with_audit(router: Router, recorder: AuditRecorder) -> Router {
    router.layer(middleware::from_fn_with_state(recorder, capture_request))
}

async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "secure-audit",
        "timestamp": chrono::Utc::now()
    }))
}

async fn verify_endpoint(State(state): State<AppState>) -> Response {
    match state.recorder.verify().await {
        Ok(report) => {
            if !report.is_valid {
                error!("Possible audit log tampering: {}", report.summary());
            }
            (StatusCode::OK, Json(report)).into_response()
        }
        Err(e) => {
            error!("Audit log could not be verified: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}
