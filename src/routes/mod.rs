//! HTTP route handlers.
//!
//! Each sub-module corresponds to an API endpoint group. Failures are returned
//! as `(status, {"error": ..., "code": ...})` and also pushed to the
//! notification queue so whoever renders messages sees them.

pub mod health;
pub mod messages;
pub mod tunnels;

use axum::{
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;

use crate::error::TunnelError;
use crate::AppState;

/// Error half of every handler's result.
pub type ApiError = (StatusCode, Json<Value>);

/// Map a [`TunnelError`] onto its HTTP status and JSON body.
pub fn api_error(err: &TunnelError) -> ApiError {
    let status = match err {
        TunnelError::Validation(_) => StatusCode::BAD_REQUEST,
        TunnelError::PortConflict { .. } => StatusCode::CONFLICT,
        TunnelError::NotFound(_) => StatusCode::NOT_FOUND,
        TunnelError::Launch { .. } | TunnelError::Io { .. } | TunnelError::Stop { .. } => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (
        status,
        Json(json!({"error": err.to_string(), "code": err.code()})),
    )
}

/// All API routes with request tracing.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health::health))
        .route("/api/messages", get(messages::drain))
        .route("/api/tunnels", get(tunnels::list).post(tunnels::add))
        .route("/api/tunnels/{id}", delete(tunnels::remove))
        .route("/api/tunnels/{id}/command", get(tunnels::command))
        .route("/api/tunnels/{id}/logs", get(tunnels::logs))
        .route("/api/tunnels/{id}/status", get(tunnels::status))
        .route("/api/tunnels/{id}/reload", post(tunnels::reload_one))
        .route("/api/reload", post(tunnels::reload_all))
        .route("/api/save", post(tunnels::save))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
