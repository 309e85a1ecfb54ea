//! `GET /api/messages`: drain the notification queue.

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::AppState;

/// Returns every queued notification, oldest first, and empties the queue.
pub async fn drain(State(state): State<AppState>) -> Json<Value> {
    let messages = state.notifier.drain().await;
    Json(json!({ "messages": messages }))
}
