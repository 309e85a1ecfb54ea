//! Tunnel management endpoints.
//!
//! - `GET    /api/tunnels`             : list managed tunnels with liveness
//! - `POST   /api/tunnels`             : add and launch a tunnel
//! - `DELETE /api/tunnels/{id}`        : stop and forget a tunnel
//! - `GET    /api/tunnels/{id}/command`: forwarding command (text)
//! - `GET    /api/tunnels/{id}/logs`   : forwarder output (streamed text)
//! - `GET    /api/tunnels/{id}/status` : liveness of one tunnel
//! - `POST   /api/tunnels/{id}/reload` : restart one tunnel from the tunnel file
//! - `POST   /api/reload`              : replace all tunnels with the tunnel file
//! - `POST   /api/save`                : write managed tunnels to the tunnel file

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use tokio_util::io::ReaderStream;
use tracing::{error, info};

use super::{api_error, ApiError};
use crate::error::TunnelError;
use crate::tunnel::{tunnel_file, TunnelConfig};
use crate::AppState;

/// `GET /api/tunnels`
pub async fn list(State(state): State<AppState>) -> Json<Value> {
    let tunnels = state.registry.list_live().await;
    Json(json!({ "tunnels": tunnels }))
}

/// `POST /api/tunnels`: validate, launch and start managing a tunnel.
///
/// The id is generated when the body has none. Returns `201 {"id": ...}`.
pub async fn add(
    State(state): State<AppState>,
    Json(config): Json<TunnelConfig>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let name = config.name.clone();
    match state.registry.add(config).await {
        Ok(id) => {
            state
                .notifier
                .push(format!("Added tunnel '{name}' ({id})"))
                .await;
            Ok((StatusCode::CREATED, Json(json!({ "id": id }))))
        }
        Err(e) => {
            state
                .notifier
                .push(format!("Unable to add tunnel '{name}': {e}"))
                .await;
            Err(api_error(&e))
        }
    }
}

/// `DELETE /api/tunnels/{id}`
pub async fn remove(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    match state.registry.remove(&id).await {
        Ok(()) => {
            state.notifier.push(format!("Removed tunnel {id}")).await;
            Ok(Json(json!({ "id": id, "removed": true })))
        }
        Err(e) => {
            state
                .notifier
                .push(format!("Did not find any tunnel with id: {id}"))
                .await;
            Err(api_error(&e))
        }
    }
}

/// `GET /api/tunnels/{id}/command`: the command line, as plain text.
pub async fn command(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<String, ApiError> {
    state.registry.command(&id).await.map_err(|e| api_error(&e))
}

/// `GET /api/tunnels/{id}/status`
pub async fn status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let status = state.registry.status(&id).await.map_err(|e| api_error(&e))?;
    Ok(Json(json!(status)))
}

/// `GET /api/tunnels/{id}/logs`: stream the forwarder's output.
///
/// The file is append-only and may grow while streaming; the response ends
/// at whatever EOF the reader sees.
pub async fn logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let path = state.registry.log_path(&id).await.map_err(|e| api_error(&e))?;
    let file = match tokio::fs::File::open(&path).await {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err((
                StatusCode::NOT_FOUND,
                Json(json!({
                    "error": format!("No log file for tunnel {id}"),
                    "code": "LOG_NOT_FOUND",
                })),
            ));
        }
        Err(e) => return Err(api_error(&TunnelError::io("open tunnel log", &path, e))),
    };

    let body = Body::from_stream(ReaderStream::new(file));
    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        body,
    )
        .into_response())
}

/// `POST /api/tunnels/{id}/reload`: stop the tunnel if managed and start it
/// again from its definition in the tunnel file.
pub async fn reload_one(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let config = match tunnel_file::find(&state.tunnel_file, &id).await {
        Ok(c) => c,
        Err(e) => {
            let message = match &e {
                TunnelError::NotFound(_) => {
                    format!("Failed to find tunnel {id} in file: {}", state.tunnel_file.display())
                }
                _ => format!("Failed to parse tunnels from file: {e}"),
            };
            error!("{message}");
            state.notifier.push(message).await;
            return Err(api_error(&e));
        }
    };

    let name = config.name.clone();
    match state.registry.reload_one(config).await {
        Ok(id) => {
            info!("Tunnel {id} reloaded from file");
            state
                .notifier
                .push(format!("Reloaded tunnel '{name}' from file"))
                .await;
            Ok(Json(json!({ "id": id })))
        }
        Err(e) => {
            state
                .notifier
                .push(format!("Unable to reload tunnel '{name}': {e}"))
                .await;
            Err(api_error(&e))
        }
    }
}

/// `POST /api/reload`: stop everything, then add each tunnel in the file.
///
/// Returns `{"loaded": n, "total": m}`; partial success is still `200`.
pub async fn reload_all(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let configs = match tunnel_file::load(&state.tunnel_file).await {
        Ok(c) => c,
        Err(e) => {
            error!("Failed to parse tunnels from file: {e}");
            state
                .notifier
                .push(format!("Failed to parse tunnels from file: {e}"))
                .await;
            return Err(api_error(&e));
        }
    };
    let source = state.tunnel_file.display().to_string();
    let summary = state.registry.reload(configs, &source).await;
    Ok(Json(json!(summary)))
}

/// `POST /api/save`: write the managed tunnels' definitions to the tunnel file.
pub async fn save(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let configs = state.registry.configs().await;
    let path = &state.tunnel_file;
    match tunnel_file::save(path, &configs).await {
        Ok(()) => {
            info!("Saved {} tunnel(s) to {}", configs.len(), path.display());
            state
                .notifier
                .push(format!("Successfully saved tunnels to file: {}", path.display()))
                .await;
            Ok(Json(json!({ "saved": configs.len(), "path": path })))
        }
        Err(e) => {
            error!("{e}");
            state
                .notifier
                .push(format!("Failed to write tunnels to file: {e}"))
                .await;
            Err(api_error(&e))
        }
    }
}
