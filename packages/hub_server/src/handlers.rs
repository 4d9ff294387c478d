use axum::{
    Json,
    extract::{Path, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use group_hub::{Attachment, HubError};
use tracing::warn;

use crate::AppState;
use crate::metrics::{self, WorkerGuard};
use crate::ticker;
use crate::transport;

/// JSON error body: `{"error": <code>, "message": <text>}`.
fn error_response(status: StatusCode, err: &HubError) -> Response {
    let body = serde_json::json!({
        "error": err.error_code(),
        "message": err.to_string(),
    });
    (status, Json(body)).into_response()
}

/// Make sure the group's ticker runs, then upgrade into a group session.
pub async fn ws_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    let group = state.config.group_for(&name);
    let id = format!("{}_{}", group, uuid::Uuid::new_v4());
    let attachment = match Attachment::new(group.as_str(), id) {
        Ok(a) => a,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, &e),
    };

    let tick = state.config.tick;
    let format = state.config.tick_format;
    let metrics = state.metrics.clone();
    let started = state
        .hub
        .notify(
            &group,
            move |group, control, hub| {
                ticker::run(group, control, hub, tick, format, WorkerGuard::new(metrics))
            },
            state.config.ttl,
        )
        .await;
    if let Err(e) = started {
        warn!(group = %group, "refusing connection: {}", e);
        return error_response(StatusCode::SERVICE_UNAVAILABLE, &e);
    }

    ws.on_upgrade(move |socket| transport::serve_socket(socket, attachment, state))
}

/// Diagnostics: members per group and groups with a running producer.
pub async fn monitor_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.hub.debug_info().await)
}

/// Health check endpoint - returns server status
pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let info = state.hub.debug_info().await;
    let snapshot = state.metrics.snapshot();

    let status = if state.hub.is_closed() {
        "closing"
    } else if snapshot.errors.websocket == 0 {
        "healthy"
    } else {
        "degraded"
    };

    Json(metrics::HealthStatus {
        status: status.to_string(),
        groups: info.sessions.len(),
        workers: info.workers.len(),
        connections: snapshot.connections.active,
        uptime_secs: snapshot.uptime_secs,
    })
}

/// Liveness check - returns 200 if the server is running
pub async fn health_live_handler() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "alive" }))
}

/// Metrics endpoint - returns detailed server metrics
pub async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.metrics.snapshot())
}
