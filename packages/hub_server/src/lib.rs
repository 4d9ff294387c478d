//! WebSocket front end for [`group_hub`].
//!
//! Clients connect to `/ws/{name}` and join group `<prefix><name>`; the
//! first connection starts a ticker producer for that group.

use axum::{Router, routing::get};
use group_hub::Hub;
use std::sync::Arc;

pub mod config;
pub mod handlers;
pub mod metrics;
pub mod ticker;
pub mod transport;

use crate::config::HubConfig;
use crate::metrics::ServerMetrics;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<Hub>,
    pub config: Arc<HubConfig>,
    /// Server metrics for observability
    pub metrics: Arc<ServerMetrics>,
}

impl AppState {
    pub fn new(config: HubConfig) -> Self {
        Self {
            hub: Hub::with_session_mux(config.worker.clone()),
            config: Arc::new(config),
            metrics: Arc::new(ServerMetrics::new()),
        }
    }
}

/// Routes without middleware; `main` adds tracing and CORS layers.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws/{group}", get(handlers::ws_handler))
        .route("/mon", get(handlers::monitor_handler))
        .route("/health", get(handlers::health_handler))
        .route("/health/live", get(handlers::health_live_handler))
        .route("/metrics", get(handlers::metrics_handler))
        .with_state(state)
}
