use axum::extract::State;
use axum::{routing::get, Json, Router};
use fleet_core::status::NodeStatus;
use serde::Serialize;

use crate::state::AppState;

/// Health check response payload.
#[derive(Serialize)]
pub struct HealthResponse {
    /// Overall service status.
    pub status: &'static str,
    /// Crate version from Cargo.toml.
    pub version: &'static str,
    /// Whether the task store is reachable.
    pub db_healthy: bool,
    /// Notification bus backend in use.
    pub bus: &'static str,
    /// Nodes currently connected.
    pub nodes_online: usize,
}

/// GET /health -- returns service and store health.
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let db_healthy = state.scheduler.store().ping().await.is_ok();
    let status = if db_healthy { "ok" } else { "degraded" };

    let nodes_online = state
        .scheduler
        .registry()
        .pool()
        .snapshot()
        .iter()
        .filter(|e| matches!(e.status, NodeStatus::Online | NodeStatus::Executing))
        .count();

    Json(HealthResponse {
        status,
        version: env!("CARGO_PKG_VERSION"),
        db_healthy,
        bus: state.scheduler.bus().backend_name(),
        nodes_online,
    })
}

/// Mount health check routes (root-level, not under `/api/v1`).
pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}
