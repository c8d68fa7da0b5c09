//! Handlers for `/nodes`: import, removal, operator actions and history.
//!
//! Nodes are probed before they are persisted; an unreachable host is
//! reported as `502 NODE_UNREACHABLE` and nothing is stored.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use fleet_core::node::NodeAction;
use fleet_core::types::DbId;
use fleet_db::models::node::CreateNode;
use serde::Deserialize;
use serde_json::json;

use crate::error::AppResult;
use crate::response::DataResponse;
use crate::state::AppState;

/// Default number of history entries returned.
const DEFAULT_EVENT_LIMIT: i64 = 50;

/// Upper bound on `limit`.
const MAX_EVENT_LIMIT: i64 = 500;

#[derive(Debug, Deserialize)]
pub struct ControlNode {
    pub action: NodeAction,
}

#[derive(Debug, Deserialize)]
pub struct EventQuery {
    pub limit: Option<i64>,
}

/// GET /api/v1/nodes
///
/// Persisted nodes with live status, busy flag and load score.
pub async fn list_nodes(State(state): State<AppState>) -> AppResult<impl IntoResponse> {
    let nodes = state.scheduler.registry().node_views().await?;
    Ok(Json(DataResponse { data: nodes }))
}

/// POST /api/v1/nodes
pub async fn import_node(
    State(state): State<AppState>,
    Json(input): Json<CreateNode>,
) -> AppResult<impl IntoResponse> {
    let node = state.scheduler.registry().import_node(input).await?;
    Ok((StatusCode::CREATED, Json(DataResponse { data: node })))
}

/// DELETE /api/v1/nodes/{id}
///
/// Interrupts the node's current job, closes its connection, clears its
/// history and deletes it. Returns 204.
pub async fn remove_node(
    State(state): State<AppState>,
    Path(node_id): Path<DbId>,
) -> AppResult<StatusCode> {
    state.scheduler.registry().remove_node(node_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/v1/nodes/{id}/actions
pub async fn control_node(
    State(state): State<AppState>,
    Path(node_id): Path<DbId>,
    Json(body): Json<ControlNode>,
) -> AppResult<impl IntoResponse> {
    state
        .scheduler
        .registry()
        .control_node(node_id, body.action)
        .await?;
    Ok(Json(DataResponse {
        data: json!({ "node_id": node_id, "action": body.action }),
    }))
}

/// GET /api/v1/nodes/{id}/events?limit=
///
/// Status changes and operator actions, newest first.
pub async fn list_node_events(
    State(state): State<AppState>,
    Path(node_id): Path<DbId>,
    Query(params): Query<EventQuery>,
) -> AppResult<impl IntoResponse> {
    let limit = params
        .limit
        .unwrap_or(DEFAULT_EVENT_LIMIT)
        .clamp(1, MAX_EVENT_LIMIT);
    let events = state
        .scheduler
        .store()
        .list_node_events(node_id, limit)
        .await?;
    Ok(Json(DataResponse { data: events }))
}
