use axum::routing::{delete, get, post};
use axum::Router;

use crate::handlers::nodes;
use crate::state::AppState;

/// Routes mounted at `/nodes`.
///
/// ```text
/// GET    /                   -> list_nodes
/// POST   /                   -> import_node
/// DELETE /{id}               -> remove_node
/// POST   /{id}/actions       -> control_node
/// GET    /{id}/events        -> list_node_events
/// ```
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(nodes::list_nodes).post(nodes::import_node))
        .route("/{id}", delete(nodes::remove_node))
        .route("/{id}/actions", post(nodes::control_node))
        .route("/{id}/events", get(nodes::list_node_events))
}
