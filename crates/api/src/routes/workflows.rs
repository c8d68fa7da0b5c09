use axum::routing::{get, post};
use axum::Router;

use crate::handlers::workflows;
use crate::state::AppState;

/// Routes mounted at `/workflows`.
///
/// ```text
/// POST /                     -> create_workflow
/// GET  /{id}                 -> get_workflow
/// POST /{id}/executions      -> submit_execution
/// ```
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(workflows::create_workflow))
        .route("/{id}", get(workflows::get_workflow))
        .route("/{id}/executions", post(workflows::submit_execution))
}
