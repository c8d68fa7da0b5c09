use axum::routing::get;
use axum::Router;

use crate::handlers::tasks;
use crate::state::AppState;

/// Routes mounted at `/tasks`.
///
/// ```text
/// GET /running               -> running_tasks
/// GET /{id}                  -> get_task
/// ```
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/running", get(tasks::running_tasks))
        .route("/{id}", get(tasks::get_task))
}
