pub mod health;
pub mod nodes;
pub mod tasks;
pub mod workflows;

use axum::routing::get;
use axum::Router;

use crate::handlers;
use crate::state::AppState;
use crate::ws;

/// Build the `/api/v1` route tree.
///
/// ```text
/// /ws?category=&key=                   bus subscription (WebSocket)
///
/// /workflows                           register (POST)
/// /workflows/{id}                      get
/// /workflows/{id}/executions           submit execution (POST)
///
/// /tasks/running?workflow_id=          queued and in-flight tasks
/// /tasks/{id}                          task detail with events
///
/// /nodes                               list, import (POST)
/// /nodes/{id}                          remove (DELETE)
/// /nodes/{id}/actions                  interrupt, reboot, free memory (POST)
/// /nodes/{id}/events                   status and action history
///
/// /notifications                       caller's notifications
/// ```
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/ws", get(ws::ws_handler))
        .nest("/workflows", workflows::router())
        .nest("/tasks", tasks::router())
        .nest("/nodes", nodes::router())
        .route(
            "/notifications",
            get(handlers::notifications::list_notifications),
        )
}
