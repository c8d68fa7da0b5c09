//! Handlers for `/tasks`.

use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::Json;
use fleet_core::error::CoreError;
use fleet_core::status::{aggregate_parent_status, TaskStatus};
use fleet_core::types::DbId;
use fleet_db::models::attachment::TaskAttachment;
use fleet_db::models::task::{Task, TaskEvent};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};
use crate::response::DataResponse;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct RunningQuery {
    pub workflow_id: Option<DbId>,
}

/// A task with its history. For a parent, `status` is aggregated from
/// the children.
#[derive(Debug, Serialize)]
pub struct TaskDetail {
    pub task: Task,
    pub status: Option<TaskStatus>,
    pub events: Vec<TaskEvent>,
    pub children: Vec<Task>,
    pub attachments: Vec<TaskAttachment>,
}

/// GET /api/v1/tasks/running?workflow_id=
///
/// Queued and in-flight tasks in claim order.
pub async fn running_tasks(
    State(state): State<AppState>,
    Query(params): Query<RunningQuery>,
) -> AppResult<impl IntoResponse> {
    let tasks = state.scheduler.running_tasks(params.workflow_id).await?;
    Ok(Json(DataResponse { data: tasks }))
}

/// GET /api/v1/tasks/{id}
pub async fn get_task(
    State(state): State<AppState>,
    Path(task_id): Path<DbId>,
) -> AppResult<impl IntoResponse> {
    let store = state.scheduler.store();
    let task = store
        .find_task(task_id)
        .await?
        .ok_or(AppError::Core(CoreError::NotFound {
            entity: "Task",
            id: task_id,
        }))?;

    let events = store.list_task_events(task_id).await?;
    let (children, status) = if task.is_parent() {
        let children = store.list_children(task_id).await?;
        let statuses: Vec<TaskStatus> = children.iter().filter_map(Task::status).collect();
        let status = aggregate_parent_status(&statuses);
        (children, Some(status))
    } else {
        (Vec::new(), task.status())
    };
    let attachments = store.list_task_attachments(task_id).await?;

    Ok(Json(DataResponse {
        data: TaskDetail {
            task,
            status,
            events,
            children,
            attachments,
        },
    }))
}
