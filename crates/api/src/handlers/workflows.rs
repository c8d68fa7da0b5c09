//! Handlers for `/workflows`: registration and execution submission.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use fleet_core::error::CoreError;
use fleet_core::types::DbId;
use fleet_db::models::workflow::CreateWorkflow;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::{AppError, AppResult};
use crate::middleware::requester::Caller;
use crate::response::DataResponse;
use crate::state::AppState;

/// Body of `POST /workflows/{id}/executions`.
#[derive(Debug, Deserialize)]
pub struct SubmitExecution {
    #[serde(default)]
    pub input: Map<String, Value>,
    #[serde(default = "default_repeat")]
    pub repeat: u32,
}

fn default_repeat() -> u32 {
    1
}

// ---------------------------------------------------------------------------
// Submit
// ---------------------------------------------------------------------------

/// POST /api/v1/workflows/{id}/executions
///
/// Admit an execution request: validate, price, debit and persist the
/// tasks. Returns 201 with `{task_id, cost, repeat_count, cached}`.
pub async fn submit_execution(
    Caller(requester): Caller,
    State(state): State<AppState>,
    Path(workflow_id): Path<DbId>,
    Json(body): Json<SubmitExecution>,
) -> AppResult<impl IntoResponse> {
    let submission = state
        .scheduler
        .submit_execution(workflow_id, &body.input, body.repeat, requester)
        .await?;

    tracing::info!(
        workflow_id,
        task_id = submission.task_id,
        cost = submission.cost,
        repeat = submission.repeat_count,
        "Execution submitted",
    );

    Ok((StatusCode::CREATED, Json(DataResponse { data: submission })))
}

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

/// POST /api/v1/workflows
pub async fn create_workflow(
    State(state): State<AppState>,
    Json(input): Json<CreateWorkflow>,
) -> AppResult<impl IntoResponse> {
    if input.name.trim().is_empty() {
        return Err(AppError::Core(CoreError::Validation(
            "Workflow name must not be empty".into(),
        )));
    }
    if !input.graph.is_object() {
        return Err(AppError::Core(CoreError::Validation(
            "Workflow graph must be a JSON object".into(),
        )));
    }

    let workflow = state.scheduler.store().create_workflow(&input).await?;
    tracing::info!(workflow_id = workflow.id, name = %workflow.name, "Workflow registered");
    Ok((StatusCode::CREATED, Json(DataResponse { data: workflow })))
}

/// GET /api/v1/workflows/{id}
pub async fn get_workflow(
    State(state): State<AppState>,
    Path(workflow_id): Path<DbId>,
) -> AppResult<impl IntoResponse> {
    let workflow = state
        .scheduler
        .store()
        .find_workflow(workflow_id)
        .await?
        .ok_or(AppError::Core(CoreError::NotFound {
            entity: "Workflow",
            id: workflow_id,
        }))?;
    Ok(Json(DataResponse { data: workflow }))
}
