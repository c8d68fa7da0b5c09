//! Task entity models and DTOs for the scheduling engine.

use fleet_core::admission::Charge;
use fleet_core::status::{StatusId, TaskStatus};
use fleet_core::types::{DbId, Timestamp};
use serde::Serialize;
use sqlx::FromRow;

use super::trigger::NewTrigger;

/// A row from the `tasks` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Task {
    pub id: DbId,
    pub workflow_id: DbId,
    pub parent_id: Option<DbId>,
    pub node_id: Option<DbId>,
    pub trigger_id: DbId,
    pub repeat_count: i32,
    pub input_values: serde_json::Value,
    pub output_values: Option<serde_json::Value>,
    /// Lower runs first.
    pub weight: f64,
    pub cost: f64,
    pub status_id: StatusId,
    pub execution_time_ms: Option<i64>,
    /// The workflow declares a media output, so success implies attachments.
    pub expects_files: bool,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Task {
    pub fn status(&self) -> Option<TaskStatus> {
        TaskStatus::from_id(self.status_id)
    }

    pub fn is_parent(&self) -> bool {
        self.status() == Some(TaskStatus::Parent)
    }
}

/// A row from the `task_events` table. Append-only.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct TaskEvent {
    pub id: DbId,
    pub task_id: DbId,
    pub status_id: StatusId,
    pub details: Option<String>,
    /// Raw node payload, when there is one.
    pub data: Option<serde_json::Value>,
    pub created_at: Timestamp,
}

/// One task row to insert.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub workflow_id: DbId,
    pub repeat_count: i32,
    pub input_values: serde_json::Value,
    pub weight: f64,
    pub cost: f64,
    pub expects_files: bool,
}

/// Everything persisted for one admitted request, in one transaction.
#[derive(Debug, Clone)]
pub struct NewExecution {
    pub trigger: NewTrigger,
    /// Present for batches; children reference it.
    pub parent: Option<NewTask>,
    /// Dispatchable tasks. Exactly one when there is no parent.
    pub children: Vec<NewTask>,
    /// Debit applied conditionally in the same transaction.
    pub charge: Option<Charge>,
}

/// Result of persisting a [`NewExecution`].
#[derive(Debug, Clone)]
pub struct CreatedExecution {
    pub trigger_id: DbId,
    pub parent: Option<Task>,
    pub tasks: Vec<Task>,
}

impl CreatedExecution {
    /// The id callers see: the parent for batches, else the single task.
    pub fn root_task_id(&self) -> Option<DbId> {
        self.parent
            .as_ref()
            .or_else(|| self.tasks.first())
            .map(|t| t.id)
    }
}

/// Outcome of a successful run.
#[derive(Debug, Clone)]
pub struct TaskCompletion {
    pub output_values: serde_json::Value,
    pub execution_time_ms: i64,
    /// `(attachment_id, output_key)` pairs to link.
    pub attachments: Vec<(DbId, String)>,
}
