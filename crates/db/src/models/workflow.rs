//! Workflow definitions: a node graph plus typed inputs and outputs.

use fleet_core::status::{StatusId, WorkflowStatus};
use fleet_core::types::{DbId, Timestamp};
use fleet_core::workflow::{InputDefs, OutputDefs};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;

/// A row from the `workflows` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Workflow {
    pub id: DbId,
    pub name: String,
    /// Raw node graph submitted to nodes after input substitution.
    pub graph: serde_json::Value,
    pub inputs: Json<InputDefs>,
    pub outputs: Json<OutputDefs>,
    pub cost: f64,
    pub base_weight: f64,
    pub status_id: StatusId,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Workflow {
    pub fn status(&self) -> Option<WorkflowStatus> {
        WorkflowStatus::from_id(self.status_id)
    }

    pub fn is_active(&self) -> bool {
        self.status() == Some(WorkflowStatus::Activated)
    }
}

/// DTO for creating a workflow.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateWorkflow {
    pub name: String,
    pub graph: serde_json::Value,
    #[serde(default)]
    pub inputs: InputDefs,
    #[serde(default)]
    pub outputs: OutputDefs,
    #[serde(default)]
    pub cost: f64,
    #[serde(default)]
    pub base_weight: f64,
}
