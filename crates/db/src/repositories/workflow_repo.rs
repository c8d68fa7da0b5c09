//! Repository for the `workflows` table.

use fleet_core::status::WorkflowStatus;
use fleet_core::types::DbId;
use sqlx::types::Json;
use sqlx::PgPool;

use crate::models::workflow::{CreateWorkflow, Workflow};

/// Column list for `workflows` queries.
const COLUMNS: &str = "\
    id, name, graph, inputs, outputs, cost, base_weight, status_id, \
    created_at, updated_at";

pub struct WorkflowRepo;

impl WorkflowRepo {
    /// Insert an `Activated` workflow.
    pub async fn create(pool: &PgPool, input: &CreateWorkflow) -> Result<Workflow, sqlx::Error> {
        let query = format!(
            "INSERT INTO workflows (name, graph, inputs, outputs, cost, base_weight, status_id) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Workflow>(&query)
            .bind(&input.name)
            .bind(&input.graph)
            .bind(Json(&input.inputs))
            .bind(Json(&input.outputs))
            .bind(input.cost)
            .bind(input.base_weight)
            .bind(WorkflowStatus::Activated.id())
            .fetch_one(pool)
            .await
    }

    pub async fn find_by_id(pool: &PgPool, id: DbId) -> Result<Option<Workflow>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM workflows WHERE id = $1");
        sqlx::query_as::<_, Workflow>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }
}
