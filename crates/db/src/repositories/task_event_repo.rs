//! Repository for the append-only `task_events` table.

use fleet_core::status::TaskStatus;
use fleet_core::types::DbId;
use sqlx::{PgExecutor, PgPool};

use crate::models::task::TaskEvent;

const COLUMNS: &str = "id, task_id, status_id, details, data, created_at";

pub struct TaskEventRepo;

impl TaskEventRepo {
    pub async fn insert<'e, E: PgExecutor<'e>>(
        executor: E,
        task_id: DbId,
        status: TaskStatus,
        details: Option<&str>,
        data: Option<&serde_json::Value>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO task_events (task_id, status_id, details, data) VALUES ($1, $2, $3, $4)",
        )
        .bind(task_id)
        .bind(status.id())
        .bind(details)
        .bind(data)
        .execute(executor)
        .await?;
        Ok(())
    }

    /// Insert the same event for many tasks.
    pub async fn insert_many<'e, E: PgExecutor<'e>>(
        executor: E,
        task_ids: &[DbId],
        status: TaskStatus,
        details: Option<&str>,
    ) -> Result<(), sqlx::Error> {
        if task_ids.is_empty() {
            return Ok(());
        }
        sqlx::query(
            "INSERT INTO task_events (task_id, status_id, details) \
             SELECT id, $2, $3 FROM UNNEST($1::BIGINT[]) AS id",
        )
        .bind(task_ids)
        .bind(status.id())
        .bind(details)
        .execute(executor)
        .await?;
        Ok(())
    }

    /// Events for a task in insertion order.
    pub async fn list_by_task(pool: &PgPool, task_id: DbId) -> Result<Vec<TaskEvent>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM task_events WHERE task_id = $1 ORDER BY id ASC");
        sqlx::query_as::<_, TaskEvent>(&query)
            .bind(task_id)
            .fetch_all(pool)
            .await
    }
}
