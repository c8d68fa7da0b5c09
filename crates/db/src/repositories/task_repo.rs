//! Repository for the `tasks` table.
//!
//! Status changes go through [`TaskStatus::allowed_sources`] so an update
//! only applies when the current row status permits it, and each change
//! writes its `task_events` row in the same transaction.

use fleet_core::status::{StatusId, TaskStatus};
use fleet_core::types::DbId;
use sqlx::{PgExecutor, PgPool};

use crate::error::StoreError;
use crate::models::task::{CreatedExecution, NewExecution, NewTask, Task, TaskCompletion};
use crate::repositories::{LedgerRepo, TaskEventRepo, TriggerRepo};
use crate::store::REQUEUE_DETAIL;

/// Column list for `tasks` queries.
const COLUMNS: &str = "\
    id, workflow_id, parent_id, node_id, trigger_id, repeat_count, \
    input_values, output_values, weight, cost, status_id, \
    execution_time_ms, expects_files, created_at, updated_at";

/// Claim order: lowest weight first, then oldest.
const CLAIM_ORDER: &str = "ORDER BY weight ASC, created_at ASC, id ASC";

/// Statuses shown in running-task views.
const ACTIVE_STATUSES: [StatusId; 3] = [
    TaskStatus::Queuing as StatusId,
    TaskStatus::Pending as StatusId,
    TaskStatus::Running as StatusId,
];

fn source_ids(to: TaskStatus) -> Vec<StatusId> {
    to.allowed_sources().into_iter().map(TaskStatus::id).collect()
}

pub struct TaskRepo;

impl TaskRepo {
    // -- creation -------------------------------------------------------------

    /// Persist a whole admitted request in one transaction.
    pub async fn create_execution(
        pool: &PgPool,
        plan: &NewExecution,
    ) -> Result<CreatedExecution, StoreError> {
        let mut tx = pool.begin().await?;

        if let Some(charge) = plan.charge {
            if !LedgerRepo::debit(&mut *tx, charge.ledger, charge.amount).await? {
                let available = LedgerRepo::balance(&mut *tx, charge.ledger)
                    .await?
                    .unwrap_or(0.0);
                tx.rollback().await?;
                return Err(StoreError::InsufficientBalance {
                    ledger: charge.ledger,
                    required: charge.amount,
                    available,
                });
            }
        }

        let trigger = TriggerRepo::insert(&mut *tx, &plan.trigger).await?;

        let parent = match &plan.parent {
            Some(p) => {
                let task =
                    Self::insert(&mut *tx, p, trigger.id, None, TaskStatus::Parent).await?;
                TaskEventRepo::insert(&mut *tx, task.id, TaskStatus::Parent, Some("Batch created"), None)
                    .await?;
                Some(task)
            }
            None => None,
        };

        let parent_id = parent.as_ref().map(|p| p.id);
        let mut tasks = Vec::with_capacity(plan.children.len());
        for child in &plan.children {
            let task =
                Self::insert(&mut *tx, child, trigger.id, parent_id, TaskStatus::Queuing).await?;
            TaskEventRepo::insert(&mut *tx, task.id, TaskStatus::Queuing, Some("Queued"), None)
                .await?;
            tasks.push(task);
        }

        tx.commit().await?;

        Ok(CreatedExecution {
            trigger_id: trigger.id,
            parent,
            tasks,
        })
    }

    async fn insert<'e, E: PgExecutor<'e>>(
        executor: E,
        input: &NewTask,
        trigger_id: DbId,
        parent_id: Option<DbId>,
        status: TaskStatus,
    ) -> Result<Task, sqlx::Error> {
        let query = format!(
            "INSERT INTO tasks \
                 (workflow_id, parent_id, trigger_id, repeat_count, input_values, \
                  weight, cost, status_id, expects_files) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Task>(&query)
            .bind(input.workflow_id)
            .bind(parent_id)
            .bind(trigger_id)
            .bind(input.repeat_count)
            .bind(&input.input_values)
            .bind(input.weight)
            .bind(input.cost)
            .bind(status.id())
            .bind(input.expects_files)
            .fetch_one(executor)
            .await
    }

    // -- claiming -------------------------------------------------------------

    /// Atomically move up to `limit` queued tasks to `Pending`.
    ///
    /// Uses `SELECT FOR UPDATE SKIP LOCKED` so concurrent dispatchers never
    /// claim the same row.
    pub async fn claim_queued(pool: &PgPool, limit: i64) -> Result<Vec<Task>, sqlx::Error> {
        let mut tx = pool.begin().await?;

        let query = format!(
            "UPDATE tasks SET status_id = $1, updated_at = NOW() \
             WHERE id IN ( \
                 SELECT id FROM tasks \
                 WHERE status_id = $2 \
                 {CLAIM_ORDER} \
                 LIMIT $3 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             RETURNING {COLUMNS}"
        );
        let mut claimed = sqlx::query_as::<_, Task>(&query)
            .bind(TaskStatus::Pending.id())
            .bind(TaskStatus::Queuing.id())
            .bind(limit)
            .fetch_all(&mut *tx)
            .await?;

        let ids: Vec<DbId> = claimed.iter().map(|t| t.id).collect();
        TaskEventRepo::insert_many(&mut *tx, &ids, TaskStatus::Pending, Some("Claimed by dispatcher"))
            .await?;

        tx.commit().await?;

        // RETURNING does not preserve the subquery order.
        claimed.sort_by(|a, b| {
            a.weight
                .total_cmp(&b.weight)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });
        Ok(claimed)
    }

    // -- status changes -------------------------------------------------------

    /// Transition a task when its current status allows it, appending an event.
    pub async fn set_status(
        pool: &PgPool,
        task_id: DbId,
        status: TaskStatus,
        details: Option<&str>,
        data: Option<&serde_json::Value>,
    ) -> Result<bool, sqlx::Error> {
        let mut tx = pool.begin().await?;

        let result = sqlx::query(
            "UPDATE tasks SET status_id = $2, updated_at = NOW() \
             WHERE id = $1 AND status_id = ANY($3)",
        )
        .bind(task_id)
        .bind(status.id())
        .bind(source_ids(status))
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        TaskEventRepo::insert(&mut *tx, task_id, status, details, data).await?;
        tx.commit().await?;
        Ok(true)
    }

    pub async fn assign_node(pool: &PgPool, task_id: DbId, node_id: DbId) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE tasks SET node_id = $2, updated_at = NOW() WHERE id = $1")
            .bind(task_id)
            .bind(node_id)
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Mark a task `Success` with its outputs and attachment links.
    pub async fn complete(
        pool: &PgPool,
        task_id: DbId,
        completion: &TaskCompletion,
    ) -> Result<bool, sqlx::Error> {
        let mut tx = pool.begin().await?;

        let result = sqlx::query(
            "UPDATE tasks \
             SET status_id = $2, output_values = $3, execution_time_ms = $4, updated_at = NOW() \
             WHERE id = $1 AND status_id = ANY($5)",
        )
        .bind(task_id)
        .bind(TaskStatus::Success.id())
        .bind(&completion.output_values)
        .bind(completion.execution_time_ms)
        .bind(source_ids(TaskStatus::Success))
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        for (attachment_id, output_key) in &completion.attachments {
            sqlx::query(
                "INSERT INTO task_attachments (task_id, attachment_id, output_key) \
                 VALUES ($1, $2, $3) ON CONFLICT DO NOTHING",
            )
            .bind(task_id)
            .bind(attachment_id)
            .bind(output_key)
            .execute(&mut *tx)
            .await?;
        }

        TaskEventRepo::insert(&mut *tx, task_id, TaskStatus::Success, Some("Completed"), None)
            .await?;
        tx.commit().await?;
        Ok(true)
    }

    // -- queries --------------------------------------------------------------

    pub async fn find_by_id(pool: &PgPool, id: DbId) -> Result<Option<Task>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM tasks WHERE id = $1");
        sqlx::query_as::<_, Task>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    pub async fn list_children(pool: &PgPool, parent_id: DbId) -> Result<Vec<Task>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM tasks WHERE parent_id = $1 ORDER BY id ASC");
        sqlx::query_as::<_, Task>(&query)
            .bind(parent_id)
            .fetch_all(pool)
            .await
    }

    /// Non-terminal, non-parent tasks in claim order.
    pub async fn list_running(
        pool: &PgPool,
        workflow_id: Option<DbId>,
    ) -> Result<Vec<Task>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM tasks \
             WHERE status_id = ANY($1) AND ($2::BIGINT IS NULL OR workflow_id = $2) \
             {CLAIM_ORDER}"
        );
        sqlx::query_as::<_, Task>(&query)
            .bind(&ACTIVE_STATUSES[..])
            .bind(workflow_id)
            .fetch_all(pool)
            .await
    }

    // -- recovery -------------------------------------------------------------

    /// Requeue every `Pending`/`Running` task left over from a previous run.
    pub async fn requeue_interrupted(pool: &PgPool) -> Result<u64, sqlx::Error> {
        let mut tx = pool.begin().await?;

        let ids: Vec<DbId> = sqlx::query_scalar(
            "UPDATE tasks SET status_id = $1, node_id = NULL, updated_at = NOW() \
             WHERE status_id = ANY($2) \
             RETURNING id",
        )
        .bind(TaskStatus::Queuing.id())
        .bind(source_ids(TaskStatus::Queuing))
        .fetch_all(&mut *tx)
        .await?;

        TaskEventRepo::insert_many(&mut *tx, &ids, TaskStatus::Queuing, Some(REQUEUE_DETAIL)).await?;
        tx.commit().await?;
        Ok(ids.len() as u64)
    }

    /// Delete successful tasks whose media outputs never got attachments.
    pub async fn purge_outputless_successes(pool: &PgPool) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "DELETE FROM tasks t \
             WHERE t.status_id = $1 AND t.expects_files \
               AND NOT EXISTS (SELECT 1 FROM task_attachments ta WHERE ta.task_id = t.id)",
        )
        .bind(TaskStatus::Success.id())
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }
}
