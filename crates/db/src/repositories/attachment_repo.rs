//! Repository for the `attachments` and `task_attachments` tables.

use fleet_core::status::AttachmentStatus;
use fleet_core::types::DbId;
use sqlx::PgPool;

use crate::models::attachment::{Attachment, NewAttachment, TaskAttachment};

/// Column list for `attachments` queries.
const COLUMNS: &str = "\
    id, file_name, hash, size, kind_id, ratio, status_id, storage, \
    task_id, workflow_id, created_at, updated_at";

pub struct AttachmentRepo;

impl AttachmentRepo {
    /// Insert a `Pending` attachment row, before the blob store call.
    pub async fn create(pool: &PgPool, input: &NewAttachment) -> Result<Attachment, sqlx::Error> {
        let query = format!(
            "INSERT INTO attachments \
                 (file_name, hash, size, kind_id, ratio, status_id, storage, task_id, workflow_id) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Attachment>(&query)
            .bind(&input.file_name)
            .bind(&input.hash)
            .bind(input.size)
            .bind(input.kind.id())
            .bind(input.ratio)
            .bind(AttachmentStatus::Pending.id())
            .bind(&input.storage)
            .bind(input.task_id)
            .bind(input.workflow_id)
            .fetch_one(pool)
            .await
    }

    pub async fn set_status(
        pool: &PgPool,
        id: DbId,
        status: AttachmentStatus,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE attachments SET status_id = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(status.id())
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Promote a `Pending` row to `Uploaded`. Fails with a unique
    /// violation when another row with the same hash is already uploaded.
    pub async fn mark_uploaded(pool: &PgPool, id: DbId) -> Result<Option<Attachment>, sqlx::Error> {
        let query = format!(
            "UPDATE attachments SET status_id = $2, updated_at = NOW() \
             WHERE id = $1 AND status_id = $3 \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Attachment>(&query)
            .bind(id)
            .bind(AttachmentStatus::Uploaded.id())
            .bind(AttachmentStatus::Pending.id())
            .fetch_optional(pool)
            .await
    }

    pub async fn find_by_id(pool: &PgPool, id: DbId) -> Result<Option<Attachment>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM attachments WHERE id = $1");
        sqlx::query_as::<_, Attachment>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// Oldest `Uploaded` attachment with the given content hash.
    pub async fn find_uploaded_by_hash(
        pool: &PgPool,
        hash: &str,
    ) -> Result<Option<Attachment>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM attachments \
             WHERE hash = $1 AND status_id = $2 \
             ORDER BY id ASC LIMIT 1"
        );
        sqlx::query_as::<_, Attachment>(&query)
            .bind(hash)
            .bind(AttachmentStatus::Uploaded.id())
            .fetch_optional(pool)
            .await
    }

    pub async fn list_links(pool: &PgPool, task_id: DbId) -> Result<Vec<TaskAttachment>, sqlx::Error> {
        sqlx::query_as::<_, TaskAttachment>(
            "SELECT task_id, attachment_id, output_key FROM task_attachments \
             WHERE task_id = $1 ORDER BY output_key ASC, attachment_id ASC",
        )
        .bind(task_id)
        .fetch_all(pool)
        .await
    }
}
