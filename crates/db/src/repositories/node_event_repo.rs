//! Repository for the `node_events` history table.

use fleet_core::status::NodeEventKind;
use fleet_core::types::DbId;
use sqlx::PgPool;

use crate::models::node::NodeEvent;

const COLUMNS: &str = "id, node_id, kind_id, detail, created_at";

pub struct NodeEventRepo;

impl NodeEventRepo {
    pub async fn insert(
        pool: &PgPool,
        node_id: DbId,
        kind: NodeEventKind,
        detail: &serde_json::Value,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("INSERT INTO node_events (node_id, kind_id, detail) VALUES ($1, $2, $3)")
            .bind(node_id)
            .bind(kind.id())
            .bind(detail)
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn list_recent(
        pool: &PgPool,
        node_id: DbId,
        limit: i64,
    ) -> Result<Vec<NodeEvent>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM node_events WHERE node_id = $1 \
             ORDER BY created_at DESC, id DESC LIMIT $2"
        );
        sqlx::query_as::<_, NodeEvent>(&query)
            .bind(node_id)
            .bind(limit)
            .fetch_all(pool)
            .await
    }

    pub async fn clear(pool: &PgPool, node_id: DbId) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM node_events WHERE node_id = $1")
            .bind(node_id)
            .execute(pool)
            .await?;
        Ok(result.rows_affected())
    }
}
