//! Repository for the `nodes` table.

use fleet_core::types::DbId;
use sqlx::types::Json;
use sqlx::PgPool;

use crate::models::node::{CreateNode, Node};

/// Column list for `nodes` queries.
const COLUMNS: &str = "id, name, host, auth, resources, created_at, updated_at";

pub struct NodeRepo;

impl NodeRepo {
    pub async fn list(pool: &PgPool) -> Result<Vec<Node>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM nodes ORDER BY id ASC");
        sqlx::query_as::<_, Node>(&query).fetch_all(pool).await
    }

    pub async fn find_by_id(pool: &PgPool, id: DbId) -> Result<Option<Node>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM nodes WHERE id = $1");
        sqlx::query_as::<_, Node>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    pub async fn create(pool: &PgPool, input: &CreateNode) -> Result<Node, sqlx::Error> {
        let query = format!(
            "INSERT INTO nodes (name, host, auth) VALUES ($1, $2, $3) RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Node>(&query)
            .bind(&input.name)
            .bind(&input.host)
            .bind(Json(&input.auth))
            .fetch_one(pool)
            .await
    }

    pub async fn update_resources(
        pool: &PgPool,
        id: DbId,
        resources: &serde_json::Value,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE nodes SET resources = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(resources)
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Returns `true` if a row was deleted.
    pub async fn delete(pool: &PgPool, id: DbId) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM nodes WHERE id = $1")
            .bind(id)
            .execute(pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
