//! Repository for the `triggers` table.

use fleet_core::types::DbId;
use sqlx::{PgExecutor, PgPool};

use crate::models::trigger::{NewTrigger, Trigger};

const COLUMNS: &str = "id, kind_id, user_id, token_id, created_at";

pub struct TriggerRepo;

impl TriggerRepo {
    pub async fn insert<'e, E: PgExecutor<'e>>(
        executor: E,
        input: &NewTrigger,
    ) -> Result<Trigger, sqlx::Error> {
        let query = format!(
            "INSERT INTO triggers (kind_id, user_id, token_id) VALUES ($1, $2, $3) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Trigger>(&query)
            .bind(input.kind.id())
            .bind(input.user_id)
            .bind(input.token_id)
            .fetch_one(executor)
            .await
    }

    pub async fn find_by_id(pool: &PgPool, id: DbId) -> Result<Option<Trigger>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM triggers WHERE id = $1");
        sqlx::query_as::<_, Trigger>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }
}
