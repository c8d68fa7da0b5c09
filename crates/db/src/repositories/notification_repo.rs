//! Repository for the `user_notifications` table.

use fleet_core::types::DbId;
use sqlx::PgPool;

use crate::models::notification::{NewNotification, UserNotification};

const COLUMNS: &str = "id, user_id, task_id, title, message, created_at";

pub struct NotificationRepo;

impl NotificationRepo {
    pub async fn create(
        pool: &PgPool,
        input: &NewNotification,
    ) -> Result<UserNotification, sqlx::Error> {
        let query = format!(
            "INSERT INTO user_notifications (user_id, task_id, title, message) \
             VALUES ($1, $2, $3, $4) RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, UserNotification>(&query)
            .bind(input.user_id)
            .bind(input.task_id)
            .bind(&input.title)
            .bind(&input.message)
            .fetch_one(pool)
            .await
    }

    pub async fn list_by_user(
        pool: &PgPool,
        user_id: DbId,
    ) -> Result<Vec<UserNotification>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM user_notifications WHERE user_id = $1 \
             ORDER BY created_at DESC, id DESC"
        );
        sqlx::query_as::<_, UserNotification>(&query)
            .bind(user_id)
            .fetch_all(pool)
            .await
    }
}
