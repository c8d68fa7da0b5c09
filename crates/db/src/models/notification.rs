//! Per-user notifications about finished or failed tasks.

use fleet_core::types::{DbId, Timestamp};
use serde::Serialize;
use sqlx::FromRow;

/// A row from the `user_notifications` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct UserNotification {
    pub id: DbId,
    pub user_id: DbId,
    pub task_id: Option<DbId>,
    pub title: String,
    pub message: String,
    pub created_at: Timestamp,
}

#[derive(Debug, Clone)]
pub struct NewNotification {
    pub user_id: DbId,
    pub task_id: Option<DbId>,
    pub title: String,
    pub message: String,
}
