//! What caused a task to exist.

use fleet_core::status::{StatusId, TriggerKind};
use fleet_core::types::{DbId, Timestamp};
use serde::Serialize;
use sqlx::FromRow;

/// A row from the `triggers` table. Immutable once written.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Trigger {
    pub id: DbId,
    pub kind_id: StatusId,
    /// For token triggers this is the token owner.
    pub user_id: Option<DbId>,
    pub token_id: Option<DbId>,
    pub created_at: Timestamp,
}

impl Trigger {
    pub fn kind(&self) -> Option<TriggerKind> {
        TriggerKind::from_id(self.kind_id)
    }
}

#[derive(Debug, Clone)]
pub struct NewTrigger {
    pub kind: TriggerKind,
    pub user_id: Option<DbId>,
    pub token_id: Option<DbId>,
}
