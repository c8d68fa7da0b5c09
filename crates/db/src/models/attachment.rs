//! Stored media blobs and their link to task outputs.

use fleet_core::status::{AttachmentKind, AttachmentStatus, StatusId};
use fleet_core::types::{DbId, Timestamp};
use serde::Serialize;
use sqlx::FromRow;

/// A row from the `attachments` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Attachment {
    pub id: DbId,
    pub file_name: String,
    /// SHA-256 hex of the blob bytes.
    pub hash: String,
    pub size: i64,
    pub kind_id: StatusId,
    /// Width / height for images.
    pub ratio: Option<f64>,
    pub status_id: StatusId,
    /// Blob store backend tag.
    pub storage: String,
    pub task_id: Option<DbId>,
    pub workflow_id: Option<DbId>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Attachment {
    pub fn status(&self) -> Option<AttachmentStatus> {
        AttachmentStatus::from_id(self.status_id)
    }

    pub fn kind(&self) -> Option<AttachmentKind> {
        AttachmentKind::from_id(self.kind_id)
    }
}

/// Insert DTO. New attachments always start `Pending`.
#[derive(Debug, Clone)]
pub struct NewAttachment {
    pub file_name: String,
    pub hash: String,
    pub size: i64,
    pub kind: AttachmentKind,
    pub ratio: Option<f64>,
    pub storage: String,
    pub task_id: Option<DbId>,
    pub workflow_id: Option<DbId>,
}

/// A row from the `task_attachments` link table.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize)]
pub struct TaskAttachment {
    pub task_id: DbId,
    pub attachment_id: DbId,
    pub output_key: String,
}
