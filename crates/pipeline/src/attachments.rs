//! Content-addressed attachment storage.
//!
//! Identical bytes are stored once: a blob whose hash matches an
//! `Uploaded` attachment reuses that row. Otherwise the row is created
//! `Pending`, the blob is uploaded, and the row is promoted to `Uploaded`
//! or `Failed`.
//!
//! Stores of the same hash are serialized within the process. Across
//! processes the store keeps one `Uploaded` row per hash and promotion
//! returns whichever row got there first.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use fleet_core::hashing::content_hash;
use fleet_core::status::{AttachmentKind, AttachmentStatus};
use fleet_core::types::DbId;
use fleet_db::models::attachment::{Attachment, NewAttachment};
use fleet_db::TaskStore;
use tokio::sync::Mutex as AsyncMutex;

use crate::blob::BlobStore;
use crate::error::PipelineError;

/// Where a stored blob belongs.
#[derive(Debug, Clone, Copy, Default)]
pub struct Owner {
    pub task_id: Option<DbId>,
    pub workflow_id: Option<DbId>,
}

type HashLocks = Mutex<HashMap<String, Arc<AsyncMutex<()>>>>;

#[derive(Clone)]
pub struct AttachmentService {
    store: Arc<dyn TaskStore>,
    blobs: Arc<dyn BlobStore>,
    in_flight: Arc<HashLocks>,
}

impl AttachmentService {
    pub fn new(store: Arc<dyn TaskStore>, blobs: Arc<dyn BlobStore>) -> Self {
        Self {
            store,
            blobs,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn blobs(&self) -> &Arc<dyn BlobStore> {
        &self.blobs
    }

    /// Store `bytes` under `file_name`, or reuse an identical upload.
    pub async fn store(
        &self,
        bytes: &[u8],
        file_name: &str,
        kind: AttachmentKind,
        ratio: Option<f64>,
        owner: Owner,
    ) -> Result<Attachment, PipelineError> {
        let hash = content_hash(bytes);

        let lock = self.hash_lock(&hash);
        let guard = lock.lock().await;
        let result = self
            .store_unique(bytes, file_name, kind, ratio, owner, hash.clone())
            .await;
        drop(guard);
        drop(lock);
        self.release_hash_lock(&hash);
        result
    }

    fn hash_lock(&self, hash: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(hash.to_string()).or_default())
    }

    fn release_hash_lock(&self, hash: &str) {
        let mut locks = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if locks.get(hash).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(hash);
        }
    }

    async fn store_unique(
        &self,
        bytes: &[u8],
        file_name: &str,
        kind: AttachmentKind,
        ratio: Option<f64>,
        owner: Owner,
        hash: String,
    ) -> Result<Attachment, PipelineError> {
        if let Some(existing) = self.store.find_uploaded_attachment_by_hash(&hash).await? {
            tracing::debug!(
                attachment_id = existing.id,
                hash = %hash,
                "Reusing uploaded attachment",
            );
            return Ok(existing);
        }

        let attachment = self
            .store
            .create_attachment(&NewAttachment {
                file_name: file_name.to_string(),
                hash,
                size: bytes.len() as i64,
                kind,
                ratio,
                storage: self.blobs.tag().to_string(),
                task_id: owner.task_id,
                workflow_id: owner.workflow_id,
            })
            .await?;

        match self.blobs.upload(bytes, file_name).await {
            Ok(()) => Ok(self.store.promote_attachment(attachment.id).await?),
            Err(e) => {
                tracing::error!(
                    attachment_id = attachment.id,
                    file_name,
                    error = %e,
                    "Blob upload failed",
                );
                self.store
                    .set_attachment_status(attachment.id, AttachmentStatus::Failed)
                    .await?;
                Err(e.into())
            }
        }
    }

    /// Bytes of an uploaded attachment.
    pub async fn read(&self, attachment_id: DbId) -> Result<(Attachment, Vec<u8>), PipelineError> {
        let attachment = self
            .store
            .find_attachment(attachment_id)
            .await?
            .filter(|a| a.status() == Some(AttachmentStatus::Uploaded))
            .ok_or(fleet_db::StoreError::NotFound {
                entity: "attachment",
                id: attachment_id,
            })?;
        let bytes = self.blobs.get(&attachment.file_name).await?;
        Ok((attachment, bytes))
    }
}
