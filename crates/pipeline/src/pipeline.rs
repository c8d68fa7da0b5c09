//! [`OutputPipeline`]: persists the outputs of a successful run.
//!
//! Blob outputs are classified by magic bytes. Images get a preview and a
//! high JPEG rendition next to the raw original; video and other files are
//! stored as-is. Blob names follow `<task>_<key>_<idx>.<ext>`, with
//! `_preview.jpg` / `_high.jpg` suffixes for renditions.

use fleet_comfyui::{OutputValue, RunOutputs};
use fleet_core::status::AttachmentKind;
use fleet_core::types::DbId;
use fleet_db::models::task::Task;
use serde_json::{json, Map, Value};

use crate::attachments::{AttachmentService, Owner};
use crate::error::PipelineError;
use crate::media::{classify, render_renditions, Renditions};

/// What gets written back to the task.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CollectedOutputs {
    /// `tasks.output_values`: scalars as-is, blob outputs as lists of
    /// `{attachment_id, preview_id, high_id}`.
    pub values: Value,
    /// `(attachment_id, output_key)` links for `task_attachments`.
    pub attachments: Vec<(DbId, String)>,
}

/// Attachments stored for one blob.
#[derive(Debug, Clone, Copy, PartialEq)]
struct StoredItem {
    raw: DbId,
    preview: Option<DbId>,
    high: Option<DbId>,
}

#[derive(Clone)]
pub struct OutputPipeline {
    attachments: AttachmentService,
}

impl OutputPipeline {
    pub fn new(attachments: AttachmentService) -> Self {
        Self { attachments }
    }

    pub async fn collect(
        &self,
        task: &Task,
        outputs: RunOutputs,
    ) -> Result<CollectedOutputs, PipelineError> {
        let owner = Owner {
            task_id: Some(task.id),
            workflow_id: Some(task.workflow_id),
        };
        let mut values = Map::new();
        let mut links = Vec::new();

        for (key, value) in outputs {
            let blobs = match value {
                OutputValue::Blobs(blobs) => blobs,
                scalar => {
                    if let Some(v) = scalar.to_json() {
                        values.insert(key, v);
                    }
                    continue;
                }
            };

            let mut items = Vec::with_capacity(blobs.len());
            for (idx, bytes) in blobs.into_iter().enumerate() {
                let stored = self
                    .store_item(task.id, &key, idx, bytes, owner)
                    .await
                    .map_err(|e| PipelineError::Output {
                        key: key.clone(),
                        reason: e.to_string(),
                    })?;

                links.push((stored.raw, key.clone()));
                if let Some(id) = stored.preview {
                    links.push((id, format!("{key}_preview")));
                }
                if let Some(id) = stored.high {
                    links.push((id, format!("{key}_high")));
                }
                items.push(json!({
                    "attachment_id": stored.raw,
                    "preview_id": stored.preview,
                    "high_id": stored.high,
                }));
            }

            tracing::debug!(task_id = task.id, output = %key, items = items.len(), "Output stored");
            values.insert(key, Value::Array(items));
        }

        Ok(CollectedOutputs {
            values: Value::Object(values),
            attachments: links,
        })
    }

    async fn store_item(
        &self,
        task_id: DbId,
        key: &str,
        idx: usize,
        bytes: Vec<u8>,
        owner: Owner,
    ) -> Result<StoredItem, PipelineError> {
        let classified = classify(&bytes);
        let base = format!("{task_id}_{key}_{idx}");

        let (bytes, renditions) = if classified.kind == AttachmentKind::Image {
            self.render(bytes).await?
        } else {
            (bytes, None)
        };
        let ratio = renditions.as_ref().and_then(|r| r.ratio);

        let mut preview = None;
        let mut high = None;
        if let Some(r) = renditions {
            preview = self
                .store_rendition(r.preview, &format!("{base}_preview.jpg"), ratio, owner)
                .await;
            high = self
                .store_rendition(r.high, &format!("{base}_high.jpg"), ratio, owner)
                .await;
        }

        let raw = self
            .attachments
            .store(
                &bytes,
                &format!("{base}.{}", classified.extension),
                classified.kind,
                ratio,
                owner,
            )
            .await?;

        Ok(StoredItem {
            raw: raw.id,
            preview,
            high,
        })
    }

    /// Decode off the async runtime. Undecodable images are stored raw only.
    async fn render(&self, bytes: Vec<u8>) -> Result<(Vec<u8>, Option<Renditions>), PipelineError> {
        let (bytes, result) = tokio::task::spawn_blocking(move || {
            let result = render_renditions(&bytes);
            (bytes, result)
        })
        .await
        .map_err(|e| PipelineError::Render(e.to_string()))?;

        match result {
            Ok(r) => Ok((bytes, Some(r))),
            Err(e) => {
                tracing::warn!(error = %e, "Image could not be decoded, storing raw only");
                Ok((bytes, None))
            }
        }
    }

    /// Rendition failures are logged and skipped.
    async fn store_rendition(
        &self,
        bytes: Option<Vec<u8>>,
        name: &str,
        ratio: Option<f64>,
        owner: Owner,
    ) -> Option<DbId> {
        let bytes = bytes?;
        match self
            .attachments
            .store(&bytes, name, AttachmentKind::Image, ratio, owner)
            .await
        {
            Ok(a) => Some(a.id),
            Err(e) => {
                tracing::warn!(name, error = %e, "Rendition upload failed");
                None
            }
        }
    }
}
