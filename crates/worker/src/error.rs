use std::time::Duration;

use fleet_comfyui::NodeError;
use fleet_core::error::CoreError;
use fleet_core::types::DbId;
use fleet_db::StoreError;
use fleet_pipeline::PipelineError;

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// Validation, not-found and balance rejections.
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("Store error: {0}")]
    Store(StoreError),

    #[error("Node at {host} unreachable: {source}")]
    NodeUnreachable {
        host: String,
        #[source]
        source: NodeError,
    },

    #[error("Node error: {0}")]
    Node(#[from] NodeError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Pipeline timed out after {0:?}")]
    PipelineTimeout(Duration),

    #[error("Cancelled")]
    Cancelled,
}

impl From<StoreError> for SchedulerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { .. } | StoreError::InsufficientBalance { .. } => {
                SchedulerError::Core(err.into())
            }
            other => SchedulerError::Store(other),
        }
    }
}

impl SchedulerError {
    pub fn not_found(entity: &'static str, id: DbId) -> Self {
        SchedulerError::Core(CoreError::NotFound { entity, id })
    }

    pub fn validation(message: impl Into<String>) -> Self {
        SchedulerError::Core(CoreError::Validation(message.into()))
    }
}
