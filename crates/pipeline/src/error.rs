use fleet_db::StoreError;

/// Errors from a [`BlobStore`](crate::BlobStore).
#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Blob not found: {0}")]
    NotFound(String),

    #[error("Invalid blob name: {0}")]
    InvalidName(String),
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Blob(#[from] BlobError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Image processing failed: {0}")]
    Image(#[from] image::ImageError),

    /// A blocking render task panicked or was cancelled.
    #[error("Render task failed: {0}")]
    Render(String),

    /// An output value could not be stored.
    #[error("Output '{key}' failed: {reason}")]
    Output { key: String, reason: String },
}
