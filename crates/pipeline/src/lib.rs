//! Output Artifact Pipeline.
//!
//! Turns the raw outputs of a finished run into stored blobs, attachment
//! rows and the JSON written to `tasks.output_values`.

pub mod attachments;
pub mod blob;
pub mod error;
pub mod media;
pub mod pipeline;

pub use attachments::AttachmentService;
pub use blob::{BlobStore, LocalBlobStore, MemoryBlobStore};
pub use error::{BlobError, PipelineError};
pub use pipeline::{CollectedOutputs, OutputPipeline};
