//! Repository layer.
//!
//! Each repository is a zero-sized struct providing async query methods
//! that accept a `&PgPool` (or any executor, for calls that join a
//! transaction) as the first argument.

pub mod attachment_repo;
pub mod ledger_repo;
pub mod node_event_repo;
pub mod node_repo;
pub mod notification_repo;
pub mod task_event_repo;
pub mod task_repo;
pub mod trigger_repo;
pub mod workflow_repo;

pub use attachment_repo::AttachmentRepo;
pub use ledger_repo::LedgerRepo;
pub use node_event_repo::NodeEventRepo;
pub use node_repo::NodeRepo;
pub use notification_repo::NotificationRepo;
pub use task_event_repo::TaskEventRepo;
pub use task_repo::TaskRepo;
pub use trigger_repo::TriggerRepo;
pub use workflow_repo::WorkflowRepo;
