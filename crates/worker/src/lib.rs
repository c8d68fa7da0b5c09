//! Scheduling core: node registry, worker pool, admission, dispatch loop
//! and job runner.
//!
//! [`Scheduler`] builds the components from a [`TaskStore`], a
//! [`NotificationBus`], a [`NodeConnector`] and a [`BlobStore`], and owns
//! their start-up and shutdown. Each component is usable on its own.
//!
//! [`TaskStore`]: fleet_db::TaskStore
//! [`NotificationBus`]: fleet_events::NotificationBus
//! [`NodeConnector`]: fleet_comfyui::NodeConnector
//! [`BlobStore`]: fleet_pipeline::BlobStore

pub mod admission;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod pool;
pub mod prompt;
pub mod recovery;
pub mod registry;
pub mod runner;
pub mod scheduler;

pub use admission::{Admission, Submission};
pub use config::SchedulerConfig;
pub use dispatcher::Dispatcher;
pub use error::SchedulerError;
pub use pool::{Lease, WorkerPool};
pub use registry::{NodeRegistry, NodeView};
pub use runner::{JobOutcome, JobRunner};
pub use scheduler::Scheduler;
