//! Fleet core domain logic.
//!
//! Pure functions and types shared by the persistence layer, the scheduler
//! and the HTTP surface. This crate has no internal dependencies so every
//! other crate can lean on it:
//!
//! - [`admission`]: input resolution, pricing, weighting and balance checks.
//! - [`fanout`]: batch expansion of one request into child task plans.
//! - [`status`]: status enums and the task state machine.
//! - [`node`]: node status machine, auth modes, control actions, load scoring.
//! - [`backoff`]: exponential backoff with jitter.

pub mod admission;
pub mod backoff;
pub mod error;
pub mod fanout;
pub mod hashing;
pub mod node;
pub mod status;
pub mod types;
pub mod workflow;
