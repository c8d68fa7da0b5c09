//! Domain model structs and DTOs.
//!
//! Each submodule contains:
//! - A `FromRow` + `Serialize` entity struct matching the database row
//! - Insert DTOs consumed by the store

pub mod account;
pub mod attachment;
pub mod node;
pub mod notification;
pub mod task;
pub mod trigger;
pub mod workflow;
