//! Notification Bus: publish/subscribe for live scheduler state.
//!
//! Publishers emit [`BusMessage`]s tagged with a [`Category`] and a key.
//! Subscribers ask for a [`Topic`] (a whole category or one key within it)
//! and receive a cancellable stream. Two interchangeable backends:
//!
//! - [`MemoryBackend`]: a broadcast channel plus a moka cache of latest
//!   values, for a single process.
//! - [`RedisBackend`]: Redis pub/sub plus `SET EX` latest values, for
//!   several scheduler or API processes sharing one bus.

pub mod backend;
pub mod bus;
pub mod config;
pub mod error;
pub mod memory;
pub mod message;
pub mod redis_backend;

pub use backend::BusBackend;
pub use bus::{NotificationBus, Subscription};
pub use config::BusConfig;
pub use error::BusError;
pub use memory::MemoryBackend;
pub use message::{BusMessage, Category, Topic};
pub use redis_backend::RedisBackend;
