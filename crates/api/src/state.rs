use std::sync::Arc;

use fleet_worker::Scheduler;

use crate::config::ServerConfig;

/// Shared application state available to all Axum handlers via `State<AppState>`.
///
/// Cheaply cloneable; everything is behind `Arc`.
#[derive(Clone)]
pub struct AppState {
    /// Owns the store, bus, node registry and dispatch loop.
    pub scheduler: Arc<Scheduler>,
    pub config: Arc<ServerConfig>,
}
