//! Fleet scheduler HTTP server library.
//!
//! Exposes config, state, error handling, routes and the bus WebSocket so
//! integration tests and the `fleet-server` binary can both use them.

pub mod config;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod response;
pub mod routes;
pub mod state;
pub mod ws;
