//! Exponential-backoff reconnection for node WebSocket connections.
//!
//! When the connection drops, the connection task calls
//! [`reconnect_loop`] and keeps retrying with increasing delays until the
//! connection is restored or the [`CancellationToken`] fires.

use fleet_core::backoff::{Backoff, BackoffConfig};
use fleet_core::types::DbId;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::client::{WsConnection, WsEndpoint};
use crate::error::NodeError;
use crate::events::NodeLifecycle;

/// Backoff used between reconnect attempts.
pub fn reconnect_config() -> BackoffConfig {
    BackoffConfig {
        jitter: 0.1,
        ..BackoffConfig::default()
    }
}

/// Retry [`WsEndpoint::connect`] until it succeeds.
///
/// Every failed attempt is reported on `lifecycle` as a connection or auth
/// error. Returns `None` when `cancel` fires first.
pub async fn reconnect_loop(
    endpoint: &WsEndpoint,
    client_id: &str,
    config: BackoffConfig,
    lifecycle: &broadcast::Sender<NodeLifecycle>,
    cancel: &CancellationToken,
) -> Option<WsConnection> {
    let mut backoff = Backoff::new(config);
    let node_id = endpoint.node_id();

    loop {
        let delay = backoff.next();
        tracing::info!(
            node_id,
            attempt = backoff.attempts(),
            delay_ms = delay.as_millis() as u64,
            "Reconnecting to node",
        );

        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!(node_id, "Reconnect cancelled");
                return None;
            }
            _ = tokio::time::sleep(delay) => {}
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!(node_id, "Reconnect cancelled");
                return None;
            }
            result = endpoint.connect(client_id) => {
                match result {
                    Ok(conn) => {
                        tracing::info!(node_id, attempt = backoff.attempts(), "Reconnected to node");
                        return Some(conn);
                    }
                    Err(e) => {
                        tracing::warn!(
                            node_id,
                            error = %e,
                            "Reconnect attempt {} failed",
                            backoff.attempts(),
                        );
                        let _ = lifecycle.send(failure_event(node_id, &e));
                    }
                }
            }
        }
    }
}

/// Lifecycle event for a failed connection attempt.
pub fn failure_event(node_id: DbId, error: &NodeError) -> NodeLifecycle {
    match error {
        NodeError::Auth(msg) => NodeLifecycle::AuthError {
            node_id,
            error: msg.clone(),
        },
        other => NodeLifecycle::ConnectionError {
            node_id,
            error: other.to_string(),
        },
    }
}
