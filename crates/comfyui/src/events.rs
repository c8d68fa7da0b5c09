//! Events a node client reports to the scheduler.
//!
//! [`NodeLifecycle`] is broadcast per node and consumed by the registry;
//! [`ExecutionEvent`] is sent per run to the job driving it.

use std::collections::BTreeMap;

use fleet_core::types::DbId;
use serde::Serialize;

/// Connection-level events for one node.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeLifecycle {
    /// The WebSocket connection was established.
    Connected { node_id: DbId },

    /// The WebSocket connection was lost or closed.
    Disconnected { node_id: DbId },

    /// Connecting failed for a reason other than credentials.
    ConnectionError { node_id: DbId, error: String },

    /// The node rejected our credentials.
    AuthError { node_id: DbId, error: String },

    /// GPU/CPU readings pushed by the node's monitor extension.
    SystemMonitor {
        node_id: DbId,
        payload: serde_json::Value,
    },

    /// Queue depth reported by the node.
    QueueStatus { node_id: DbId, queue_remaining: u32 },
}

impl NodeLifecycle {
    pub fn node_id(&self) -> DbId {
        match self {
            NodeLifecycle::Connected { node_id }
            | NodeLifecycle::Disconnected { node_id }
            | NodeLifecycle::ConnectionError { node_id, .. }
            | NodeLifecycle::AuthError { node_id, .. }
            | NodeLifecycle::SystemMonitor { node_id, .. }
            | NodeLifecycle::QueueStatus { node_id, .. } => *node_id,
        }
    }
}

/// Progress of a single run, in the order the node reports it.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionEvent {
    /// The prompt was accepted and waits for models to load.
    Pending { prompt_id: String },

    /// Execution started on the node.
    Start,

    /// Step-level progress inside a node.
    Progress {
        node: Option<String>,
        value: u32,
        max: u32,
    },

    /// Base64-encoded preview frame.
    Preview(String),
}

/// One workflow output value as produced by the node.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputValue {
    /// Raw file bytes, one entry per produced item.
    Blobs(Vec<Vec<u8>>),
    Text(String),
    Number(f64),
    Bool(bool),
}

impl OutputValue {
    /// JSON form stored in `tasks.output_values`. Blobs are stored as
    /// attachment links instead.
    pub fn to_json(&self) -> Option<serde_json::Value> {
        match self {
            OutputValue::Blobs(_) => None,
            OutputValue::Text(s) => Some(serde_json::Value::String(s.clone())),
            OutputValue::Number(n) => Some(serde_json::json!(n)),
            OutputValue::Bool(b) => Some(serde_json::Value::Bool(*b)),
        }
    }
}

/// Resolved outputs of a run, keyed by workflow output key.
pub type RunOutputs = BTreeMap<String, OutputValue>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_reports_node_id() {
        let ev = NodeLifecycle::AuthError {
            node_id: 4,
            error: "401".into(),
        };
        assert_eq!(ev.node_id(), 4);
    }

    #[test]
    fn blobs_have_no_json_form() {
        assert!(OutputValue::Blobs(vec![vec![1]]).to_json().is_none());
        assert_eq!(
            OutputValue::Text("hi".into()).to_json(),
            Some(serde_json::json!("hi"))
        );
    }
}
