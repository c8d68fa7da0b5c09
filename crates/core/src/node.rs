//! Compute node status machine, auth modes, control actions, and selection
//! scoring.
//!
//! Pure functions and constants used by the registry, the worker pool and
//! the HTTP layer.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::status::NodeStatus;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Weight factor for GPU utilization when computing a node load score.
pub const LOAD_WEIGHT_GPU: f64 = 0.6;

/// Weight factor for the node's own queue depth when computing a load score.
pub const LOAD_WEIGHT_QUEUE: f64 = 0.4;

/// Queue depth at which a node is considered fully loaded for scoring.
pub const MAX_QUEUE_FOR_SCORING: u32 = 8;

/// Maximum length of a node name.
const MAX_NAME_LEN: usize = 128;

// ---------------------------------------------------------------------------
// Auth and actions
// ---------------------------------------------------------------------------

/// How the platform authenticates against a node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum NodeAuth {
    #[default]
    None,
    Basic { username: String, password: String },
    Bearer { token: String },
}

/// Operator action against a live node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeAction {
    /// Cancel the node's current job only. Queued tasks are untouched.
    Interrupt,
    Reboot,
    FreeMemory,
}

impl NodeAction {
    pub fn label(self) -> &'static str {
        match self {
            NodeAction::Interrupt => "interrupt",
            NodeAction::Reboot => "reboot",
            NodeAction::FreeMemory => "free_memory",
        }
    }
}

// ---------------------------------------------------------------------------
// Status machine
// ---------------------------------------------------------------------------

/// Inputs to the node status machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeSignal {
    Connected,
    Disconnected,
    JobStarted,
    JobFinished,
    ConnectionError,
    AuthError,
}

/// Compute the next status for a node.
///
/// | from        | signal           | to          |
/// |-------------|------------------|-------------|
/// | Offline/Error | Connected      | Online      |
/// | Online      | JobStarted       | Executing   |
/// | Executing   | JobFinished      | Online      |
/// | any         | Connection/Auth error | Error  |
/// | any         | Disconnected     | Offline     |
///
/// Signals that do not apply leave the status unchanged.
pub fn next_node_status(current: NodeStatus, signal: NodeSignal) -> NodeStatus {
    match (current, signal) {
        (_, NodeSignal::ConnectionError | NodeSignal::AuthError) => NodeStatus::Error,
        (_, NodeSignal::Disconnected) => NodeStatus::Offline,
        (NodeStatus::Offline | NodeStatus::Error, NodeSignal::Connected) => NodeStatus::Online,
        (NodeStatus::Online, NodeSignal::JobStarted) => NodeStatus::Executing,
        (NodeStatus::Executing, NodeSignal::JobFinished) => NodeStatus::Online,
        (status, _) => status,
    }
}

// ---------------------------------------------------------------------------
// Load scoring
// ---------------------------------------------------------------------------

/// Composite load score for an idle node, `0.0` idle to `1.0` saturated.
///
/// - `gpu_utilization_pct` is the last monitor reading, `0.0..=100.0`.
/// - `queue_remaining` is the node's own queue depth (work submitted by
///   something other than this scheduler).
pub fn load_score(gpu_utilization_pct: f64, queue_remaining: u32) -> f64 {
    let gpu_norm = (gpu_utilization_pct / 100.0).clamp(0.0, 1.0);
    let queue_norm = (queue_remaining as f64 / MAX_QUEUE_FOR_SCORING as f64).clamp(0.0, 1.0);
    (LOAD_WEIGHT_GPU * gpu_norm + LOAD_WEIGHT_QUEUE * queue_norm).clamp(0.0, 1.0)
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a node display name.
///
/// Must be non-empty, at most `MAX_NAME_LEN` characters, and contain only
/// alphanumeric, hyphen, underscore, dot or space characters.
pub fn validate_node_name(name: &str) -> Result<(), CoreError> {
    if name.trim().is_empty() {
        return Err(CoreError::Validation("Node name must not be empty".to_string()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(CoreError::Validation(format!(
            "Node name must not exceed {MAX_NAME_LEN} characters"
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_alphanumeric() || matches!(c, '-' | '_' | '.' | ' '))
    {
        return Err(CoreError::Validation(
            "Node name may only contain alphanumeric, hyphen, underscore, dot or space characters"
                .to_string(),
        ));
    }
    Ok(())
}

/// Validate a node host URL. Only `http://` and `https://` are accepted.
pub fn validate_host(host: &str) -> Result<(), CoreError> {
    let rest = host
        .strip_prefix("http://")
        .or_else(|| host.strip_prefix("https://"))
        .ok_or_else(|| {
            CoreError::Validation(format!("Node host '{host}' must start with http:// or https://"))
        })?;
    if rest.trim_end_matches('/').is_empty() {
        return Err(CoreError::Validation(format!("Node host '{host}' has no address")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    // -- status machine -------------------------------------------------------

    #[test]
    fn offline_to_online_on_connect() {
        assert_eq!(
            next_node_status(NodeStatus::Offline, NodeSignal::Connected),
            NodeStatus::Online
        );
    }

    #[test]
    fn online_to_executing_and_back() {
        let s = next_node_status(NodeStatus::Online, NodeSignal::JobStarted);
        assert_eq!(s, NodeStatus::Executing);
        assert_eq!(next_node_status(s, NodeSignal::JobFinished), NodeStatus::Online);
    }

    #[test]
    fn any_status_to_error_on_connection_failure() {
        for s in [
            NodeStatus::Offline,
            NodeStatus::Online,
            NodeStatus::Executing,
            NodeStatus::Error,
        ] {
            assert_eq!(next_node_status(s, NodeSignal::ConnectionError), NodeStatus::Error);
            assert_eq!(next_node_status(s, NodeSignal::AuthError), NodeStatus::Error);
        }
    }

    #[test]
    fn error_recovers_on_reconnect() {
        assert_eq!(
            next_node_status(NodeStatus::Error, NodeSignal::Connected),
            NodeStatus::Online
        );
    }

    #[test]
    fn job_signals_do_not_revive_offline_node() {
        assert_eq!(
            next_node_status(NodeStatus::Offline, NodeSignal::JobStarted),
            NodeStatus::Offline
        );
        assert_eq!(
            next_node_status(NodeStatus::Error, NodeSignal::JobFinished),
            NodeStatus::Error
        );
    }

    #[test]
    fn reconnect_while_executing_keeps_executing() {
        assert_eq!(
            next_node_status(NodeStatus::Executing, NodeSignal::Connected),
            NodeStatus::Executing
        );
    }

    // -- load score -----------------------------------------------------------

    #[test]
    fn load_score_zero_when_idle() {
        assert_eq!(load_score(0.0, 0), 0.0);
    }

    #[test]
    fn load_score_one_when_saturated() {
        let score = load_score(100.0, MAX_QUEUE_FOR_SCORING);
        assert!((score - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn load_score_clamps_gpu_above_100() {
        let score = load_score(250.0, 0);
        assert!((score - LOAD_WEIGHT_GPU).abs() < f64::EPSILON);
    }

    // -- validation -----------------------------------------------------------

    #[test]
    fn valid_node_name() {
        assert!(validate_node_name("gpu-box 01.lan").is_ok());
    }

    #[test]
    fn empty_node_name_rejected() {
        assert!(validate_node_name("  ").is_err());
    }

    #[test]
    fn node_name_with_symbols_rejected() {
        assert!(validate_node_name("box;rm").is_err());
    }

    #[test]
    fn host_requires_scheme_and_address() {
        assert!(validate_host("http://10.0.0.4:8188").is_ok());
        assert!(validate_host("https://gpu.example.com/").is_ok());
        assert!(validate_host("10.0.0.4:8188").is_err());
        assert!(validate_host("http://").is_err());
    }

    #[test]
    fn auth_serializes_with_mode_tag() {
        let auth = NodeAuth::Bearer { token: "t".into() };
        let json = serde_json::to_value(&auth).unwrap();
        assert_eq!(json["mode"], "bearer");
        assert_eq!(json["token"], "t");
    }
}
