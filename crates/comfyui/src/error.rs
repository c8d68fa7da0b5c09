//! Errors from talking to a compute node.

/// Errors from the node protocol layer.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    /// The HTTP request itself failed (network, DNS, TLS, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The node returned a non-2xx status code.
    #[error("Node API error ({status}): {body}")]
    Api { status: u16, body: String },

    /// The node rejected our credentials.
    #[error("Authentication rejected: {0}")]
    Auth(String),

    /// The WebSocket could not be established or dropped.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The node ran the prompt and reported a failure.
    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    /// The run was interrupted on the node.
    #[error("Execution interrupted")]
    Interrupted,

    /// The node already has a run in flight.
    #[error("Node is busy with another prompt")]
    Busy,

    /// A message or response did not have the expected shape.
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl NodeError {
    /// Auth failures and dropped connections mark the node `Error`.
    pub fn is_connection_fault(&self) -> bool {
        matches!(
            self,
            NodeError::Auth(_) | NodeError::Connection(_) | NodeError::Request(_)
        )
    }
}
