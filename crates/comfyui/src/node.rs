//! The [`NodeClient`] seam between the scheduler and a compute node.

use std::sync::Arc;

use async_trait::async_trait;
use fleet_core::node::NodeAuth;
use fleet_core::types::DbId;
use fleet_core::workflow::OutputDefs;
use tokio::sync::{broadcast, mpsc};

use crate::error::NodeError;
use crate::events::{ExecutionEvent, NodeLifecycle, RunOutputs};

/// One remote compute node.
///
/// Implementations own their connection. Lifecycle events are broadcast
/// to every [`lifecycle`](NodeClient::lifecycle) receiver; run events go
/// to the sender passed to [`run_prompt`](NodeClient::run_prompt).
#[async_trait]
pub trait NodeClient: Send + Sync {
    fn node_id(&self) -> DbId;

    /// Subscribe before calling [`init`](NodeClient::init) to observe the
    /// first `Connected` event.
    fn lifecycle(&self) -> broadcast::Receiver<NodeLifecycle>;

    /// Reachability and credential probe.
    async fn ping(&self) -> Result<(), NodeError>;

    /// Start the connection task. Idempotent.
    async fn init(&self) -> Result<(), NodeError>;

    /// Discovered checkpoints, samplers, schedulers and extensions.
    async fn resources(&self) -> Result<serde_json::Value, NodeError>;

    /// Upload an input file and return the name to reference in a prompt.
    async fn upload_image(&self, bytes: Vec<u8>, file_name: &str) -> Result<String, NodeError>;

    /// Submit `prompt` and drive it to completion.
    ///
    /// Resolves every output in `outputs` that the node produced.
    async fn run_prompt(
        &self,
        prompt: &serde_json::Value,
        outputs: &OutputDefs,
        events: mpsc::UnboundedSender<ExecutionEvent>,
    ) -> Result<RunOutputs, NodeError>;

    /// Cancel the node's current job only.
    async fn interrupt(&self) -> Result<(), NodeError>;

    async fn reboot(&self) -> Result<(), NodeError>;

    async fn free_memory(&self) -> Result<(), NodeError>;

    /// Stop the connection task and fail any run in flight.
    async fn shutdown(&self);
}

/// Builds clients for persisted nodes.
pub trait NodeConnector: Send + Sync {
    fn connect(&self, node_id: DbId, host: &str, auth: &NodeAuth) -> Arc<dyn NodeClient>;
}
