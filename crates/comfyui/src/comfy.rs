//! [`ComfyNode`]: the ComfyUI implementation of [`NodeClient`].
//!
//! One instance per node. [`init`](NodeClient::init) spawns a long-lived
//! connection task (connect -> process -> reconnect) that feeds the
//! lifecycle channel and the run in flight.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use fleet_core::node::NodeAuth;
use fleet_core::types::DbId;
use fleet_core::workflow::OutputDefs;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::api::ComfyApi;
use crate::client::WsEndpoint;
use crate::error::NodeError;
use crate::events::{ExecutionEvent, NodeLifecycle, OutputValue, RunOutputs};
use crate::node::{NodeClient, NodeConnector};
use crate::outputs::{missing_nodes, pick_output, PickedOutput};
use crate::processor::{fail_active, lock_slot, process_messages, ActiveRun, GraphOutputs, RunSlot};
use crate::reconnect::{failure_event, reconnect_config, reconnect_loop};

/// Broadcast channel capacity for lifecycle events.
const LIFECYCLE_CHANNEL_CAPACITY: usize = 256;

/// How long shutdown waits for the connection task.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub struct ComfyNode {
    node_id: DbId,
    api: ComfyApi,
    endpoint: WsEndpoint,
    /// Sent on the WebSocket handshake and with every prompt.
    client_id: String,
    lifecycle_tx: broadcast::Sender<NodeLifecycle>,
    active: RunSlot,
    cancel: CancellationToken,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ComfyNode {
    pub fn new(node_id: DbId, host: &str, auth: NodeAuth) -> Self {
        Self::with_client(reqwest::Client::new(), node_id, host, auth)
    }

    /// Share one [`reqwest::Client`] across nodes.
    pub fn with_client(client: reqwest::Client, node_id: DbId, host: &str, auth: NodeAuth) -> Self {
        let (lifecycle_tx, _) = broadcast::channel(LIFECYCLE_CHANNEL_CAPACITY);
        Self {
            node_id,
            api: ComfyApi::with_client(client, host, auth.clone()),
            endpoint: WsEndpoint::new(node_id, host, auth),
            client_id: uuid::Uuid::new_v4().to_string(),
            lifecycle_tx,
            active: Arc::new(Mutex::new(None)),
            cancel: CancellationToken::new(),
            task: tokio::sync::Mutex::new(None),
        }
    }

    async fn resolve_outputs(
        &self,
        prompt_id: &str,
        defs: &OutputDefs,
        mut graph: GraphOutputs,
    ) -> Result<RunOutputs, NodeError> {
        // Cached graph nodes do not resend `executed`; history has them.
        let as_value = Value::Object(graph.clone());
        if !missing_nodes(defs.values(), &as_value).is_empty() {
            match self.api.history_outputs(prompt_id).await {
                Ok(Value::Object(history)) => {
                    for (node, output) in history {
                        graph.entry(node).or_insert(output);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(node_id = self.node_id, prompt_id, error = %e, "Failed to fetch history");
                }
            }
        }

        let graph = Value::Object(graph);
        let mut resolved = RunOutputs::new();
        for (key, def) in defs {
            match pick_output(def, &graph)? {
                None => {
                    tracing::warn!(node_id = self.node_id, prompt_id, output = %key, "Output not produced");
                }
                Some(PickedOutput::Value(value)) => {
                    resolved.insert(key.clone(), value);
                }
                Some(PickedOutput::Files(files)) => {
                    let mut blobs = Vec::with_capacity(files.len());
                    for file in &files {
                        blobs.push(self.api.view(file).await?);
                    }
                    resolved.insert(key.clone(), OutputValue::Blobs(blobs));
                }
            }
        }
        Ok(resolved)
    }
}

/// Clears the run slot when the run ends or its future is dropped.
struct RunGuard<'a> {
    slot: &'a RunSlot,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        lock_slot(self.slot).take();
    }
}

#[async_trait]
impl NodeClient for ComfyNode {
    fn node_id(&self) -> DbId {
        self.node_id
    }

    fn lifecycle(&self) -> broadcast::Receiver<NodeLifecycle> {
        self.lifecycle_tx.subscribe()
    }

    async fn ping(&self) -> Result<(), NodeError> {
        self.api.system_stats().await.map(|_| ())
    }

    async fn init(&self) -> Result<(), NodeError> {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return Ok(());
        }

        let endpoint = self.endpoint.clone();
        let client_id = self.client_id.clone();
        let lifecycle = self.lifecycle_tx.clone();
        let active = Arc::clone(&self.active);
        let cancel = self.cancel.clone();
        let node_id = self.node_id;

        *task = Some(tokio::spawn(async move {
            tracing::info!(node_id, "Starting connection task");
            run_connection_loop(&endpoint, &client_id, &lifecycle, &active, &cancel).await;
            tracing::info!(node_id, "Connection task exited");
        }));
        Ok(())
    }

    async fn resources(&self) -> Result<Value, NodeError> {
        let info = self.api.object_info().await?;
        Ok(summarize_object_info(&info))
    }

    async fn upload_image(&self, bytes: Vec<u8>, file_name: &str) -> Result<String, NodeError> {
        Ok(self.api.upload_image(bytes, file_name).await?.reference())
    }

    async fn run_prompt(
        &self,
        prompt: &Value,
        outputs: &OutputDefs,
        events: mpsc::UnboundedSender<ExecutionEvent>,
    ) -> Result<RunOutputs, NodeError> {
        let (done_tx, done_rx) = oneshot::channel();
        {
            let mut slot = lock_slot(&self.active);
            if slot.is_some() {
                return Err(NodeError::Busy);
            }
            *slot = Some(ActiveRun::new(events.clone(), done_tx));
        }
        let _guard = RunGuard { slot: &self.active };

        let submitted = self.api.submit_prompt(prompt, &self.client_id).await?;
        {
            let mut slot = lock_slot(&self.active);
            if let Some(run) = slot.as_mut() {
                run.prompt_id.get_or_insert_with(|| submitted.prompt_id.clone());
            }
        }
        tracing::info!(node_id = self.node_id, prompt_id = %submitted.prompt_id, "Prompt queued on node");
        let _ = events.send(ExecutionEvent::Pending {
            prompt_id: submitted.prompt_id.clone(),
        });

        let graph = done_rx
            .await
            .map_err(|_| NodeError::Connection("Run abandoned by connection task".to_string()))??;

        self.resolve_outputs(&submitted.prompt_id, outputs, graph).await
    }

    async fn interrupt(&self) -> Result<(), NodeError> {
        self.api.interrupt().await
    }

    async fn reboot(&self) -> Result<(), NodeError> {
        self.api.reboot().await
    }

    async fn free_memory(&self) -> Result<(), NodeError> {
        self.api.free_memory().await
    }

    async fn shutdown(&self) {
        tracing::info!(node_id = self.node_id, "Shutting down node client");
        self.cancel.cancel();
        if let Some(handle) = self.task.lock().await.take() {
            let _ = tokio::time::timeout(SHUTDOWN_GRACE, handle).await;
        }
        fail_active(&self.active, NodeError::Connection("Node client shut down".to_string()));
    }
}

/// Core connection loop: connect -> process messages -> reconnect.
///
/// Runs until the cancellation token is triggered.
async fn run_connection_loop(
    endpoint: &WsEndpoint,
    client_id: &str,
    lifecycle: &broadcast::Sender<NodeLifecycle>,
    active: &RunSlot,
    cancel: &CancellationToken,
) {
    let node_id = endpoint.node_id();

    loop {
        let first_attempt = tokio::select! {
            _ = cancel.cancelled() => return,
            result = endpoint.connect(client_id) => result,
        };

        let conn = match first_attempt {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!(node_id, error = %e, "Connection failed, entering reconnect loop");
                let _ = lifecycle.send(failure_event(node_id, &e));
                match reconnect_loop(endpoint, client_id, reconnect_config(), lifecycle, cancel).await {
                    Some(conn) => conn,
                    None => return,
                }
            }
        };

        let _ = lifecycle.send(NodeLifecycle::Connected { node_id });

        let mut stream = conn.stream;
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = process_messages(&mut stream, node_id, active, lifecycle) => {}
        }

        fail_active(active, NodeError::Connection("Connection to node lost".to_string()));
        let _ = lifecycle.send(NodeLifecycle::Disconnected { node_id });

        if cancel.is_cancelled() {
            let _ = stream.close(None).await;
            return;
        }
        tracing::info!(node_id, "Connection lost, reconnecting");
    }
}

/// Reduce `/object_info` to what the node can render with.
pub fn summarize_object_info(info: &Value) -> Value {
    fn choices(info: &Value, class: &str, field: &str) -> Vec<Value> {
        info.pointer(&format!("/{class}/input/required/{field}/0"))
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default()
    }

    let extensions: BTreeSet<&str> = info
        .as_object()
        .map(|classes| {
            classes
                .values()
                .filter_map(|c| c.get("python_module").and_then(|m| m.as_str()))
                .filter_map(|m| m.strip_prefix("custom_nodes."))
                .collect()
        })
        .unwrap_or_default();

    serde_json::json!({
        "checkpoints": choices(info, "CheckpointLoaderSimple", "ckpt_name"),
        "samplers": choices(info, "KSampler", "sampler_name"),
        "schedulers": choices(info, "KSampler", "scheduler"),
        "extensions": extensions,
    })
}

/// Connector that builds [`ComfyNode`]s sharing one HTTP client.
#[derive(Clone, Default)]
pub struct ComfyConnector {
    client: reqwest::Client,
}

impl NodeConnector for ComfyConnector {
    fn connect(&self, node_id: DbId, host: &str, auth: &NodeAuth) -> Arc<dyn NodeClient> {
        Arc::new(ComfyNode::with_client(self.client.clone(), node_id, host, auth.clone()))
    }
}
