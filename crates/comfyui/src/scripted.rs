//! [`ScriptedNode`]: an in-process [`NodeClient`] that replays canned runs.
//!
//! Used by scheduler tests and for running the server without GPU nodes.
//! Every call is recorded so tests can assert on prompts, uploads and
//! control actions.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleet_core::node::NodeAuth;
use fleet_core::types::DbId;
use fleet_core::workflow::OutputDefs;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, Mutex, Notify};
use tokio_util::sync::CancellationToken;

use crate::error::NodeError;
use crate::events::{ExecutionEvent, NodeLifecycle, RunOutputs};
use crate::node::{NodeClient, NodeConnector};

/// What the next `run_prompt` call does.
#[derive(Debug, Clone)]
pub enum ScriptedRun {
    /// Emit `events`, wait `delay`, then return `outputs`.
    Succeed {
        events: Vec<ExecutionEvent>,
        outputs: RunOutputs,
        delay: Duration,
    },
    /// Emit `Start`, then fail with an execution error.
    Fail(String),
    /// Emit `Start`, then block until interrupted or shut down.
    Hang,
}

impl ScriptedRun {
    pub fn succeed(outputs: RunOutputs) -> Self {
        ScriptedRun::Succeed {
            events: vec![ExecutionEvent::Start],
            outputs,
            delay: Duration::ZERO,
        }
    }
}

pub struct ScriptedNode {
    node_id: DbId,
    lifecycle_tx: broadcast::Sender<NodeLifecycle>,
    runs: Mutex<VecDeque<ScriptedRun>>,
    reachable: AtomicBool,
    resources: Value,
    prompts: Mutex<Vec<Value>>,
    uploads: Mutex<Vec<String>>,
    actions: Mutex<Vec<&'static str>>,
    interrupted: Notify,
    in_flight: AtomicBool,
    closed: CancellationToken,
    prompt_seq: AtomicU64,
}

impl ScriptedNode {
    pub fn new(node_id: DbId) -> Self {
        let (lifecycle_tx, _) = broadcast::channel(64);
        Self {
            node_id,
            lifecycle_tx,
            runs: Mutex::new(VecDeque::new()),
            reachable: AtomicBool::new(true),
            resources: serde_json::json!({
                "checkpoints": ["scripted.safetensors"],
                "samplers": ["euler"],
                "schedulers": ["normal"],
                "extensions": [],
            }),
            prompts: Mutex::new(Vec::new()),
            uploads: Mutex::new(Vec::new()),
            actions: Mutex::new(Vec::new()),
            interrupted: Notify::new(),
            in_flight: AtomicBool::new(false),
            closed: CancellationToken::new(),
            prompt_seq: AtomicU64::new(0),
        }
    }

    /// Queue a run. With no queued run, `run_prompt` succeeds with no outputs.
    pub async fn push_run(&self, run: ScriptedRun) {
        self.runs.lock().await.push_back(run);
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Inject a lifecycle event as if the node connection produced it.
    pub fn emit(&self, event: NodeLifecycle) {
        let _ = self.lifecycle_tx.send(event);
    }

    pub async fn prompts(&self) -> Vec<Value> {
        self.prompts.lock().await.clone()
    }

    pub async fn uploads(&self) -> Vec<String> {
        self.uploads.lock().await.clone()
    }

    pub async fn actions(&self) -> Vec<&'static str> {
        self.actions.lock().await.clone()
    }

    pub fn is_shut_down(&self) -> bool {
        self.closed.is_cancelled()
    }

    async fn play(
        &self,
        prompt: &Value,
        events: mpsc::UnboundedSender<ExecutionEvent>,
    ) -> Result<RunOutputs, NodeError> {
        self.prompts.lock().await.push(prompt.clone());
        let seq = self.prompt_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let _ = events.send(ExecutionEvent::Pending {
            prompt_id: format!("scripted-{}-{seq}", self.node_id),
        });

        let run = self
            .runs
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| ScriptedRun::succeed(RunOutputs::new()));

        match run {
            ScriptedRun::Succeed {
                events: scripted,
                outputs,
                delay,
            } => {
                for event in scripted {
                    let _ = events.send(event);
                }
                tokio::select! {
                    _ = self.interrupted.notified() => Err(NodeError::Interrupted),
                    _ = self.closed.cancelled() => Err(NodeError::Connection("node shut down".into())),
                    _ = tokio::time::sleep(delay) => Ok(outputs),
                }
            }
            ScriptedRun::Fail(detail) => {
                let _ = events.send(ExecutionEvent::Start);
                Err(NodeError::ExecutionFailed(detail))
            }
            ScriptedRun::Hang => {
                let _ = events.send(ExecutionEvent::Start);
                tokio::select! {
                    _ = self.interrupted.notified() => Err(NodeError::Interrupted),
                    _ = self.closed.cancelled() => Err(NodeError::Connection("node shut down".into())),
                }
            }
        }
    }

    fn check_reachable(&self) -> Result<(), NodeError> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(NodeError::Connection(format!("node {} unreachable", self.node_id)))
        }
    }
}

#[async_trait]
impl NodeClient for ScriptedNode {
    fn node_id(&self) -> DbId {
        self.node_id
    }

    fn lifecycle(&self) -> broadcast::Receiver<NodeLifecycle> {
        self.lifecycle_tx.subscribe()
    }

    async fn ping(&self) -> Result<(), NodeError> {
        self.check_reachable()
    }

    async fn init(&self) -> Result<(), NodeError> {
        let event = match self.check_reachable() {
            Ok(()) => NodeLifecycle::Connected {
                node_id: self.node_id,
            },
            Err(e) => NodeLifecycle::ConnectionError {
                node_id: self.node_id,
                error: e.to_string(),
            },
        };
        self.emit(event);
        Ok(())
    }

    async fn resources(&self) -> Result<Value, NodeError> {
        self.check_reachable()?;
        Ok(self.resources.clone())
    }

    async fn upload_image(&self, bytes: Vec<u8>, file_name: &str) -> Result<String, NodeError> {
        self.check_reachable()?;
        let name = format!("{}_{file_name}", bytes.len());
        self.uploads.lock().await.push(name.clone());
        Ok(name)
    }

    async fn run_prompt(
        &self,
        prompt: &Value,
        _outputs: &OutputDefs,
        events: mpsc::UnboundedSender<ExecutionEvent>,
    ) -> Result<RunOutputs, NodeError> {
        self.check_reachable()?;
        self.in_flight.store(true, Ordering::SeqCst);
        let result = self.play(prompt, events).await;
        self.in_flight.store(false, Ordering::SeqCst);
        result
    }

    async fn interrupt(&self) -> Result<(), NodeError> {
        self.actions.lock().await.push("interrupt");
        // Only the current job is cancelled; no permit is left behind.
        if self.in_flight.load(Ordering::SeqCst) {
            self.interrupted.notify_one();
        }
        Ok(())
    }

    async fn reboot(&self) -> Result<(), NodeError> {
        self.check_reachable()?;
        self.actions.lock().await.push("reboot");
        Ok(())
    }

    async fn free_memory(&self) -> Result<(), NodeError> {
        self.check_reachable()?;
        self.actions.lock().await.push("free_memory");
        Ok(())
    }

    async fn shutdown(&self) {
        self.closed.cancel();
        self.emit(NodeLifecycle::Disconnected {
            node_id: self.node_id,
        });
    }
}

/// Connector handing out [`ScriptedNode`]s. Created nodes stay reachable
/// through [`ScriptedConnector::node`] so tests can script them.
#[derive(Default)]
pub struct ScriptedConnector {
    nodes: std::sync::Mutex<Vec<Arc<ScriptedNode>>>,
    unreachable_hosts: std::sync::Mutex<Vec<String>>,
}

impl ScriptedConnector {
    /// Nodes created for `host` from now on start unreachable.
    pub fn mark_unreachable(&self, host: &str) {
        self.unreachable_hosts
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(host.to_string());
    }

    pub fn node(&self, node_id: DbId) -> Option<Arc<ScriptedNode>> {
        self.nodes
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .find(|n| n.node_id == node_id)
            .cloned()
    }
}

impl NodeConnector for ScriptedConnector {
    fn connect(&self, node_id: DbId, host: &str, _auth: &NodeAuth) -> Arc<dyn NodeClient> {
        let node = Arc::new(ScriptedNode::new(node_id));
        let unreachable = self
            .unreachable_hosts
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .any(|h| h == host);
        node.set_reachable(!unreachable);
        self.nodes
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(Arc::clone(&node));
        node
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::OutputValue;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn scripted_success_replays_events() {
        let node = ScriptedNode::new(1);
        let mut outputs = RunOutputs::new();
        outputs.insert("caption".into(), OutputValue::Text("a cat".into()));
        node.push_run(ScriptedRun::succeed(outputs.clone())).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let result = node
            .run_prompt(&serde_json::json!({"1": {}}), &OutputDefs::new(), tx)
            .await
            .unwrap();

        assert_eq!(result, outputs);
        assert_matches!(rx.recv().await, Some(ExecutionEvent::Pending { .. }));
        assert_eq!(rx.recv().await, Some(ExecutionEvent::Start));
        assert_eq!(node.prompts().await.len(), 1);
    }

    #[tokio::test]
    async fn hanging_run_ends_on_interrupt() {
        let node = Arc::new(ScriptedNode::new(1));
        node.push_run(ScriptedRun::Hang).await;

        let runner = Arc::clone(&node);
        let handle = tokio::spawn(async move {
            let (tx, _rx) = mpsc::unbounded_channel();
            runner.run_prompt(&Value::Null, &OutputDefs::new(), tx).await
        });

        while node.prompts().await.is_empty() {
            tokio::task::yield_now().await;
        }
        node.interrupt().await.unwrap();
        assert_matches!(handle.await.unwrap(), Err(NodeError::Interrupted));
        assert_eq!(node.actions().await, vec!["interrupt"]);
    }

    #[tokio::test]
    async fn unreachable_node_fails_ping_and_reports_on_init() {
        let node = ScriptedNode::new(2);
        node.set_reachable(false);
        let mut lifecycle = node.lifecycle();

        assert_matches!(node.ping().await, Err(NodeError::Connection(_)));
        node.init().await.unwrap();
        assert_matches!(
            lifecycle.recv().await.unwrap(),
            NodeLifecycle::ConnectionError { node_id: 2, .. }
        );
    }
}
