//! Node registry and health tracker.
//!
//! Owns the live [`NodeClient`](fleet_comfyui::NodeClient) for every
//! persisted node, the [`WorkerPool`] they are leased from, and the single
//! status publisher through which every node status transition flows:
//!
//! 1. A lifecycle watcher per node turns [`NodeLifecycle`] events into
//!    [`NodeSignal`]s; leases add `JobStarted` / `JobFinished`.
//! 2. The publisher applies [`next_node_status`], updates the pool,
//!    records a `status` node event and publishes on `node_status`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use fleet_comfyui::{NodeConnector, NodeLifecycle};
use fleet_core::node::{
    next_node_status, validate_host, validate_node_name, NodeAction, NodeSignal,
};
use fleet_core::status::{NodeEventKind, NodeStatus};
use fleet_core::types::DbId;
use fleet_db::models::node::{CreateNode, Node};
use fleet_db::TaskStore;
use fleet_events::{Category, NotificationBus};
use serde::Serialize;
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::SchedulerError;
use crate::pool::{SignalReceiver, SignalSender, WorkerPool};

/// Node id used for the reachability probe before a row exists.
const PROBE_NODE_ID: DbId = 0;

/// A persisted node with its live state.
#[derive(Debug, Clone, Serialize)]
pub struct NodeView {
    #[serde(flatten)]
    pub node: Node,
    pub status: NodeStatus,
    pub busy: bool,
    pub load: f64,
}

pub struct NodeRegistry {
    store: Arc<dyn TaskStore>,
    bus: NotificationBus,
    connector: Arc<dyn NodeConnector>,
    pool: Arc<WorkerPool>,
    signals: SignalSender,
    watchers: Mutex<HashMap<DbId, JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl NodeRegistry {
    /// Create the registry and start its status publisher.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn new(
        store: Arc<dyn TaskStore>,
        bus: NotificationBus,
        connector: Arc<dyn NodeConnector>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let (signals, rx) = mpsc::unbounded_channel();
        let pool = WorkerPool::new(signals.clone());

        let publisher = StatusPublisher {
            store: Arc::clone(&store),
            bus: bus.clone(),
            pool: Arc::clone(&pool),
        };
        tokio::spawn(publisher.run(rx, cancel.clone()));

        Arc::new(Self {
            store,
            bus,
            connector,
            pool,
            signals,
            watchers: Mutex::new(HashMap::new()),
            cancel,
        })
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    fn watchers(&self) -> MutexGuard<'_, HashMap<DbId, JoinHandle<()>>> {
        self.watchers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Connect every persisted node not already pooled. Returns how many
    /// were attached.
    pub async fn load_nodes(&self) -> Result<usize, SchedulerError> {
        let nodes = self.store.list_nodes().await?;
        let mut attached = 0;
        for node in &nodes {
            if self.pool.client(node.id).is_some() {
                continue;
            }
            self.attach(node).await;
            attached += 1;
        }
        tracing::info!(count = attached, total = nodes.len(), "Loaded compute nodes");
        Ok(attached)
    }

    /// Build a client for `node`, start watching it and add it to the pool.
    async fn attach(&self, node: &Node) {
        let client = self.connector.connect(node.id, &node.host, &node.auth.0);
        // Subscribe before init so the first Connected is observed.
        let events = client.lifecycle();

        if let Some(previous) = self.pool.add(Arc::clone(&client)) {
            previous.shutdown().await;
        }

        let watcher = LifecycleWatcher {
            node_id: node.id,
            signals: self.signals.clone(),
            pool: Arc::clone(&self.pool),
            bus: self.bus.clone(),
        };
        let handle = tokio::spawn(watcher.run(events, self.cancel.child_token()));
        let replaced = self.watchers().insert(node.id, handle);
        if let Some(replaced) = replaced {
            replaced.abort();
        }

        if let Err(e) = client.init().await {
            tracing::warn!(node_id = node.id, error = %e, "Node client init failed");
        }
    }

    /// Probe, persist, discover resources, connect and pool a new node.
    pub async fn import_node(&self, input: CreateNode) -> Result<Node, SchedulerError> {
        validate_node_name(&input.name)?;
        validate_host(&input.host)?;

        let probe = self
            .connector
            .connect(PROBE_NODE_ID, &input.host, &input.auth);
        if let Err(source) = probe.ping().await {
            probe.shutdown().await;
            return Err(SchedulerError::NodeUnreachable {
                host: input.host,
                source,
            });
        }

        let mut node = self.store.create_node(&input).await?;

        match probe.resources().await {
            Ok(resources) => {
                self.store.update_node_resources(node.id, &resources).await?;
                node.resources = resources;
            }
            Err(e) => {
                tracing::warn!(node_id = node.id, error = %e, "Resource discovery failed");
            }
        }
        probe.shutdown().await;

        self.attach(&node).await;

        tracing::info!(
            node_id = node.id,
            name = %node.name,
            host = %node.host,
            "Node imported",
        );
        Ok(node)
    }

    /// Tear a node down: interrupt its job, detach it, clear its history,
    /// delete its row.
    pub async fn remove_node(&self, node_id: DbId) -> Result<(), SchedulerError> {
        if self.store.find_node(node_id).await?.is_none() {
            return Err(SchedulerError::not_found("Node", node_id));
        }

        if self.pool.is_busy(node_id) {
            if let Some(client) = self.pool.client(node_id) {
                if let Err(e) = client.interrupt().await {
                    tracing::warn!(node_id, error = %e, "Interrupt before removal failed");
                }
            }
        }

        let watcher = self.watchers().remove(&node_id);
        if let Some(watcher) = watcher {
            watcher.abort();
        }
        if let Some(client) = self.pool.remove(node_id) {
            client.shutdown().await;
        }

        let cleared = self.store.clear_node_events(node_id).await?;
        self.store.delete_node(node_id).await?;

        self.bus
            .emit(
                Category::NodeStatus,
                node_id,
                json!({
                    "node_id": node_id,
                    "status": NodeStatus::Offline,
                    "removed": true,
                }),
            )
            .await;

        tracing::info!(node_id, cleared_events = cleared, "Node removed");
        Ok(())
    }

    /// Run an operator action and record it as an `action` node event.
    pub async fn control_node(
        &self,
        node_id: DbId,
        action: NodeAction,
    ) -> Result<(), SchedulerError> {
        let client = self
            .pool
            .client(node_id)
            .ok_or_else(|| SchedulerError::not_found("Node", node_id))?;

        let result = match action {
            NodeAction::Interrupt => client.interrupt().await,
            NodeAction::Reboot => client.reboot().await,
            NodeAction::FreeMemory => client.free_memory().await,
        };

        let detail = match &result {
            Ok(()) => json!({ "action": action.label(), "ok": true }),
            Err(e) => json!({ "action": action.label(), "ok": false, "error": e.to_string() }),
        };
        if let Err(e) = self
            .store
            .record_node_event(node_id, NodeEventKind::Action, &detail)
            .await
        {
            tracing::error!(node_id, error = %e, "Failed to record node action");
        }

        result?;
        tracing::info!(node_id, action = action.label(), "Node action applied");
        Ok(())
    }

    /// Persisted nodes joined with their live pool state.
    pub async fn node_views(&self) -> Result<Vec<NodeView>, SchedulerError> {
        let live: HashMap<DbId, _> = self
            .pool
            .snapshot()
            .into_iter()
            .map(|e| (e.node_id, e))
            .collect();

        let nodes = self.store.list_nodes().await?;
        Ok(nodes
            .into_iter()
            .map(|node| {
                let entry = live.get(&node.id);
                NodeView {
                    status: entry.map_or(NodeStatus::Offline, |e| e.status),
                    busy: entry.is_some_and(|e| e.busy),
                    load: entry.map_or(0.0, |e| e.load),
                    node,
                }
            })
            .collect())
    }

    /// Stop watchers and the publisher, then close every node connection.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let watchers: Vec<_> = self.watchers().drain().map(|(_, h)| h).collect();
        for handle in watchers {
            handle.abort();
        }
        for client in self.pool.clients() {
            client.shutdown().await;
        }
        tracing::info!("Node registry stopped");
    }
}

// ---------------------------------------------------------------------------
// Lifecycle watcher
// ---------------------------------------------------------------------------

struct LifecycleWatcher {
    node_id: DbId,
    signals: SignalSender,
    pool: Arc<WorkerPool>,
    bus: NotificationBus,
}

impl LifecycleWatcher {
    async fn run(self, mut events: broadcast::Receiver<NodeLifecycle>, cancel: CancellationToken) {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Ok(event) => self.handle(event).await,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(node_id = self.node_id, skipped, "Lifecycle events lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    async fn handle(&self, event: NodeLifecycle) {
        let signal = match event {
            NodeLifecycle::Connected { .. } => NodeSignal::Connected,
            NodeLifecycle::Disconnected { .. } => NodeSignal::Disconnected,
            NodeLifecycle::ConnectionError { error, .. } => {
                tracing::warn!(node_id = self.node_id, error = %error, "Node connection error");
                NodeSignal::ConnectionError
            }
            NodeLifecycle::AuthError { error, .. } => {
                tracing::warn!(node_id = self.node_id, error = %error, "Node rejected credentials");
                NodeSignal::AuthError
            }
            NodeLifecycle::SystemMonitor { payload, .. } => {
                self.pool
                    .update_load(self.node_id, gpu_utilization(&payload), None);
                self.bus
                    .emit(Category::NodeMonitor, self.node_id, payload)
                    .await;
                return;
            }
            NodeLifecycle::QueueStatus {
                queue_remaining, ..
            } => {
                self.pool
                    .update_load(self.node_id, None, Some(queue_remaining));
                return;
            }
        };
        let _ = self.signals.send((self.node_id, signal));
    }
}

/// First GPU's utilization from a monitor payload.
fn gpu_utilization(payload: &serde_json::Value) -> Option<f64> {
    payload
        .get("gpus")?
        .as_array()?
        .first()?
        .get("gpu_utilization")?
        .as_f64()
}

// ---------------------------------------------------------------------------
// Status publisher
// ---------------------------------------------------------------------------

struct StatusPublisher {
    store: Arc<dyn TaskStore>,
    bus: NotificationBus,
    pool: Arc<WorkerPool>,
}

impl StatusPublisher {
    async fn run(self, mut rx: SignalReceiver, cancel: CancellationToken) {
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break,
                next = rx.recv() => next,
            };
            match next {
                Some((node_id, signal)) => self.apply(node_id, signal).await,
                None => break,
            }
        }
        tracing::debug!("Node status publisher stopped");
    }

    async fn apply(&self, node_id: DbId, signal: NodeSignal) {
        if matches!(signal, NodeSignal::ConnectionError | NodeSignal::AuthError)
            && self.pool.fault(node_id)
        {
            tracing::warn!(node_id, ?signal, "Faulted the job running on node");
        }

        let Some(current) = self.pool.status(node_id) else {
            return;
        };
        let next = next_node_status(current, signal);
        if next == current {
            return;
        }
        self.pool.set_status(node_id, next);

        let detail = json!({
            "status": next,
            "previous": current,
            "signal": signal_label(signal),
        });
        if let Err(e) = self
            .store
            .record_node_event(node_id, NodeEventKind::Status, &detail)
            .await
        {
            tracing::error!(node_id, error = %e, "Failed to record node status");
        }

        self.bus
            .emit(
                Category::NodeStatus,
                node_id,
                json!({ "node_id": node_id, "status": next, "previous": current }),
            )
            .await;

        tracing::debug!(node_id, from = %current, to = %next, "Node status changed");
    }
}

fn signal_label(signal: NodeSignal) -> &'static str {
    match signal {
        NodeSignal::Connected => "connected",
        NodeSignal::Disconnected => "disconnected",
        NodeSignal::JobStarted => "job_started",
        NodeSignal::JobFinished => "job_finished",
        NodeSignal::ConnectionError => "connection_error",
        NodeSignal::AuthError => "auth_error",
    }
}
