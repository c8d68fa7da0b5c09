//! [`WorkerPool`]: reservation of idle compute nodes.
//!
//! Waiters are served lowest weight first, then in arrival order. Among
//! idle nodes the least recently used one wins (ties broken by load score)
//! unless the waiter's preferred node is idle. A [`Lease`] hands its node
//! back when dropped.
//!
//! The pool never publishes node status itself. Job start and finish are
//! sent as [`NodeSignal`]s to the registry's status publisher, which calls
//! back into [`WorkerPool::set_status`].

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use fleet_comfyui::NodeClient;
use fleet_core::node::{load_score, NodeSignal};
use fleet_core::status::NodeStatus;
use fleet_core::types::DbId;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::error::SchedulerError;

/// Channel into the registry's status publisher.
pub type SignalSender = mpsc::UnboundedSender<(DbId, NodeSignal)>;
pub type SignalReceiver = mpsc::UnboundedReceiver<(DbId, NodeSignal)>;

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

struct PoolNode {
    client: Arc<dyn NodeClient>,
    status: NodeStatus,
    busy: bool,
    last_used: u64,
    gpu_pct: f64,
    queue_remaining: u32,
    /// Fault token of the current lease.
    fault: Option<CancellationToken>,
}

impl PoolNode {
    /// `Executing` without a lease is the short window between a lease
    /// drop and the publisher applying `JobFinished`.
    fn is_idle(&self) -> bool {
        !self.busy && matches!(self.status, NodeStatus::Online | NodeStatus::Executing)
    }

    fn load(&self) -> f64 {
        load_score(self.gpu_pct, self.queue_remaining)
    }
}

struct Waiter {
    weight: f64,
    seq: u64,
    preferred: Option<DbId>,
    tx: oneshot::Sender<Lease>,
}

// Reversed so the max-heap pops the lowest weight, then the oldest.
impl Ord for Waiter {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .weight
            .total_cmp(&self.weight)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Waiter {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Waiter {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Waiter {}

#[derive(Default)]
struct PoolState {
    nodes: HashMap<DbId, PoolNode>,
    waiters: BinaryHeap<Waiter>,
    seq: u64,
    clock: u64,
}

impl PoolState {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn pick_node(&self, preferred: Option<DbId>) -> Option<DbId> {
        if let Some(id) = preferred {
            if self.nodes.get(&id).is_some_and(PoolNode::is_idle) {
                return Some(id);
            }
        }
        self.nodes
            .iter()
            .filter(|(_, n)| n.is_idle())
            .min_by(|(a_id, a), (b_id, b)| {
                a.last_used
                    .cmp(&b.last_used)
                    .then_with(|| a.load().total_cmp(&b.load()))
                    .then_with(|| a_id.cmp(b_id))
            })
            .map(|(id, _)| *id)
    }
}

/// Live view of one pooled node.
#[derive(Debug, Clone, Serialize)]
pub struct PoolEntry {
    pub node_id: DbId,
    pub status: NodeStatus,
    pub busy: bool,
    pub load: f64,
}

// ---------------------------------------------------------------------------
// WorkerPool
// ---------------------------------------------------------------------------

pub struct WorkerPool {
    state: Mutex<PoolState>,
    signals: SignalSender,
}

impl WorkerPool {
    pub fn new(signals: SignalSender) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(PoolState::default()),
            signals,
        })
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait for an idle node.
    ///
    /// Returns [`SchedulerError::Cancelled`] when `cancel` fires first. A
    /// lease granted in the same instant is dropped and its node returned.
    pub async fn acquire(
        self: &Arc<Self>,
        weight: f64,
        preferred: Option<DbId>,
        cancel: &CancellationToken,
    ) -> Result<Lease, SchedulerError> {
        let mut rx = {
            let mut state = self.lock();
            let (tx, rx) = oneshot::channel();
            state.seq += 1;
            let seq = state.seq;
            state.waiters.push(Waiter {
                weight,
                seq,
                preferred,
                tx,
            });
            self.grant_waiters(&mut state);
            rx
        };

        let granted = tokio::select! {
            lease = &mut rx => Some(lease),
            _ = cancel.cancelled() => None,
        };

        match granted {
            Some(Ok(lease)) => Ok(lease),
            Some(Err(_)) => Err(SchedulerError::Cancelled),
            None => {
                drop(rx);
                self.lock().waiters.retain(|w| !w.tx.is_closed());
                Err(SchedulerError::Cancelled)
            }
        }
    }

    /// Hand idle nodes to waiting jobs until one side runs out.
    fn grant_waiters(self: &Arc<Self>, state: &mut PoolState) {
        loop {
            let preferred = match state.waiters.peek() {
                None => break,
                Some(w) if w.tx.is_closed() => {
                    state.waiters.pop();
                    continue;
                }
                Some(w) => w.preferred,
            };
            let Some(node_id) = state.pick_node(preferred) else {
                break;
            };
            let Some(waiter) = state.waiters.pop() else {
                break;
            };
            let Some(lease) = self.reserve(state, node_id) else {
                break;
            };
            if let Err(mut lease) = waiter.tx.send(lease) {
                // The waiter went away between the check and the send.
                lease.armed = false;
                if let Some(node) = state.nodes.get_mut(&node_id) {
                    node.busy = false;
                    node.fault = None;
                }
            }
        }
    }

    fn reserve(self: &Arc<Self>, state: &mut PoolState, node_id: DbId) -> Option<Lease> {
        let now = state.tick();
        let node = state.nodes.get_mut(&node_id)?;
        let fault = CancellationToken::new();
        node.busy = true;
        node.last_used = now;
        node.fault = Some(fault.clone());
        Some(Lease {
            pool: Arc::clone(self),
            node_id,
            client: Arc::clone(&node.client),
            fault,
            armed: true,
            started: false,
        })
    }

    fn release(self: &Arc<Self>, node_id: DbId, started: bool) {
        let mut state = self.lock();
        let now = state.tick();
        if let Some(node) = state.nodes.get_mut(&node_id) {
            node.busy = false;
            node.fault = None;
            node.last_used = now;
        }
        // Sent under the lock so it precedes the next lease's JobStarted.
        if started {
            self.signal(node_id, NodeSignal::JobFinished);
        }
        self.grant_waiters(&mut state);
    }

    fn signal(&self, node_id: DbId, signal: NodeSignal) {
        if self.signals.send((node_id, signal)).is_err() {
            tracing::debug!(node_id, ?signal, "Status publisher gone, signal dropped");
        }
    }

    // -- membership ---------------------------------------------------------

    /// Add a node as `Offline`. Returns the client it replaced, if any.
    pub fn add(self: &Arc<Self>, client: Arc<dyn NodeClient>) -> Option<Arc<dyn NodeClient>> {
        let node_id = client.node_id();
        let previous = self.lock().nodes.insert(
            node_id,
            PoolNode {
                client,
                status: NodeStatus::Offline,
                busy: false,
                last_used: 0,
                gpu_pct: 0.0,
                queue_remaining: 0,
                fault: None,
            },
        );
        previous.map(|n| {
            if let Some(fault) = n.fault {
                fault.cancel();
            }
            n.client
        })
    }

    /// Detach a node, faulting its lease. Returns its client.
    pub fn remove(&self, node_id: DbId) -> Option<Arc<dyn NodeClient>> {
        let node = self.lock().nodes.remove(&node_id)?;
        if let Some(fault) = node.fault {
            fault.cancel();
        }
        Some(node.client)
    }

    // -- status -------------------------------------------------------------

    /// Apply a status computed by the registry's publisher.
    pub fn set_status(self: &Arc<Self>, node_id: DbId, status: NodeStatus) {
        let mut state = self.lock();
        let Some(node) = state.nodes.get_mut(&node_id) else {
            return;
        };
        node.status = status;
        if node.is_idle() {
            self.grant_waiters(&mut state);
        }
    }

    /// Fault the node's current lease, if any.
    pub fn fault(&self, node_id: DbId) -> bool {
        let state = self.lock();
        match state.nodes.get(&node_id).and_then(|n| n.fault.as_ref()) {
            Some(fault) => {
                fault.cancel();
                true
            }
            None => false,
        }
    }

    /// Record monitor readings used for tie-breaking between idle nodes.
    pub fn update_load(&self, node_id: DbId, gpu_pct: Option<f64>, queue_remaining: Option<u32>) {
        let mut state = self.lock();
        if let Some(node) = state.nodes.get_mut(&node_id) {
            if let Some(gpu) = gpu_pct {
                node.gpu_pct = gpu;
            }
            if let Some(queue) = queue_remaining {
                node.queue_remaining = queue;
            }
        }
    }

    // -- queries ------------------------------------------------------------

    pub fn status(&self, node_id: DbId) -> Option<NodeStatus> {
        self.lock().nodes.get(&node_id).map(|n| n.status)
    }

    pub fn client(&self, node_id: DbId) -> Option<Arc<dyn NodeClient>> {
        self.lock().nodes.get(&node_id).map(|n| Arc::clone(&n.client))
    }

    pub fn is_busy(&self, node_id: DbId) -> bool {
        self.lock().nodes.get(&node_id).is_some_and(|n| n.busy)
    }

    pub fn clients(&self) -> Vec<Arc<dyn NodeClient>> {
        self.lock()
            .nodes
            .values()
            .map(|n| Arc::clone(&n.client))
            .collect()
    }

    pub fn snapshot(&self) -> Vec<PoolEntry> {
        let state = self.lock();
        let mut entries: Vec<PoolEntry> = state
            .nodes
            .iter()
            .map(|(id, n)| PoolEntry {
                node_id: *id,
                status: n.status,
                busy: n.busy,
                load: n.load(),
            })
            .collect();
        entries.sort_by_key(|e| e.node_id);
        entries
    }

    /// Jobs currently waiting for a node.
    pub fn waiting(&self) -> usize {
        self.lock()
            .waiters
            .iter()
            .filter(|w| !w.tx.is_closed())
            .count()
    }
}

// ---------------------------------------------------------------------------
// Lease
// ---------------------------------------------------------------------------

/// Exclusive use of one node for one job.
pub struct Lease {
    pool: Arc<WorkerPool>,
    node_id: DbId,
    client: Arc<dyn NodeClient>,
    fault: CancellationToken,
    armed: bool,
    started: bool,
}

impl Lease {
    pub fn node_id(&self) -> DbId {
        self.node_id
    }

    pub fn client(&self) -> &Arc<dyn NodeClient> {
        &self.client
    }

    /// Mark the node `Executing`. Idempotent.
    pub fn start(&mut self) {
        if !self.started {
            self.started = true;
            self.pool.signal(self.node_id, NodeSignal::JobStarted);
        }
    }

    /// Cancelled when the node hits a connection or auth error, or is
    /// removed from the pool.
    pub fn fault_token(&self) -> CancellationToken {
        self.fault.clone()
    }

    pub fn is_faulted(&self) -> bool {
        self.fault.is_cancelled()
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.armed {
            self.pool.release(self.node_id, self.started);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use fleet_comfyui::ScriptedNode;
    use std::time::Duration;

    fn pool_with(nodes: &[DbId]) -> (Arc<WorkerPool>, SignalReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let pool = WorkerPool::new(tx);
        for id in nodes {
            pool.add(Arc::new(ScriptedNode::new(*id)));
            pool.set_status(*id, NodeStatus::Online);
        }
        (pool, rx)
    }

    async fn wait_for_waiters(pool: &WorkerPool, n: usize) {
        for _ in 0..200 {
            if pool.waiting() == n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {n} waiters, saw {}", pool.waiting());
    }

    #[tokio::test]
    async fn waiters_are_served_lowest_weight_first() {
        let (pool, _rx) = pool_with(&[1]);
        let cancel = CancellationToken::new();
        let held = pool.acquire(0.0, None, &cancel).await.unwrap();

        let (order_tx, mut order_rx) = mpsc::unbounded_channel();
        for weight in [0.5, 0.2, 0.9] {
            let pool = Arc::clone(&pool);
            let cancel = cancel.clone();
            let order_tx = order_tx.clone();
            tokio::spawn(async move {
                let _lease = pool.acquire(weight, None, &cancel).await.unwrap();
                order_tx.send(weight).unwrap();
            });
        }
        wait_for_waiters(&pool, 3).await;
        drop(held);

        let mut order = Vec::new();
        for _ in 0..3 {
            order.push(order_rx.recv().await.unwrap());
        }
        assert_eq!(order, vec![0.2, 0.5, 0.9]);
    }

    #[tokio::test]
    async fn equal_weights_are_fifo() {
        let (pool, _rx) = pool_with(&[1]);
        let cancel = CancellationToken::new();
        let held = pool.acquire(0.0, None, &cancel).await.unwrap();

        let (order_tx, mut order_rx) = mpsc::unbounded_channel();
        for label in ["first", "second"] {
            let waiter_pool = Arc::clone(&pool);
            let cancel = cancel.clone();
            let order_tx = order_tx.clone();
            tokio::spawn(async move {
                let _lease = waiter_pool.acquire(1.0, None, &cancel).await.unwrap();
                order_tx.send(label).unwrap();
            });
            wait_for_waiters(&pool, if label == "first" { 1 } else { 2 }).await;
        }
        drop(held);

        assert_eq!(order_rx.recv().await.unwrap(), "first");
        assert_eq!(order_rx.recv().await.unwrap(), "second");
    }

    #[tokio::test]
    async fn least_recently_used_node_is_picked() {
        let (pool, _rx) = pool_with(&[1, 2]);
        let cancel = CancellationToken::new();

        let first = pool.acquire(0.0, None, &cancel).await.unwrap();
        let first_id = first.node_id();
        drop(first);

        let second = pool.acquire(0.0, None, &cancel).await.unwrap();
        assert_ne!(second.node_id(), first_id);
    }

    #[tokio::test]
    async fn idle_preferred_node_is_honoured() {
        let (pool, _rx) = pool_with(&[1, 2]);
        let cancel = CancellationToken::new();

        let lease = pool.acquire(0.0, Some(2), &cancel).await.unwrap();
        assert_eq!(lease.node_id(), 2);

        // Preferred node busy: any other idle node is used.
        let other = pool.acquire(0.0, Some(2), &cancel).await.unwrap();
        assert_eq!(other.node_id(), 1);
    }

    #[tokio::test]
    async fn offline_nodes_are_never_leased() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let pool = WorkerPool::new(tx);
        pool.add(Arc::new(ScriptedNode::new(1)));

        let cancel = CancellationToken::new();
        let waiter = {
            let pool = Arc::clone(&pool);
            let cancel = cancel.clone();
            tokio::spawn(async move { pool.acquire(0.0, None, &cancel).await.map(|l| l.node_id()) })
        };
        wait_for_waiters(&pool, 1).await;

        pool.set_status(1, NodeStatus::Online);
        assert_eq!(waiter.await.unwrap().unwrap(), 1);
    }

    #[tokio::test]
    async fn lease_signals_start_and_finish() {
        let (pool, mut rx) = pool_with(&[1]);
        let cancel = CancellationToken::new();

        let mut lease = pool.acquire(0.0, None, &cancel).await.unwrap();
        lease.start();
        lease.start();
        drop(lease);

        assert_eq!(rx.recv().await.unwrap(), (1, NodeSignal::JobStarted));
        assert_eq!(rx.recv().await.unwrap(), (1, NodeSignal::JobFinished));
        assert!(rx.try_recv().is_err());
        assert!(!pool.is_busy(1));
    }

    #[tokio::test]
    async fn fault_cancels_the_current_lease() {
        let (pool, _rx) = pool_with(&[1]);
        let cancel = CancellationToken::new();

        assert!(!pool.fault(1));
        let lease = pool.acquire(0.0, None, &cancel).await.unwrap();
        assert!(pool.fault(1));
        lease.fault_token().cancelled().await;
        assert!(lease.is_faulted());
    }

    #[tokio::test]
    async fn cancelled_acquire_leaves_no_waiter() {
        let (pool, _rx) = pool_with(&[]);
        let cancel = CancellationToken::new();

        let pending = {
            let pool = Arc::clone(&pool);
            let cancel = cancel.clone();
            tokio::spawn(async move { pool.acquire(0.0, None, &cancel).await.map(|l| l.node_id()) })
        };
        wait_for_waiters(&pool, 1).await;
        cancel.cancel();

        assert_matches!(pending.await.unwrap(), Err(SchedulerError::Cancelled));
        assert_eq!(pool.waiting(), 0);
    }

    #[tokio::test]
    async fn removing_a_node_faults_its_lease() {
        let (pool, _rx) = pool_with(&[1]);
        let cancel = CancellationToken::new();

        let lease = pool.acquire(0.0, None, &cancel).await.unwrap();
        assert!(pool.remove(1).is_some());
        assert!(lease.is_faulted());
        drop(lease);
        assert!(pool.snapshot().is_empty());
    }
}
