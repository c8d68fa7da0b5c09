//! [`Scheduler`]: wires the registry, admission and dispatch loop together
//! and owns their lifecycle.

use std::sync::Arc;
use std::time::Duration;

use fleet_comfyui::NodeConnector;
use fleet_core::admission::Requester;
use fleet_core::types::DbId;
use fleet_db::models::task::Task;
use fleet_db::TaskStore;
use fleet_events::NotificationBus;
use fleet_pipeline::{AttachmentService, BlobStore};
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::admission::{Admission, Submission};
use crate::config::SchedulerConfig;
use crate::dispatcher::Dispatcher;
use crate::error::SchedulerError;
use crate::recovery::{recover, RecoveryReport};
use crate::registry::NodeRegistry;
use crate::runner::JobRunner;

/// How long shutdown waits for the loop and in-flight jobs.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Scheduler {
    store: Arc<dyn TaskStore>,
    bus: NotificationBus,
    attachments: AttachmentService,
    registry: Arc<NodeRegistry>,
    admission: Admission,
    dispatcher: Arc<Dispatcher>,
    cancel: CancellationToken,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    /// Build every component. Nothing runs until [`start`](Self::start).
    ///
    /// Must be called inside a Tokio runtime.
    pub fn new(
        store: Arc<dyn TaskStore>,
        bus: NotificationBus,
        connector: Arc<dyn NodeConnector>,
        blobs: Arc<dyn BlobStore>,
        config: SchedulerConfig,
    ) -> Arc<Self> {
        let cancel = CancellationToken::new();
        let attachments = AttachmentService::new(Arc::clone(&store), blobs);

        let registry = NodeRegistry::new(
            Arc::clone(&store),
            bus.clone(),
            connector,
            cancel.child_token(),
        );
        let runner = Arc::new(JobRunner::new(
            Arc::clone(&store),
            bus.clone(),
            Arc::clone(registry.pool()),
            attachments.clone(),
            config.pipeline_timeout,
            cancel.child_token(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&store),
            runner,
            config.batch_size,
            config.idle_backoff,
        ));
        let admission = Admission::new(Arc::clone(&store), bus.clone(), config.workflow_cache_ttl);

        Arc::new(Self {
            store,
            bus,
            attachments,
            registry,
            admission,
            dispatcher,
            cancel,
            loop_handle: Mutex::new(None),
        })
    }

    /// Recover from a previous run, connect persisted nodes and start the
    /// dispatch loop.
    pub async fn start(&self) -> Result<RecoveryReport, SchedulerError> {
        let report = recover(self.store.as_ref()).await?;
        self.registry.load_nodes().await?;

        let dispatcher = Arc::clone(&self.dispatcher);
        let cancel = self.cancel.child_token();
        let handle = tokio::spawn(async move { dispatcher.run(cancel).await });
        if let Some(previous) = self.loop_handle.lock().await.replace(handle) {
            previous.abort();
        }
        Ok(report)
    }

    /// Stop the loop, wait briefly for jobs, then close node connections.
    pub async fn shutdown(&self) {
        tracing::info!("Scheduler shutting down");
        self.cancel.cancel();

        if let Some(handle) = self.loop_handle.lock().await.take() {
            let _ = tokio::time::timeout(SHUTDOWN_TIMEOUT, handle).await;
        }
        if !self.dispatcher.drain(SHUTDOWN_TIMEOUT).await {
            tracing::warn!(
                in_flight = self.dispatcher.in_flight(),
                "Jobs still running at shutdown",
            );
        }
        self.registry.shutdown().await;
    }

    pub async fn submit_execution(
        &self,
        workflow_id: DbId,
        input: &Map<String, Value>,
        repeat: u32,
        requester: Requester,
    ) -> Result<Submission, SchedulerError> {
        self.admission
            .submit_execution(workflow_id, input, repeat, requester)
            .await
    }

    /// Queued and in-flight tasks, optionally for one workflow.
    pub async fn running_tasks(&self, workflow_id: Option<DbId>) -> Result<Vec<Task>, SchedulerError> {
        Ok(self.store.running_tasks(workflow_id).await?)
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn bus(&self) -> &NotificationBus {
        &self.bus
    }

    pub fn attachments(&self) -> &AttachmentService {
        &self.attachments
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn admission(&self) -> &Admission {
        &self.admission
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }
}
