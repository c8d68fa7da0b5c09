//! One job: drive a claimed task from `Pending` to `Success` or `Failed`.
//!
//! The job owns every status change of its task, so per-task event order
//! is the order the job observed. Failures are converted into a task
//! event, a `Failed` status and a user notification; nothing propagates
//! to the dispatch loop.

use std::sync::Arc;
use std::time::{Duration, Instant};

use fleet_comfyui::{ExecutionEvent, NodeError, RunOutputs};
use fleet_core::status::{aggregate_parent_status, TaskStatus};
use fleet_core::types::DbId;
use fleet_db::models::notification::NewNotification;
use fleet_db::models::task::{Task, TaskCompletion};
use fleet_db::models::workflow::Workflow;
use fleet_db::TaskStore;
use fleet_events::{Category, NotificationBus};
use fleet_pipeline::{AttachmentService, OutputPipeline};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::SchedulerError;
use crate::pool::{Lease, WorkerPool};
use crate::prompt::build_prompt;

/// How a job ended.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed { execution_time_ms: i64 },
    Failed(String),
    /// Shut down before finishing. Start-up recovery requeues the task.
    Abandoned,
}

pub struct JobRunner {
    store: Arc<dyn TaskStore>,
    bus: NotificationBus,
    pool: Arc<WorkerPool>,
    attachments: AttachmentService,
    pipeline: OutputPipeline,
    pipeline_timeout: Duration,
    cancel: CancellationToken,
}

impl JobRunner {
    pub fn new(
        store: Arc<dyn TaskStore>,
        bus: NotificationBus,
        pool: Arc<WorkerPool>,
        attachments: AttachmentService,
        pipeline_timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            bus,
            pool,
            pipeline: OutputPipeline::new(attachments.clone()),
            attachments,
            pipeline_timeout,
            cancel,
        }
    }

    /// Run `task` to completion. Never fails; the outcome is recorded.
    pub async fn run(&self, task: Task) -> JobOutcome {
        let outcome = self.drive(&task).await;

        match &outcome {
            JobOutcome::Completed { execution_time_ms } => {
                tracing::info!(task_id = task.id, execution_time_ms, "Task completed");
                let message = format!("Task {} finished in {execution_time_ms} ms", task.id);
                self.notify(&task, "Task finished", message).await;
            }
            JobOutcome::Failed(detail) => {
                tracing::warn!(task_id = task.id, detail = %detail, "Task failed");
                match self
                    .store
                    .set_task_status(task.id, TaskStatus::Failed, Some(detail.as_str()), None)
                    .await
                {
                    Ok(true) => {
                        self.publish_status(&task, TaskStatus::Failed, None, Some(detail.as_str()))
                            .await;
                    }
                    Ok(false) => {
                        tracing::warn!(task_id = task.id, "Task was no longer in flight");
                    }
                    Err(e) => {
                        tracing::error!(task_id = task.id, error = %e, "Failed to mark task failed");
                    }
                }
                self.notify(&task, "Task failed", format!("Task {} failed: {detail}", task.id))
                    .await;
            }
            JobOutcome::Abandoned => {
                tracing::info!(task_id = task.id, "Job abandoned on shutdown");
                return outcome;
            }
        }

        self.finish(&task).await;
        outcome
    }

    async fn drive(&self, task: &Task) -> JobOutcome {
        let workflow = match self.store.find_workflow(task.workflow_id).await {
            Ok(Some(workflow)) => workflow,
            Ok(None) => return JobOutcome::Failed(format!("Workflow {} not found", task.workflow_id)),
            Err(e) => return JobOutcome::Failed(format!("Failed to load workflow: {e}")),
        };

        let mut lease = match self.pool.acquire(task.weight, task.node_id, &self.cancel).await {
            Ok(lease) => lease,
            Err(_) => return JobOutcome::Abandoned,
        };
        let node_id = lease.node_id();

        if let Err(e) = self.store.assign_node(task.id, node_id).await {
            return JobOutcome::Failed(format!("Failed to bind node: {e}"));
        }
        tracing::debug!(task_id = task.id, node_id, "Node leased");

        let prompt =
            match build_prompt(&workflow, task, lease.client().as_ref(), &self.attachments).await {
                Ok(prompt) => prompt,
                Err(e) => return JobOutcome::Failed(format!("Prompt build failed: {e}")),
            };

        let started_at = Instant::now();
        let outputs = match self.execute(task, &workflow, &mut lease, &prompt).await {
            Ok(outputs) => outputs,
            Err(SchedulerError::Cancelled) => return JobOutcome::Abandoned,
            Err(e) => return JobOutcome::Failed(failure_detail(&e)),
        };
        let execution_time_ms = i64::try_from(started_at.elapsed().as_millis()).unwrap_or(i64::MAX);

        // The node is free as soon as it has produced its outputs.
        self.ensure_running(task, &mut lease, node_id).await;
        drop(lease);

        let collected =
            match tokio::time::timeout(self.pipeline_timeout, self.pipeline.collect(task, outputs))
                .await
            {
                Ok(Ok(collected)) => collected,
                Ok(Err(e)) => return JobOutcome::Failed(format!("Output processing failed: {e}")),
                Err(_) => {
                    let e = SchedulerError::PipelineTimeout(self.pipeline_timeout);
                    return JobOutcome::Failed(e.to_string());
                }
            };

        let completion = TaskCompletion {
            output_values: collected.values,
            execution_time_ms,
            attachments: collected.attachments,
        };
        match self.store.complete_task(task.id, &completion).await {
            Ok(true) => {
                self.publish_status(task, TaskStatus::Success, Some(node_id), None)
                    .await;
                JobOutcome::Completed { execution_time_ms }
            }
            Ok(false) => JobOutcome::Failed("Task left Running before completion".into()),
            Err(e) => JobOutcome::Failed(format!("Failed to store outputs: {e}")),
        }
    }

    /// Submit the prompt and relay execution events until the run ends,
    /// the node faults, or the scheduler shuts down.
    async fn execute(
        &self,
        task: &Task,
        workflow: &Workflow,
        lease: &mut Lease,
        prompt: &serde_json::Value,
    ) -> Result<RunOutputs, SchedulerError> {
        let node_id = lease.node_id();
        let client = Arc::clone(lease.client());
        let fault = lease.fault_token();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let run = client.run_prompt(prompt, &workflow.outputs.0, tx);
        tokio::pin!(run);

        let result = loop {
            tokio::select! {
                biased;
                Some(event) = rx.recv() => self.on_event(task, lease, event).await,
                result = &mut run => break result.map_err(SchedulerError::from),
                _ = fault.cancelled() => {
                    break Err(SchedulerError::Node(NodeError::Connection(format!(
                        "node {node_id} lost its connection"
                    ))));
                }
                _ = self.cancel.cancelled() => break Err(SchedulerError::Cancelled),
            }
        };

        while let Ok(event) = rx.try_recv() {
            self.on_event(task, lease, event).await;
        }
        result
    }

    async fn on_event(&self, task: &Task, lease: &mut Lease, event: ExecutionEvent) {
        let node_id = lease.node_id();
        match event {
            ExecutionEvent::Pending { prompt_id } => {
                self.append_event(
                    task.id,
                    TaskStatus::Pending,
                    "Loading resources",
                    json!({ "prompt_id": prompt_id, "node_id": node_id }),
                )
                .await;
                self.bus
                    .emit(
                        Category::Task,
                        task.id,
                        json!({
                            "task_id": task.id,
                            "status": TaskStatus::Pending,
                            "node_id": node_id,
                            "detail": "loading_resources",
                        }),
                    )
                    .await;
            }
            ExecutionEvent::Start => self.ensure_running(task, lease, node_id).await,
            ExecutionEvent::Progress { node, value, max } => {
                let data = json!({ "node_id": node_id, "graph_node": node, "value": value, "max": max });
                self.append_event(task.id, TaskStatus::Running, "Progress", data.clone())
                    .await;
                let mut payload = data;
                payload["task_id"] = json!(task.id);
                self.bus.emit(Category::Task, task.id, payload).await;
            }
            ExecutionEvent::Preview(image) => {
                self.bus
                    .emit(
                        Category::TaskPreview,
                        task.id,
                        json!({ "task_id": task.id, "image": image }),
                    )
                    .await;
            }
        }
    }

    /// `Pending -> Running` and mark the node `Executing`. Idempotent.
    async fn ensure_running(&self, task: &Task, lease: &mut Lease, node_id: DbId) {
        lease.start();
        match self
            .store
            .set_task_status(task.id, TaskStatus::Running, Some("Execution started"), None)
            .await
        {
            Ok(true) => {
                self.publish_status(task, TaskStatus::Running, Some(node_id), None)
                    .await
            }
            Ok(false) => {}
            Err(e) => tracing::error!(task_id = task.id, error = %e, "Failed to mark task running"),
        }
    }

    async fn append_event(
        &self,
        task_id: DbId,
        status: TaskStatus,
        details: &str,
        data: serde_json::Value,
    ) {
        if let Err(e) = self
            .store
            .append_task_event(task_id, status, Some(details), Some(&data))
            .await
        {
            tracing::error!(task_id, error = %e, "Failed to append task event");
        }
    }

    async fn publish_status(
        &self,
        task: &Task,
        status: TaskStatus,
        node_id: Option<DbId>,
        detail: Option<&str>,
    ) {
        self.bus
            .emit(
                Category::Task,
                task.id,
                json!({
                    "task_id": task.id,
                    "workflow_id": task.workflow_id,
                    "parent_id": task.parent_id,
                    "status": status,
                    "node_id": node_id,
                    "detail": detail,
                }),
            )
            .await;
    }

    /// Tell the triggering user, if there is one.
    async fn notify(&self, task: &Task, title: &str, message: String) {
        let user_id = match self.store.find_trigger(task.trigger_id).await {
            Ok(trigger) => trigger.and_then(|t| t.user_id),
            Err(e) => {
                tracing::error!(task_id = task.id, error = %e, "Failed to load trigger");
                None
            }
        };
        let Some(user_id) = user_id else {
            return;
        };

        let input = NewNotification {
            user_id,
            task_id: Some(task.id),
            title: title.to_string(),
            message,
        };
        match self.store.create_user_notification(&input).await {
            Ok(notification) => {
                let payload = serde_json::to_value(&notification).unwrap_or_default();
                self.bus.emit(Category::Notification, user_id, payload).await;
            }
            Err(e) => {
                tracing::error!(task_id = task.id, user_id, error = %e, "Failed to create notification");
            }
        }
    }

    /// Refresh workflow views and the parent's aggregated status.
    async fn finish(&self, task: &Task) {
        let status = self
            .store
            .find_task(task.id)
            .await
            .ok()
            .flatten()
            .and_then(|t| t.status());
        self.bus
            .emit(
                Category::Workflow,
                task.workflow_id,
                json!({ "event": "task_finished", "task_id": task.id, "status": status }),
            )
            .await;

        let Some(parent_id) = task.parent_id else {
            return;
        };
        match self.store.list_children(parent_id).await {
            Ok(children) => {
                let statuses: Vec<TaskStatus> = children.iter().filter_map(Task::status).collect();
                let aggregated = aggregate_parent_status(&statuses);
                self.bus
                    .emit(
                        Category::Task,
                        parent_id,
                        json!({ "task_id": parent_id, "status": aggregated, "parent": true }),
                    )
                    .await;
            }
            Err(e) => tracing::error!(parent_id, error = %e, "Failed to aggregate parent status"),
        }
    }
}

/// Task event detail for a failed run.
fn failure_detail(err: &SchedulerError) -> String {
    match err {
        SchedulerError::Node(NodeError::ExecutionFailed(detail)) => detail.clone(),
        SchedulerError::Node(NodeError::Interrupted) => "Interrupted".to_string(),
        SchedulerError::Node(e @ NodeError::Connection(_)) => e.to_string(),
        SchedulerError::Node(e) if e.is_connection_fault() => format!("Connection error: {e}"),
        other => other.to_string(),
    }
}
