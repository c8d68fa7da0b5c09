//! Dispatch loop, job runner and node registry end to end, with scripted
//! nodes standing in for GPU hosts.

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use async_trait::async_trait;
use fleet_comfyui::{ExecutionEvent, NodeLifecycle, OutputValue, RunOutputs, ScriptedRun};
use fleet_core::admission::Requester;
use fleet_core::node::{NodeAction, NodeAuth};
use fleet_core::status::{NodeEventKind, NodeStatus, Role, TaskStatus};
use fleet_core::workflow::{InputDefs, OutputDefs, OutputKind, SlotTarget, WorkflowOutput};
use fleet_db::models::node::CreateNode;
use fleet_db::TaskStore;
use fleet_events::{Category, Topic};
use fleet_pipeline::{BlobError, BlobStore, MemoryBlobStore};
use fleet_worker::recovery::recover;
use fleet_worker::{SchedulerConfig, SchedulerError};
use futures::StreamExt;
use serde_json::{json, Map};
use tokio_util::sync::CancellationToken;

use common::{
    fast_config, harness, harness_with_blobs, png, wait_for_node, wait_for_task, wait_for_waiters,
};

fn outputs(key: &str, kind: OutputKind) -> OutputDefs {
    let mut defs = OutputDefs::new();
    defs.insert(
        key.to_string(),
        WorkflowOutput {
            kind,
            target: SlotTarget::new("9", key),
        },
    );
    defs
}

fn run_outputs(key: &str, value: OutputValue) -> RunOutputs {
    let mut outputs = BTreeMap::new();
    outputs.insert(key.to_string(), value);
    outputs
}

#[tokio::test]
async fn queued_task_runs_to_success() {
    let h = harness();
    let user = h.store.insert_account(Role::User, 10.0, 0.0).await;
    let wf = h.workflow(1.0, 0.0, InputDefs::new(), outputs("caption", OutputKind::String)).await;
    let (node, scripted) = h.node("gpu-a").await;
    scripted
        .push_run(ScriptedRun::Succeed {
            events: vec![
                ExecutionEvent::Start,
                ExecutionEvent::Progress {
                    node: Some("3".into()),
                    value: 10,
                    max: 20,
                },
            ],
            outputs: run_outputs("caption", OutputValue::Text("a cat on a mat".into())),
            delay: Duration::ZERO,
        })
        .await;

    let mut task_updates = h
        .bus
        .subscribe(Topic::category(Category::Task), CancellationToken::new())
        .await
        .unwrap();

    let submission = h
        .scheduler
        .submit_execution(wf.id, &Map::new(), 1, Requester::user(user.id))
        .await
        .unwrap();
    h.scheduler.start().await.unwrap();

    let task = wait_for_task(&h.store, submission.task_id, TaskStatus::Success).await;
    assert_eq!(task.node_id, Some(node.id));
    assert_eq!(task.output_values, Some(json!({ "caption": "a cat on a mat" })));
    assert!(task.execution_time_ms.is_some());

    let statuses: Vec<TaskStatus> = h
        .store
        .list_task_events(task.id)
        .await
        .unwrap()
        .iter()
        .filter_map(|e| TaskStatus::from_id(e.status_id))
        .collect();
    assert_eq!(statuses.first(), Some(&TaskStatus::Queuing));
    assert_eq!(statuses.last(), Some(&TaskStatus::Success));
    assert!(statuses.contains(&TaskStatus::Pending));
    assert!(statuses.contains(&TaskStatus::Running));

    let notifications = h.store.list_user_notifications(user.id).await.unwrap();
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].title, "Task finished");
    assert_eq!(notifications[0].task_id, Some(task.id));

    let mut saw_success = false;
    while let Ok(Some(message)) =
        tokio::time::timeout(Duration::from_millis(200), task_updates.next()).await
    {
        if message.payload["status"] == json!("success") {
            saw_success = true;
            break;
        }
    }
    assert!(saw_success);

    wait_for_node(h.scheduler.registry().pool(), node.id, NodeStatus::Online).await;
    h.scheduler.shutdown().await;
}

#[tokio::test]
async fn waiting_jobs_get_the_node_lowest_weight_first() {
    let h = harness();
    let mut ids = Vec::new();
    for base_weight in [0.5, 0.2, 0.9] {
        let wf = h.workflow(0.0, base_weight, InputDefs::new(), OutputDefs::new()).await;
        let submission = h
            .scheduler
            .submit_execution(wf.id, &Map::new(), 1, Requester::system())
            .await
            .unwrap();
        ids.push(submission.task_id);
    }

    h.scheduler.start().await.unwrap();
    wait_for_waiters(h.scheduler.registry().pool(), 3).await;

    let (_, scripted) = h.node("gpu-a").await;
    for id in &ids {
        wait_for_task(&h.store, *id, TaskStatus::Success).await;
    }

    let order: Vec<f64> = scripted
        .prompts()
        .await
        .iter()
        .map(|p| p["tag"]["inputs"]["weight"].as_f64().unwrap())
        .collect();
    assert_eq!(order, vec![0.2, 0.5, 0.9]);
    h.scheduler.shutdown().await;
}

#[tokio::test]
async fn connection_loss_fails_the_running_task() {
    let h = harness();
    let wf = h.workflow(0.0, 0.0, InputDefs::new(), OutputDefs::new()).await;
    let (node, scripted) = h.node("gpu-a").await;
    scripted.push_run(ScriptedRun::Hang).await;

    let submission = h
        .scheduler
        .submit_execution(wf.id, &Map::new(), 1, Requester::system())
        .await
        .unwrap();
    h.scheduler.start().await.unwrap();
    wait_for_task(&h.store, submission.task_id, TaskStatus::Running).await;

    scripted.emit(NodeLifecycle::ConnectionError {
        node_id: node.id,
        error: "reset by peer".into(),
    });

    let task = wait_for_task(&h.store, submission.task_id, TaskStatus::Failed).await;
    let events = h.store.list_task_events(task.id).await.unwrap();
    let last = events.last().unwrap();
    assert!(last.details.as_deref().unwrap().starts_with("Connection error"));

    wait_for_node(h.scheduler.registry().pool(), node.id, NodeStatus::Error).await;
    h.scheduler.shutdown().await;
}

#[tokio::test]
async fn execution_failure_is_recorded_and_notified() {
    let h = harness();
    let user = h.store.insert_account(Role::User, 10.0, 0.0).await;
    let wf = h.workflow(0.0, 0.0, InputDefs::new(), OutputDefs::new()).await;
    let (_, scripted) = h.node("gpu-a").await;
    scripted
        .push_run(ScriptedRun::Fail("CUDA out of memory".into()))
        .await;

    let submission = h
        .scheduler
        .submit_execution(wf.id, &Map::new(), 1, Requester::user(user.id))
        .await
        .unwrap();
    h.scheduler.start().await.unwrap();

    let task = wait_for_task(&h.store, submission.task_id, TaskStatus::Failed).await;
    let events = h.store.list_task_events(task.id).await.unwrap();
    assert_eq!(events.last().unwrap().details.as_deref(), Some("CUDA out of memory"));

    let notifications = h.store.list_user_notifications(user.id).await.unwrap();
    assert_eq!(notifications[0].title, "Task failed");
    assert!(notifications[0].message.contains("CUDA out of memory"));
    h.scheduler.shutdown().await;
}

#[tokio::test]
async fn image_outputs_are_stored_with_renditions() {
    let h = harness();
    let wf = h.workflow(0.0, 0.0, InputDefs::new(), outputs("images", OutputKind::Image)).await;
    let (_, scripted) = h.node("gpu-a").await;
    scripted
        .push_run(ScriptedRun::succeed(run_outputs(
            "images",
            OutputValue::Blobs(vec![png(64, 32)]),
        )))
        .await;

    let submission = h
        .scheduler
        .submit_execution(wf.id, &Map::new(), 1, Requester::system())
        .await
        .unwrap();
    h.scheduler.start().await.unwrap();

    let task = wait_for_task(&h.store, submission.task_id, TaskStatus::Success).await;
    assert!(task.expects_files);

    let mut keys: Vec<String> = h
        .store
        .list_task_attachments(task.id)
        .await
        .unwrap()
        .into_iter()
        .map(|l| l.output_key)
        .collect();
    keys.sort();
    assert_eq!(keys, vec!["images", "images_high", "images_preview"]);

    let items = task.output_values.unwrap()["images"].clone();
    let raw_id = items[0]["attachment_id"].as_i64().unwrap();
    let raw = h.store.find_attachment(raw_id).await.unwrap().unwrap();
    assert_eq!(raw.file_name, format!("{}_images_0.png", task.id));
    assert!(!h.blobs.is_empty().await);
    h.scheduler.shutdown().await;
}

/// Uploads stall long enough to overrun any short pipeline timeout.
struct StalledUploads(Arc<MemoryBlobStore>);

#[async_trait]
impl BlobStore for StalledUploads {
    fn tag(&self) -> &'static str {
        "stalled"
    }

    async fn upload(&self, bytes: &[u8], name: &str) -> Result<(), BlobError> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        self.0.upload(bytes, name).await
    }

    async fn url(&self, name: &str, ttl: Duration) -> Result<String, BlobError> {
        self.0.url(name, ttl).await
    }

    async fn get(&self, name: &str) -> Result<Vec<u8>, BlobError> {
        self.0.get(name).await
    }

    async fn exists(&self, name: &str) -> Result<bool, BlobError> {
        self.0.exists(name).await
    }
}

#[tokio::test]
async fn slow_output_upload_fails_the_task_after_node_success() {
    let config = SchedulerConfig {
        pipeline_timeout: Duration::from_millis(300),
        ..fast_config()
    };
    let h = harness_with_blobs(config, |blobs| Arc::new(StalledUploads(blobs)));
    let user = h.store.insert_account(Role::User, 10.0, 0.0).await;
    let wf = h.workflow(0.0, 0.0, InputDefs::new(), outputs("images", OutputKind::Image)).await;
    let (node, scripted) = h.node("gpu-a").await;
    scripted
        .push_run(ScriptedRun::succeed(run_outputs(
            "images",
            OutputValue::Blobs(vec![png(16, 16)]),
        )))
        .await;

    let submission = h
        .scheduler
        .submit_execution(wf.id, &Map::new(), 1, Requester::user(user.id))
        .await
        .unwrap();
    h.scheduler.start().await.unwrap();

    let task = wait_for_task(&h.store, submission.task_id, TaskStatus::Failed).await;
    assert!(h.store.list_task_attachments(task.id).await.unwrap().is_empty());
    let events = h.store.list_task_events(task.id).await.unwrap();
    assert_eq!(
        events.last().unwrap().details.as_deref(),
        Some("Pipeline timed out after 300ms")
    );

    let notifications = h.store.list_user_notifications(user.id).await.unwrap();
    assert_eq!(notifications[0].title, "Task failed");
    assert!(notifications[0].message.contains("300ms"));

    // The node was released before the upload started.
    wait_for_node(h.scheduler.registry().pool(), node.id, NodeStatus::Online).await;
    assert!(h.blobs.is_empty().await);
    h.scheduler.shutdown().await;
}

#[tokio::test]
async fn batch_children_run_and_parent_stays_parent() {
    let h = harness();
    let wf = h.workflow(0.0, 0.0, InputDefs::new(), OutputDefs::new()).await;
    h.node("gpu-a").await;
    h.node("gpu-b").await;

    let submission = h
        .scheduler
        .submit_execution(wf.id, &Map::new(), 3, Requester::system())
        .await
        .unwrap();
    h.scheduler.start().await.unwrap();

    let children = h.store.list_children(submission.task_id).await.unwrap();
    for child in &children {
        wait_for_task(&h.store, child.id, TaskStatus::Success).await;
    }
    let parent = h.store.find_task(submission.task_id).await.unwrap().unwrap();
    assert_eq!(parent.status(), Some(TaskStatus::Parent));
    h.scheduler.shutdown().await;
}

#[tokio::test]
async fn recovery_requeues_and_purges_once() {
    let h = harness();
    let plain = h.workflow(0.0, 0.0, InputDefs::new(), OutputDefs::new()).await;
    let imaging = h.workflow(0.0, 1.0, InputDefs::new(), outputs("images", OutputKind::Image)).await;

    let interrupted = h
        .scheduler
        .submit_execution(plain.id, &Map::new(), 1, Requester::system())
        .await
        .unwrap();
    let outputless = h
        .scheduler
        .submit_execution(imaging.id, &Map::new(), 1, Requester::system())
        .await
        .unwrap();
    h.store.force_task_status(interrupted.task_id, TaskStatus::Running).await;
    h.store.force_task_status(outputless.task_id, TaskStatus::Success).await;

    let first = recover(h.store.as_ref()).await.unwrap();
    assert_eq!(first.requeued, 1);
    assert_eq!(first.purged, 1);

    let task = h.store.find_task(interrupted.task_id).await.unwrap().unwrap();
    assert_eq!(task.status(), Some(TaskStatus::Queuing));
    assert_eq!(task.node_id, None);
    assert!(h.store.find_task(outputless.task_id).await.unwrap().is_none());

    let second = recover(h.store.as_ref()).await.unwrap();
    assert_eq!(second.requeued, 0);
    assert_eq!(second.purged, 0);
}

#[tokio::test]
async fn start_keeps_clients_of_nodes_imported_earlier() {
    let h = harness();
    let (node, scripted) = h.node("gpu-a").await;
    let pool = h.scheduler.registry().pool();
    let before = pool.client(node.id).unwrap();

    h.scheduler.start().await.unwrap();

    let after = pool.client(node.id).unwrap();
    assert!(Arc::ptr_eq(&before, &after));
    assert!(!scripted.is_shut_down());
    assert_eq!(pool.status(node.id), Some(NodeStatus::Online));
    assert_eq!(h.scheduler.registry().load_nodes().await.unwrap(), 0);

    h.scheduler.shutdown().await;
}

#[tokio::test]
async fn interrupt_cancels_only_the_current_job() {
    let h = harness();
    let wf = h.workflow(0.0, 0.0, InputDefs::new(), OutputDefs::new()).await;
    let (node, scripted) = h.node("gpu-a").await;
    scripted.push_run(ScriptedRun::Hang).await;

    let first = h
        .scheduler
        .submit_execution(wf.id, &Map::new(), 1, Requester::system())
        .await
        .unwrap();
    h.scheduler.start().await.unwrap();
    wait_for_task(&h.store, first.task_id, TaskStatus::Running).await;

    let second = h
        .scheduler
        .submit_execution(wf.id, &Map::new(), 1, Requester::system())
        .await
        .unwrap();

    h.scheduler
        .registry()
        .control_node(node.id, NodeAction::Interrupt)
        .await
        .unwrap();

    let task = wait_for_task(&h.store, first.task_id, TaskStatus::Failed).await;
    let events = h.store.list_task_events(task.id).await.unwrap();
    assert_eq!(events.last().unwrap().details.as_deref(), Some("Interrupted"));

    wait_for_task(&h.store, second.task_id, TaskStatus::Success).await;

    let history = h.store.list_node_events(node.id, 50).await.unwrap();
    let action = history
        .iter()
        .find(|e| e.kind() == Some(NodeEventKind::Action))
        .unwrap();
    assert_eq!(action.detail["action"], json!("interrupt"));
    assert_eq!(action.detail["ok"], json!(true));
    h.scheduler.shutdown().await;
}

#[tokio::test]
async fn removing_a_node_deletes_it_and_its_history() {
    let h = harness();
    let (node, scripted) = h.node("gpu-a").await;
    // The Online status event is recorded just after the pool flips.
    for _ in 0..100 {
        if !h.store.list_node_events(node.id, 50).await.unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!h.store.list_node_events(node.id, 50).await.unwrap().is_empty());

    h.scheduler.registry().remove_node(node.id).await.unwrap();

    assert!(h.store.find_node(node.id).await.unwrap().is_none());
    assert!(h.store.list_node_events(node.id, 50).await.unwrap().is_empty());
    assert!(scripted.is_shut_down());
    assert_eq!(h.scheduler.registry().pool().status(node.id), None);

    let again = h.scheduler.registry().remove_node(node.id).await;
    assert_matches!(again, Err(SchedulerError::Core(_)));
}

#[tokio::test]
async fn unreachable_host_is_not_imported() {
    let h = harness();
    h.connector.mark_unreachable("http://gpu-down:8188");

    let result = h
        .scheduler
        .registry()
        .import_node(CreateNode {
            name: "gpu-down".into(),
            host: "http://gpu-down:8188".into(),
            auth: NodeAuth::None,
        })
        .await;

    assert_matches!(result, Err(SchedulerError::NodeUnreachable { host, .. }) if host == "http://gpu-down:8188");
    assert!(h.store.list_nodes().await.unwrap().is_empty());
}

#[tokio::test]
async fn invalid_host_is_rejected_before_probing() {
    let h = harness();
    let result = h
        .scheduler
        .registry()
        .import_node(CreateNode {
            name: "gpu-a".into(),
            host: "ftp://gpu-a".into(),
            auth: NodeAuth::None,
        })
        .await;
    assert_matches!(result, Err(SchedulerError::Core(_)));
}

#[tokio::test]
async fn monitor_readings_are_published_and_scored() {
    let h = harness();
    let (node, scripted) = h.node("gpu-a").await;
    let mut readings = h
        .bus
        .subscribe(Topic::key(Category::NodeMonitor, node.id), CancellationToken::new())
        .await
        .unwrap();

    let payload = json!({ "cpu_utilization": 5.0, "gpus": [{ "gpu_utilization": 100.0 }] });
    scripted.emit(NodeLifecycle::SystemMonitor {
        node_id: node.id,
        payload: payload.clone(),
    });

    let message = tokio::time::timeout(Duration::from_secs(1), readings.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message.payload, payload);

    let entry = h
        .scheduler
        .registry()
        .pool()
        .snapshot()
        .into_iter()
        .find(|e| e.node_id == node.id)
        .unwrap();
    assert!(entry.load > 0.0);
}

#[tokio::test]
async fn shutdown_leaves_in_flight_tasks_for_recovery() {
    let h = harness();
    let wf = h.workflow(0.0, 0.0, InputDefs::new(), OutputDefs::new()).await;
    let (_, scripted) = h.node("gpu-a").await;
    scripted.push_run(ScriptedRun::Hang).await;

    let submission = h
        .scheduler
        .submit_execution(wf.id, &Map::new(), 1, Requester::system())
        .await
        .unwrap();
    h.scheduler.start().await.unwrap();
    wait_for_task(&h.store, submission.task_id, TaskStatus::Running).await;

    h.scheduler.shutdown().await;

    let task = h.store.find_task(submission.task_id).await.unwrap().unwrap();
    assert_eq!(task.status(), Some(TaskStatus::Running));
    let report = recover(h.store.as_ref()).await.unwrap();
    assert_eq!(report.requeued, 1);
}
