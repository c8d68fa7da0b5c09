//! Shared harness for scheduler integration tests.
//!
//! Everything runs in process: [`MemoryStore`], the in-memory bus,
//! [`MemoryBlobStore`] and [`ScriptedNode`]s handed out by a
//! [`ScriptedConnector`].

#![allow(dead_code)]

use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use fleet_comfyui::{NodeConnector, ScriptedConnector, ScriptedNode};
use fleet_core::backoff::BackoffConfig;
use fleet_core::node::NodeAuth;
use fleet_core::status::{NodeStatus, TaskStatus};
use fleet_core::types::DbId;
use fleet_core::workflow::{InputDefs, OutputDefs};
use fleet_db::models::node::{CreateNode, Node};
use fleet_db::models::task::Task;
use fleet_db::models::workflow::{CreateWorkflow, Workflow};
use fleet_db::{MemoryStore, TaskStore};
use fleet_events::NotificationBus;
use fleet_pipeline::{BlobStore, MemoryBlobStore};
use fleet_worker::{Scheduler, SchedulerConfig, WorkerPool};
use image::{DynamicImage, ImageFormat, RgbImage};
use serde_json::json;

const WAIT_STEP: Duration = Duration::from_millis(10);
const WAIT_STEPS: usize = 500;

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub bus: NotificationBus,
    pub connector: Arc<ScriptedConnector>,
    pub blobs: Arc<MemoryBlobStore>,
    pub scheduler: Arc<Scheduler>,
}

pub fn fast_config() -> SchedulerConfig {
    SchedulerConfig {
        batch_size: 10,
        idle_backoff: BackoffConfig {
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            multiplier: 2.0,
            jitter: 0.0,
        },
        pipeline_timeout: Duration::from_secs(5),
        workflow_cache_ttl: Duration::from_secs(30),
    }
}

pub fn harness() -> Harness {
    harness_with(fast_config())
}

pub fn harness_with(config: SchedulerConfig) -> Harness {
    harness_with_blobs(config, |blobs| blobs as Arc<dyn BlobStore>)
}

/// Like [`harness_with`], with the blob store the scheduler sees built
/// around the in-memory one.
pub fn harness_with_blobs(
    config: SchedulerConfig,
    wrap: impl FnOnce(Arc<MemoryBlobStore>) -> Arc<dyn BlobStore>,
) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let bus = NotificationBus::in_memory();
    let connector = Arc::new(ScriptedConnector::default());
    let blobs = Arc::new(MemoryBlobStore::new());
    let scheduler = Scheduler::new(
        store.clone() as Arc<dyn TaskStore>,
        bus.clone(),
        connector.clone() as Arc<dyn NodeConnector>,
        wrap(Arc::clone(&blobs)),
        config,
    );
    Harness {
        store,
        bus,
        connector,
        blobs,
        scheduler,
    }
}

impl Harness {
    pub async fn workflow(
        &self,
        cost: f64,
        base_weight: f64,
        inputs: InputDefs,
        outputs: OutputDefs,
    ) -> Workflow {
        self.store
            .create_workflow(&CreateWorkflow {
                name: format!("wf-{base_weight}"),
                graph: json!({
                    "3": { "class_type": "KSampler", "inputs": { "seed": 0, "steps": 20 } },
                    "6": { "class_type": "CLIPTextEncode", "inputs": { "text": "" } },
                    "9": { "class_type": "SaveImage", "inputs": { "filename_prefix": "out" } },
                    "tag": { "class_type": "Note", "inputs": { "weight": base_weight } },
                }),
                inputs,
                outputs,
                cost,
                base_weight,
            })
            .await
            .unwrap()
    }

    /// Import a scripted node and wait until it is `Online`.
    pub async fn node(&self, name: &str) -> (Node, Arc<ScriptedNode>) {
        let node = self
            .scheduler
            .registry()
            .import_node(CreateNode {
                name: name.to_string(),
                host: format!("http://{name}:8188"),
                auth: NodeAuth::None,
            })
            .await
            .unwrap();
        let scripted = self.connector.node(node.id).unwrap();
        wait_for_node(self.scheduler.registry().pool(), node.id, NodeStatus::Online).await;
        (node, scripted)
    }
}

pub async fn wait_for_task(store: &MemoryStore, task_id: DbId, status: TaskStatus) -> Task {
    for _ in 0..WAIT_STEPS {
        if let Some(task) = store.find_task(task_id).await.unwrap() {
            if task.status() == Some(status) {
                return task;
            }
        }
        tokio::time::sleep(WAIT_STEP).await;
    }
    let task = store.find_task(task_id).await.unwrap();
    panic!("task {task_id} never reached {status}: {task:?}");
}

pub async fn wait_for_node(pool: &WorkerPool, node_id: DbId, status: NodeStatus) {
    for _ in 0..WAIT_STEPS {
        if pool.status(node_id) == Some(status) {
            return;
        }
        tokio::time::sleep(WAIT_STEP).await;
    }
    panic!(
        "node {node_id} never reached {status}, is {:?}",
        pool.status(node_id)
    );
}

pub async fn wait_for_waiters(pool: &WorkerPool, count: usize) {
    for _ in 0..WAIT_STEPS {
        if pool.waiting() == count {
            return;
        }
        tokio::time::sleep(WAIT_STEP).await;
    }
    panic!("expected {count} waiting jobs, saw {}", pool.waiting());
}

pub fn png(width: u32, height: u32) -> Vec<u8> {
    let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, image::Rgb([10, 200, 30])));
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, ImageFormat::Png).unwrap();
    buf.into_inner()
}
