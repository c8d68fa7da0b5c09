//! The dispatch loop.
//!
//! Claims queued tasks in `(weight, created_at)` order and spawns one job
//! per task. The loop never awaits a job; jobs wait for a node in the
//! [`WorkerPool`](crate::pool::WorkerPool), which serves them in the same
//! order. Empty polls back off with jitter up to a cap.

use std::sync::Arc;
use std::time::Duration;

use fleet_core::backoff::{Backoff, BackoffConfig};
use fleet_db::TaskStore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::SchedulerError;
use crate::runner::JobRunner;

pub struct Dispatcher {
    store: Arc<dyn TaskStore>,
    runner: Arc<JobRunner>,
    batch_size: i64,
    idle_backoff: BackoffConfig,
    jobs: TaskTracker,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn TaskStore>,
        runner: Arc<JobRunner>,
        batch_size: i64,
        idle_backoff: BackoffConfig,
    ) -> Self {
        Self {
            store,
            runner,
            batch_size,
            idle_backoff,
            jobs: TaskTracker::new(),
        }
    }

    /// Run the loop until the cancellation token is triggered.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut backoff = Backoff::new(self.idle_backoff);
        tracing::info!(
            batch_size = self.batch_size,
            idle_max_ms = self.idle_backoff.max_delay.as_millis() as u64,
            "Dispatch loop started",
        );

        loop {
            if cancel.is_cancelled() {
                break;
            }
            let delay = match self.dispatch_once().await {
                Ok(0) => backoff.next(),
                Ok(_) => {
                    backoff.reset();
                    Duration::ZERO
                }
                Err(e) => {
                    tracing::error!(error = %e, "Dispatch cycle failed");
                    backoff.next()
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        tracing::info!("Dispatch loop shutting down");
    }

    /// One iteration: claim a batch and spawn its jobs. Returns the number
    /// of tasks claimed.
    pub async fn dispatch_once(&self) -> Result<usize, SchedulerError> {
        let claimed = self.store.claim_queued(self.batch_size).await?;
        let count = claimed.len();

        for task in claimed {
            tracing::debug!(task_id = task.id, weight = task.weight, "Task claimed");
            let runner = Arc::clone(&self.runner);
            self.jobs.spawn(async move {
                runner.run(task).await;
            });
        }
        Ok(count)
    }

    /// Jobs spawned and not yet finished.
    pub fn in_flight(&self) -> usize {
        self.jobs.len()
    }

    /// Wait up to `timeout` for in-flight jobs. Returns false on timeout.
    pub async fn drain(&self, timeout: Duration) -> bool {
        self.jobs.close();
        tokio::time::timeout(timeout, self.jobs.wait()).await.is_ok()
    }
}
