//! Start-up crash recovery.
//!
//! Runs once before the dispatch loop starts. Both steps are idempotent:
//! a second run finds nothing to requeue or purge.

use fleet_db::TaskStore;
use serde::Serialize;

use crate::error::SchedulerError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// `Pending`/`Running` tasks put back to `Queuing`.
    pub requeued: u64,
    /// `Success` tasks that expected files but have no attachments.
    pub purged: u64,
}

pub async fn recover(store: &dyn TaskStore) -> Result<RecoveryReport, SchedulerError> {
    let requeued = store.requeue_interrupted().await?;
    let purged = store.purge_outputless_successes().await?;

    if requeued > 0 || purged > 0 {
        tracing::info!(requeued, purged, "Recovered tasks from previous run");
    } else {
        tracing::debug!("Nothing to recover");
    }
    Ok(RecoveryReport { requeued, purged })
}
