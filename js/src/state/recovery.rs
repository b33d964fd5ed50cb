//! Crash recovery
//!
//! A task found in `Running` when the process starts was interrupted by a crash
//! or kill; no worker owns it any more. A task found in `Queued` was claimed but
//! never started. Both are reconciled here before the scheduler starts.

use serde::{Deserialize, Serialize};
use taskqueue::{TaskFilter, TaskStatus};
use tracing::{debug, info, warn};

use super::StateManager;

/// Error message recorded on tasks failed by recovery
pub const INTERRUPTED_MESSAGE: &str = "interrupted by restart";

/// What to do with tasks left `Running` by a previous process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryPolicy {
    /// Mark Failed, so a bounded retry is still possible
    #[default]
    Fail,
    /// Put back to Pending without spending a retry
    Requeue,
    /// Leave them Running
    Leave,
}

impl std::str::FromStr for RecoveryPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "fail" => Ok(Self::Fail),
            "requeue" => Ok(Self::Requeue),
            "leave" => Ok(Self::Leave),
            _ => Err(format!("Unknown recovery policy: {}. Use: fail, requeue, or leave", s)),
        }
    }
}

/// Recovery statistics
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct RecoveryStats {
    /// Running tasks marked Failed
    pub failed: usize,
    /// Running or Queued tasks put back to Pending
    pub requeued: usize,
    /// Running tasks left untouched
    pub left_running: usize,
}

impl RecoveryStats {
    pub fn total(&self) -> usize {
        self.failed + self.requeued + self.left_running
    }
}

impl std::fmt::Display for RecoveryStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "failed: {}, requeued: {}, left running: {}",
            self.failed, self.requeued, self.left_running
        )
    }
}

/// Reconcile tasks left in flight by a previous process.
///
/// Queued tasks always go back to Pending (they never started). Running tasks
/// follow `policy`.
pub async fn recover(state: &StateManager, policy: RecoveryPolicy) -> eyre::Result<RecoveryStats> {
    debug!(?policy, "recover: called");
    let mut stats = RecoveryStats::default();

    let queued = state
        .list_tasks(TaskFilter::new().status(TaskStatus::Queued))
        .await
        .map_err(|e| eyre::eyre!("Failed to list queued tasks: {}", e))?;
    for task in queued {
        debug!(task_id = %task.id, "recover: releasing unstarted claim");
        if state.requeue_task(&task.id).await? {
            stats.requeued += 1;
        }
    }

    let running = state
        .list_tasks(TaskFilter::new().status(TaskStatus::Running))
        .await
        .map_err(|e| eyre::eyre!("Failed to list running tasks: {}", e))?;
    for task in running {
        match policy {
            RecoveryPolicy::Fail => {
                warn!(task_id = %task.id, task_type = %task.task_type, "Marking interrupted task as failed");
                let failed = state
                    .update_status(&task.id, TaskStatus::Failed, None, Some(INTERRUPTED_MESSAGE.to_string()))
                    .await?;
                if failed {
                    stats.failed += 1;
                }
            }
            RecoveryPolicy::Requeue => {
                warn!(task_id = %task.id, task_type = %task.task_type, "Requeueing interrupted task");
                if state.requeue_task(&task.id).await? {
                    stats.requeued += 1;
                }
            }
            RecoveryPolicy::Leave => {
                debug!(task_id = %task.id, "recover: leaving task running");
                stats.left_running += 1;
            }
        }
    }

    if stats.total() > 0 {
        info!("Recovery reconciled in-flight tasks: {}", stats);
    } else {
        debug!("Recovery found no in-flight tasks");
    }
    Ok(stats)
}
