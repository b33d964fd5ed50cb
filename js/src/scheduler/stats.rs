//! Scheduler statistics

use serde::Serialize;
use taskqueue::QueueStatistics;

use crate::resources::ResourceSnapshot;

/// Worker pool counts plus resource headroom and the queue's own statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SchedulerStatistics {
    pub running: bool,
    pub total_workers: usize,
    /// Workers not Stopped
    pub active_workers: usize,
    pub busy_workers: usize,
    pub idle_workers: usize,
    pub stopped_workers: usize,
    pub error_workers: usize,
    /// Outcomes recorded since this scheduler was created
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    /// Most recent probe sample
    pub resources: ResourceSnapshot,
    /// Whether the resource gate currently admits new work
    pub gate_open: bool,
    pub queue: QueueStatistics,
}
