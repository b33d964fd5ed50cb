//! Aggregate queue statistics

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;

use crate::graph::blocked_tasks;
use crate::priority::Priority;
use crate::record::{TaskRecord, TaskStatus};

/// Snapshot of queue composition and outcomes
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueueStatistics {
    pub total: usize,
    pub by_status: BTreeMap<TaskStatus, usize>,
    pub by_type: BTreeMap<String, usize>,
    pub by_priority: BTreeMap<Priority, usize>,

    /// completed / (completed + failed), 0.0 when nothing has finished
    pub success_rate: f64,

    /// Mean `actual_duration_ms` over completed tasks
    pub average_duration_ms: f64,

    /// Mean time from creation to first start over started tasks
    pub average_wait_ms: f64,

    /// Pending tasks older than the store's stale threshold
    pub stale_pending: usize,

    /// Tasks awaiting dispatch whose dependencies can never complete
    pub blocked: usize,
}

impl QueueStatistics {
    pub(crate) fn compute(tasks: &BTreeMap<String, TaskRecord>, now: i64, stale_after: Duration) -> Self {
        let stale_ms = i64::try_from(stale_after.as_millis()).unwrap_or(i64::MAX);
        let stale_cutoff = now.saturating_sub(stale_ms);
        let mut stats = Self::default();
        let mut durations = Vec::new();
        let mut waits = Vec::new();

        for task in tasks.values() {
            stats.total += 1;
            *stats.by_status.entry(task.status).or_default() += 1;
            *stats.by_type.entry(task.task_type.clone()).or_default() += 1;
            *stats.by_priority.entry(task.priority).or_default() += 1;

            if task.status == TaskStatus::Completed
                && let Some(d) = task.actual_duration_ms
            {
                durations.push(d as f64);
            }
            if let Some(w) = task.wait_ms() {
                waits.push(w as f64);
            }
            if task.status == TaskStatus::Pending && task.created_at < stale_cutoff {
                stats.stale_pending += 1;
            }
        }

        let completed = stats.count(TaskStatus::Completed);
        let finished = completed + stats.count(TaskStatus::Failed);
        if finished > 0 {
            stats.success_rate = completed as f64 / finished as f64;
        }
        stats.average_duration_ms = mean(&durations);
        stats.average_wait_ms = mean(&waits);
        stats.blocked = blocked_tasks(tasks).len();
        stats
    }

    pub fn count(&self, status: TaskStatus) -> usize {
        self.by_status.get(&status).copied().unwrap_or(0)
    }

    /// Pending plus Queued
    pub fn awaiting_dispatch(&self) -> usize {
        self.count(TaskStatus::Pending) + self.count(TaskStatus::Queued)
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}
