//! The task store
//!
//! Holds every [`TaskRecord`] in memory and writes the full set back to disk
//! after each mutation. Each mutation takes the file lock, reloads the file,
//! applies its change and saves, so several handles (the scheduler and the
//! CLI, say) can share one queue file without losing each other's updates.
//! If a write fails the in-memory change is rolled back, so memory never runs
//! ahead of the file.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::filter::TaskFilter;
use crate::graph::DependencyReport;
use crate::now_ms;
use crate::persist;
use crate::record::{Capabilities, DEFAULT_MAX_RETRIES, NewTask, TaskRecord, TaskStatus};
use crate::stats::QueueStatistics;

/// File name used inside the store directory
pub const DEFAULT_QUEUE_FILE: &str = "task_queue.json";

/// Store tunables
#[derive(Debug, Clone, PartialEq)]
pub struct StoreConfig {
    /// `max_retries` for tasks added without one
    pub default_max_retries: u32,

    /// Pending tasks older than this count as stale in statistics
    pub stale_pending_after: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            default_max_retries: DEFAULT_MAX_RETRIES,
            stale_pending_after: Duration::from_secs(60 * 60),
        }
    }
}

/// Previous versions of touched records, restored if a save fails
type Undo = Vec<(String, Option<TaskRecord>)>;

/// Persistent task store
pub struct Store {
    path: PathBuf,
    tasks: BTreeMap<String, TaskRecord>,
    next_seq: u64,
    config: StoreConfig,
    read_only: bool,
}

impl Store {
    /// Open (or create) the store in `dir` with default settings
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::open_with(dir.as_ref().join(DEFAULT_QUEUE_FILE), StoreConfig::default())
    }

    /// Open (or create) the store backed by the queue file at `path`.
    ///
    /// Other handles may have the same file open; an unreadable file fails
    /// here rather than being silently discarded.
    pub fn open_with(path: impl Into<PathBuf>, config: StoreConfig) -> Result<Self, StoreError> {
        let path = path.into();
        debug!(path = %path.display(), ?config, "Store::open_with: called");
        let tasks = {
            let _guard = persist::lock(&path, persist::LOCK_TIMEOUT)?;
            persist::load(&path)?
        };
        let next_seq = next_seq(&tasks);

        info!(path = %path.display(), count = tasks.len(), "Opened task store");
        Ok(Self {
            path,
            tasks,
            next_seq,
            config,
            read_only: false,
        })
    }

    /// Load a snapshot without taking the lock. All mutations fail with
    /// [`StoreError::ReadOnly`].
    pub fn open_read_only(path: impl Into<PathBuf>, config: StoreConfig) -> Result<Self, StoreError> {
        let path = path.into();
        debug!(path = %path.display(), "Store::open_read_only: called");
        let tasks = persist::load(&path)?;
        let next_seq = next_seq(&tasks);
        Ok(Self {
            path,
            tasks,
            next_seq,
            config,
            read_only: true,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Re-read the queue file, picking up changes made through other handles.
    ///
    /// Mutations do this on their own; reads serve the last loaded view.
    pub fn refresh(&mut self) -> Result<(), StoreError> {
        debug!(path = %self.path.display(), "Store::refresh: called");
        let tasks = persist::load(&self.path)?;
        self.next_seq = self.next_seq.max(next_seq(&tasks));
        self.tasks = tasks;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Create a Pending record and return its id.
    ///
    /// Dependencies are not checked; an unknown id leaves the task ineligible.
    pub fn add(&mut self, task: NewTask) -> Result<String, StoreError> {
        debug!(task_type = %task.task_type, owner = %task.owner, priority = %task.priority, "Store::add: called");
        let _guard = self.begin_mutation()?;

        let id = generate_task_id();
        let record = TaskRecord::from_new(task, id.clone(), self.next_seq, now_ms(), self.config.default_max_retries);
        self.next_seq += 1;
        let previous = self.tasks.insert(id.clone(), record);
        self.commit(vec![(id.clone(), previous)])?;

        info!(task_id = %id, "Task added");
        Ok(id)
    }

    pub fn get(&self, id: &str) -> Option<TaskRecord> {
        self.tasks.get(id).cloned()
    }

    /// Claim the best eligible task for a worker with `capabilities`.
    ///
    /// Candidates are Pending records of an allowed type whose dependencies
    /// are all Completed. The highest priority wins, then the oldest. The
    /// winner is moved to Queued before it is returned, in the same `&mut self`
    /// call; a Queued record is already claimed and is never a candidate, so
    /// two callers can never receive the same task.
    pub fn next_eligible(&mut self, capabilities: &Capabilities) -> Result<Option<TaskRecord>, StoreError> {
        debug!(?capabilities, "Store::next_eligible: called");
        let _guard = self.begin_mutation()?;

        let winner = self
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
            .filter(|t| capabilities.allows(&t.task_type))
            .filter(|t| self.dependencies_met(t))
            .min_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then_with(|| a.created_at.cmp(&b.created_at))
                    .then_with(|| a.seq.cmp(&b.seq))
            })
            .map(|t| t.id.clone());

        let Some(id) = winner else {
            debug!("Store::next_eligible: no eligible task");
            return Ok(None);
        };

        let mut undo = Undo::new();
        if let Some(record) = self.tasks.get_mut(&id) {
            undo.push((id.clone(), Some(record.clone())));
            record.status = TaskStatus::Queued;
        }
        self.commit(undo)?;

        debug!(task_id = %id, "Store::next_eligible: claimed");
        Ok(self.get(&id))
    }

    /// Apply a status change plus optional progress and error message.
    ///
    /// Returns `false` for unknown ids and for transitions out of a terminal
    /// status. Repeating the terminal status a task already has returns `true`
    /// and leaves the record untouched. Progress is clamped to [0, 100] and
    /// never moves backwards while the task stays Running.
    pub fn update_status(
        &mut self,
        id: &str,
        status: TaskStatus,
        progress: Option<f64>,
        error: Option<String>,
    ) -> Result<bool, StoreError> {
        debug!(%id, %status, ?progress, ?error, "Store::update_status: called");
        let _guard = self.begin_mutation()?;

        let Some(record) = self.tasks.get_mut(id) else {
            debug!(%id, "Store::update_status: unknown id");
            return Ok(false);
        };
        if !record.status.can_transition_to(status) {
            warn!(task_id = %id, from = %record.status, to = %status, "Rejected status transition");
            return Ok(false);
        }
        if record.status == status && status.is_terminal() {
            debug!(%id, %status, "Store::update_status: already terminal, nothing to change");
            return Ok(true);
        }

        let undo = vec![(id.to_string(), Some(record.clone()))];
        apply_status(record, status, progress, error, now_ms());
        self.commit(undo)?;
        Ok(true)
    }

    /// Cancel a non-terminal task.
    ///
    /// Advisory only: a worker already running the task is not interrupted, but
    /// its later outcome report is refused and the task is never dispatched again.
    pub fn cancel(&mut self, id: &str) -> Result<bool, StoreError> {
        debug!(%id, "Store::cancel: called");
        let _guard = self.begin_mutation()?;

        let Some(record) = self.tasks.get_mut(id) else {
            return Ok(false);
        };
        if record.is_terminal() {
            debug!(%id, status = %record.status, "Store::cancel: already terminal");
            return Ok(false);
        }

        let undo = vec![(id.to_string(), Some(record.clone()))];
        apply_status(record, TaskStatus::Cancelled, None, None, now_ms());
        self.commit(undo)?;

        info!(task_id = %id, "Task cancelled");
        Ok(true)
    }

    /// Reset a Failed task with retries left back to Pending
    pub fn retry(&mut self, id: &str) -> Result<bool, StoreError> {
        debug!(%id, "Store::retry: called");
        let _guard = self.begin_mutation()?;

        let Some(record) = self.tasks.get_mut(id) else {
            return Ok(false);
        };
        if !record.can_retry() {
            debug!(%id, status = %record.status, retry_count = record.retry_count, "Store::retry: not retryable");
            return Ok(false);
        }

        let undo = vec![(id.to_string(), Some(record.clone()))];
        record.status = TaskStatus::Pending;
        record.retry_count += 1;
        reset_run_state(record);
        record.completed_at = None;
        record.actual_duration_ms = None;
        record.error_message = None;
        self.commit(undo)?;

        info!(task_id = %id, retry_count = self.tasks[id].retry_count, "Task retried");
        Ok(true)
    }

    /// Put a Queued or Running task back to Pending without spending a retry.
    ///
    /// Used to reconcile tasks that were in flight when a process died.
    pub fn requeue(&mut self, id: &str) -> Result<bool, StoreError> {
        debug!(%id, "Store::requeue: called");
        let _guard = self.begin_mutation()?;

        let Some(record) = self.tasks.get_mut(id) else {
            return Ok(false);
        };
        if !matches!(record.status, TaskStatus::Queued | TaskStatus::Running) {
            return Ok(false);
        }

        let undo = vec![(id.to_string(), Some(record.clone()))];
        record.status = TaskStatus::Pending;
        reset_run_state(record);
        self.commit(undo)?;
        Ok(true)
    }

    /// Records matching `filter`, newest first
    pub fn list(&self, filter: &TaskFilter) -> Vec<TaskRecord> {
        debug!(?filter, "Store::list: called");
        let mut tasks: Vec<TaskRecord> = self.tasks.values().filter(|t| filter.matches(t)).cloned().collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.seq.cmp(&a.seq)));
        tasks
    }

    pub fn statistics(&self) -> QueueStatistics {
        debug!("Store::statistics: called");
        QueueStatistics::compute(&self.tasks, now_ms(), self.config.stale_pending_after)
    }

    /// Delete records in one of the given terminal `statuses` that finished
    /// more than `age` ago. Non-terminal statuses in the list are ignored.
    pub fn purge_older_than(&mut self, statuses: &[TaskStatus], age: Duration) -> Result<usize, StoreError> {
        debug!(?statuses, ?age, "Store::purge_older_than: called");
        let _guard = self.begin_mutation()?;

        let age_ms = i64::try_from(age.as_millis()).unwrap_or(i64::MAX);
        let cutoff = now_ms().saturating_sub(age_ms);
        let doomed: Vec<String> = self
            .tasks
            .values()
            .filter(|t| t.is_terminal() && statuses.contains(&t.status))
            .filter(|t| t.completed_at.is_some_and(|c| c < cutoff))
            .map(|t| t.id.clone())
            .collect();

        if doomed.is_empty() {
            return Ok(0);
        }

        let undo: Undo = doomed.iter().map(|id| (id.clone(), self.tasks.remove(id))).collect();
        self.commit(undo)?;

        info!(count = doomed.len(), "Purged old tasks");
        Ok(doomed.len())
    }

    /// Rough wait before a Pending task starts.
    ///
    /// Sums the estimates of queued work ahead of it (higher priority, or same
    /// priority and older) plus what remains of running work ahead of it.
    pub fn estimate_queue_time(&self, id: &str) -> Duration {
        debug!(%id, "Store::estimate_queue_time: called");
        let Some(task) = self.tasks.get(id) else {
            return Duration::ZERO;
        };
        if task.status != TaskStatus::Pending {
            return Duration::ZERO;
        }

        let now = now_ms();
        let ahead_ms: u64 = self
            .tasks
            .values()
            .filter(|t| t.id != task.id)
            .filter(|t| matches!(t.status, TaskStatus::Pending | TaskStatus::Queued | TaskStatus::Running))
            .filter(|t| {
                t.priority > task.priority
                    || (t.priority == task.priority && (t.created_at, t.seq) < (task.created_at, task.seq))
            })
            .map(|t| match (t.status, t.started_at) {
                (TaskStatus::Running, Some(started)) => {
                    let elapsed = (now - started).max(0) as u64;
                    t.estimated_duration_ms.saturating_sub(elapsed)
                }
                _ => t.estimated_duration_ms,
            })
            .sum();

        Duration::from_millis(ahead_ms)
    }

    pub fn validate_dependencies(&self) -> DependencyReport {
        DependencyReport::build(&self.tasks)
    }

    fn dependencies_met(&self, task: &TaskRecord) -> bool {
        task.dependencies
            .iter()
            .all(|dep| self.tasks.get(dep).is_some_and(|d| d.status == TaskStatus::Completed))
    }

    /// Lock the queue file and reload it. The lock is held until the
    /// returned guard is dropped.
    fn begin_mutation(&mut self) -> Result<File, StoreError> {
        if self.is_read_only() {
            return Err(StoreError::ReadOnly);
        }
        let guard = persist::lock(&self.path, persist::LOCK_TIMEOUT)?;
        self.refresh()?;
        Ok(guard)
    }

    /// Persist, or restore the touched records and return the error
    fn commit(&mut self, undo: Undo) -> Result<(), StoreError> {
        if let Err(e) = persist::save(&self.path, &self.tasks) {
            warn!(error = %e, "Failed to persist task store, rolling back");
            for (id, previous) in undo {
                match previous {
                    Some(record) => {
                        self.tasks.insert(id, record);
                    }
                    None => {
                        self.tasks.remove(&id);
                    }
                }
            }
            return Err(e);
        }
        Ok(())
    }
}

fn apply_status(record: &mut TaskRecord, status: TaskStatus, progress: Option<f64>, error: Option<String>, now: i64) {
    if let Some(p) = progress.filter(|p| !p.is_nan()) {
        let clamped = p.clamp(0.0, 100.0);
        record.progress_percentage = if record.status == TaskStatus::Running && status == TaskStatus::Running {
            record.progress_percentage.max(clamped)
        } else {
            clamped
        };
    }
    if let Some(message) = error {
        record.error_message = Some(message);
    }

    if status == TaskStatus::Running && record.started_at.is_none() {
        record.started_at = Some(now);
    }
    if status.is_terminal() && record.completed_at.is_none() {
        record.completed_at = Some(now);
        record.actual_duration_ms = Some(record.started_at.map(|s| (now - s).max(0) as u64).unwrap_or(0));
    }
    record.status = status;
}

fn next_seq(tasks: &BTreeMap<String, TaskRecord>) -> u64 {
    tasks.values().map(|t| t.seq + 1).max().unwrap_or(0)
}

fn reset_run_state(record: &mut TaskRecord) {
    record.started_at = None;
    record.progress_percentage = 0.0;
}

fn generate_task_id() -> String {
    uuid::Uuid::now_v7().to_string()
}
