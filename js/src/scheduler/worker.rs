//! Workers
//!
//! Each worker is a tokio task that claims eligible tasks through the
//! StateManager and runs them with the registered handler. Handlers run in
//! their own spawned task so a panic surfaces as a `JoinError` here instead of
//! unwinding through the worker.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use taskqueue::{Capabilities, TaskRecord, TaskStatus, now_ms};
use tokio::sync::{broadcast, watch};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, warn};

use crate::handler::ProgressReporter;
use crate::state::StateEvent;

use super::core::Shared;

/// Default failure message when a handler reports failure without one
pub const HANDLER_FAILED_MESSAGE: &str = "Task handler reported failure";

/// Worker lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Idle,
    Busy,
    Stopped,
    /// Last attempt to reach the store failed
    Error,
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Stopped => "stopped",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Snapshot of one worker; never persisted
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerRecord {
    pub id: String,
    pub status: WorkerStatus,
    pub capabilities: Capabilities,
    pub current_task: Option<String>,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    /// Unix milliseconds
    pub created_at: i64,
    /// Unix milliseconds
    pub last_activity: i64,
}

impl WorkerRecord {
    pub(crate) fn new(id: String, capabilities: Capabilities) -> Self {
        let now = now_ms();
        Self {
            id,
            status: WorkerStatus::Idle,
            capabilities,
            current_task: None,
            tasks_completed: 0,
            tasks_failed: 0,
            created_at: now,
            last_activity: now,
        }
    }

    /// Counted toward the pool target
    pub fn is_active(&self) -> bool {
        self.status != WorkerStatus::Stopped
    }

    fn touch(&mut self) {
        self.last_activity = now_ms();
    }
}

/// A worker's record plus the handle of its task
pub(crate) struct WorkerSlot {
    pub(crate) record: WorkerRecord,
    pub(crate) handle: Option<JoinHandle<()>>,
}

impl WorkerSlot {
    /// Stopped and its task has exited
    pub(crate) fn is_finished(&self) -> bool {
        self.record.status == WorkerStatus::Stopped && self.handle.as_ref().is_none_or(|h| h.is_finished())
    }
}

enum Outcome {
    Completed,
    Failed(String),
}

pub(crate) async fn worker_loop(shared: Arc<Shared>, seq: u64) {
    let Some((worker_id, capabilities)) = shared.with_worker(seq, |w| (w.id.clone(), w.capabilities.clone())) else {
        return;
    };
    debug!(%worker_id, ?capabilities, "worker_loop: called");
    info!(%worker_id, "Worker started");

    let mut shutdown = shared.shutdown_receiver();
    let mut events = shared.state.subscribe_events();

    loop {
        if *shutdown.borrow() {
            debug!(%worker_id, "worker_loop: shutdown observed");
            break;
        }
        if shared.worker_status(seq).is_none_or(|s| s == WorkerStatus::Stopped) {
            debug!(%worker_id, "worker_loop: worker marked stopped");
            break;
        }
        if !shared.gate_open() {
            debug!(%worker_id, "worker_loop: resource gate closed");
            idle_wait(&mut events, &mut shutdown, shared.config.idle_backoff()).await;
            continue;
        }

        match shared.state.next_eligible(capabilities.clone()).await {
            Ok(Some(task)) => {
                execute(&shared, seq, &worker_id, task).await;
            }
            Ok(None) => {
                shared.update_worker(seq, |w| {
                    if w.status == WorkerStatus::Error {
                        w.status = WorkerStatus::Idle;
                    }
                });
                idle_wait(&mut events, &mut shutdown, shared.config.idle_backoff()).await;
            }
            Err(e) => {
                error!(%worker_id, error = %e, "Worker failed to claim a task");
                shared.update_worker(seq, |w| {
                    if w.status != WorkerStatus::Stopped {
                        w.status = WorkerStatus::Error;
                    }
                    w.touch();
                });
                idle_wait(&mut events, &mut shutdown, shared.config.overload_backoff()).await;
            }
        }
    }

    shared.update_worker(seq, |w| {
        w.status = WorkerStatus::Stopped;
        w.current_task = None;
        w.touch();
    });
    info!(%worker_id, "Worker stopped");
}

/// Sleep until `delay` passes, new work is announced, or shutdown begins
async fn idle_wait(
    events: &mut broadcast::Receiver<StateEvent>,
    shutdown: &mut watch::Receiver<bool>,
    delay: Duration,
) {
    tokio::select! {
        _ = tokio::time::sleep(delay) => {}
        event = events.recv() => {
            debug!(?event, "idle_wait: woken by state event");
        }
        _ = shutdown.changed() => {}
    }
}

async fn execute(shared: &Shared, seq: u64, worker_id: &str, task: TaskRecord) {
    let task_id = task.id.clone();
    debug!(%worker_id, %task_id, task_type = %task.task_type, "execute: called");
    shared.update_worker(seq, |w| {
        if w.status != WorkerStatus::Stopped {
            w.status = WorkerStatus::Busy;
        }
        w.current_task = Some(task_id.clone());
        w.touch();
    });

    match shared.state.update_status(&task_id, TaskStatus::Running, None, None).await {
        Ok(true) => {
            info!(%worker_id, %task_id, task_type = %task.task_type, "Starting task");
            let outcome = run_handler(shared, task).await;
            record_outcome(shared, seq, worker_id, &task_id, outcome).await;
        }
        Ok(false) => {
            info!(%worker_id, %task_id, "Task no longer runnable, skipping");
        }
        Err(e) => {
            error!(%worker_id, %task_id, error = %e, "Failed to mark task running");
        }
    }

    shared.update_worker(seq, |w| {
        if w.status == WorkerStatus::Busy {
            w.status = WorkerStatus::Idle;
        }
        w.current_task = None;
        w.touch();
    });
}

async fn run_handler(shared: &Shared, task: TaskRecord) -> Outcome {
    let Some(handler) = shared.handler(&task.task_type) else {
        return Outcome::Failed(format!("No handler for task type: {}", task.task_type));
    };

    let progress = ProgressReporter::new(task.id.clone(), shared.state.clone());
    let join = tokio::spawn(async move { handler.run(task, progress).await }).await;

    match join {
        Ok(Ok(result)) if result.success => Outcome::Completed,
        Ok(Ok(result)) => Outcome::Failed(result.message.unwrap_or_else(|| HANDLER_FAILED_MESSAGE.to_string())),
        Ok(Err(e)) => Outcome::Failed(format!("{e:#}")),
        Err(e) => Outcome::Failed(panic_message(e)),
    }
}

async fn record_outcome(shared: &Shared, seq: u64, worker_id: &str, task_id: &str, outcome: Outcome) {
    let (status, progress, message) = match outcome {
        Outcome::Completed => {
            info!(%worker_id, %task_id, "Task completed");
            (TaskStatus::Completed, Some(100.0), None)
        }
        Outcome::Failed(message) => {
            warn!(%worker_id, %task_id, %message, "Task failed");
            (TaskStatus::Failed, None, Some(message))
        }
    };

    match shared.state.update_status(task_id, status, progress, message).await {
        Ok(true) => shared.count_outcome(seq, status == TaskStatus::Completed),
        Ok(false) => info!(%worker_id, %task_id, %status, "Outcome not recorded, task was cancelled"),
        Err(e) => error!(%worker_id, %task_id, error = %e, "Failed to record task outcome"),
    }
}

fn panic_message(err: JoinError) -> String {
    if err.is_cancelled() {
        return "Task handler was cancelled".to_string();
    }
    let payload = err.into_panic();
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("Task handler panicked: {detail}")
}
