//! JobScheduler - worker pool and control loop
//!
//! The control loop periodically samples host resources, keeps the pool at its
//! target size and reaps workers that have stopped. Workers pull their own work
//! (see [`super::worker`]); the control loop never dispatches tasks directly,
//! it only opens and closes the resource gate the workers check before claiming.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use taskqueue::Capabilities;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::handler::{HandlerRegistry, TaskHandler};
use crate::resources::{ResourceProbe, ResourceSnapshot};
use crate::state::{StateError, StateManager};

use super::config::SchedulerConfig;
use super::stats::SchedulerStatistics;
use super::worker::{WorkerRecord, WorkerSlot, WorkerStatus, worker_loop};

/// State shared between the scheduler handle, its control loop and workers
pub(crate) struct Shared {
    pub(crate) config: SchedulerConfig,
    pub(crate) state: StateManager,
    probe: Arc<dyn ResourceProbe>,
    handlers: RwLock<HandlerRegistry>,
    /// Keyed by creation sequence so snapshots come out in start order
    workers: Mutex<BTreeMap<u64, WorkerSlot>>,
    next_worker: AtomicU64,
    gate_open: AtomicBool,
    running: AtomicBool,
    tasks_completed: AtomicU64,
    tasks_failed: AtomicU64,
    resources: Mutex<ResourceSnapshot>,
    shutdown: watch::Sender<bool>,
}

impl Shared {
    fn workers(&self) -> MutexGuard<'_, BTreeMap<u64, WorkerSlot>> {
        self.workers.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn with_worker<R>(&self, seq: u64, f: impl FnOnce(&WorkerRecord) -> R) -> Option<R> {
        self.workers().get(&seq).map(|slot| f(&slot.record))
    }

    pub(crate) fn update_worker(&self, seq: u64, f: impl FnOnce(&mut WorkerRecord)) {
        if let Some(slot) = self.workers().get_mut(&seq) {
            f(&mut slot.record);
        }
    }

    pub(crate) fn worker_status(&self, seq: u64) -> Option<WorkerStatus> {
        self.with_worker(seq, |w| w.status)
    }

    pub(crate) fn count_outcome(&self, seq: u64, success: bool) {
        let counter = if success {
            &self.tasks_completed
        } else {
            &self.tasks_failed
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.update_worker(seq, |w| {
            if success {
                w.tasks_completed += 1;
            } else {
                w.tasks_failed += 1;
            }
        });
    }

    pub(crate) fn handler(&self, task_type: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.read().unwrap_or_else(|e| e.into_inner()).get(task_type)
    }

    pub(crate) fn gate_open(&self) -> bool {
        self.gate_open.load(Ordering::Acquire)
    }

    pub(crate) fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    fn resources(&self) -> ResourceSnapshot {
        *self.resources.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Worker-pool scheduler over a shared [`StateManager`]
pub struct JobScheduler {
    shared: Arc<Shared>,
    control: Mutex<Option<JoinHandle<()>>>,
}

impl JobScheduler {
    /// Create a scheduler with the built-in handlers registered
    pub fn new(config: SchedulerConfig, state: StateManager, probe: Arc<dyn ResourceProbe>) -> Self {
        debug!(?config, "JobScheduler::new: called");
        let (shutdown, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                config,
                state,
                probe,
                handlers: RwLock::new(HandlerRegistry::with_builtins()),
                workers: Mutex::new(BTreeMap::new()),
                next_worker: AtomicU64::new(0),
                gate_open: AtomicBool::new(true),
                running: AtomicBool::new(false),
                tasks_completed: AtomicU64::new(0),
                tasks_failed: AtomicU64::new(0),
                resources: Mutex::new(ResourceSnapshot::default()),
                shutdown,
            }),
            control: Mutex::new(None),
        }
    }

    /// Associate `task_type` with `handler`, replacing any previous handler.
    ///
    /// Workers take their capabilities from the registry when they start, so
    /// register before [`start`](Self::start).
    pub fn register_handler(&self, task_type: impl Into<String>, handler: impl TaskHandler + 'static) {
        let task_type = task_type.into();
        if self.is_running() {
            warn!(%task_type, "Handler registered while running; existing workers will not pick it up");
        }
        self.shared
            .handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .register(task_type, handler);
    }

    /// Registered task types, sorted
    pub fn task_types(&self) -> Vec<String> {
        self.shared
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .task_types()
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    pub fn state(&self) -> &StateManager {
        &self.shared.state
    }

    /// Start the control loop, growing the pool toward `target_workers`.
    /// Does nothing if already running.
    pub fn start(&self, target_workers: usize) {
        debug!(target_workers, "JobScheduler::start: called");
        if self.shared.running.swap(true, Ordering::AcqRel) {
            debug!("JobScheduler::start: already running");
            return;
        }

        self.shared.shutdown.send_replace(false);
        self.shared.gate_open.store(true, Ordering::Release);
        let handle = tokio::spawn(control_loop(Arc::clone(&self.shared), target_workers));
        *self.control.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);

        info!(target_workers, "Scheduler started");
    }

    /// Stop the control loop and every worker after its current task.
    ///
    /// Waits up to the configured shutdown timeout, then aborts whatever is
    /// left. Tasks interrupted that way stay Running until recovery runs.
    pub async fn stop(&self) {
        debug!("JobScheduler::stop: called");
        if !self.shared.running.swap(false, Ordering::AcqRel) {
            debug!("JobScheduler::stop: not running");
            return;
        }
        info!("Scheduler stopping");
        self.shared.shutdown.send_replace(true);

        let control = self.control.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(control) = control {
            let _ = control.await;
        }

        let handles: Vec<JoinHandle<()>> = {
            let mut workers = self.shared.workers();
            workers
                .values_mut()
                .filter_map(|slot| {
                    slot.record.status = WorkerStatus::Stopped;
                    slot.handle.take()
                })
                .collect()
        };

        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
        let timeout = self.shared.config.shutdown_timeout();
        if tokio::time::timeout(timeout, futures::future::join_all(handles))
            .await
            .is_err()
        {
            warn!(?timeout, "Workers still busy after shutdown timeout, aborting");
            for abort in aborts {
                abort.abort();
            }
        }

        self.shared.workers().clear();
        info!("Scheduler stopped");
    }

    /// Snapshot of every worker, in start order
    pub fn worker_status(&self) -> Vec<WorkerRecord> {
        self.shared
            .workers()
            .values()
            .map(|slot| slot.record.clone())
            .collect()
    }

    pub async fn statistics(&self) -> Result<SchedulerStatistics, StateError> {
        debug!("JobScheduler::statistics: called");
        let workers = self.worker_status();
        let count = |status: WorkerStatus| workers.iter().filter(|w| w.status == status).count();

        Ok(SchedulerStatistics {
            running: self.is_running(),
            total_workers: workers.len(),
            active_workers: workers.iter().filter(|w| w.is_active()).count(),
            busy_workers: count(WorkerStatus::Busy),
            idle_workers: count(WorkerStatus::Idle),
            stopped_workers: count(WorkerStatus::Stopped),
            error_workers: count(WorkerStatus::Error),
            tasks_completed: self.shared.tasks_completed.load(Ordering::Relaxed),
            tasks_failed: self.shared.tasks_failed.load(Ordering::Relaxed),
            resources: self.shared.resources(),
            gate_open: self.shared.gate_open(),
            queue: self.shared.state.statistics().await?,
        })
    }
}

async fn control_loop(shared: Arc<Shared>, target_workers: usize) {
    debug!(target_workers, "control_loop: called");
    let mut shutdown = shared.shutdown_receiver();

    loop {
        if *shutdown.borrow() {
            break;
        }

        let delay = if check_resources(&shared).await {
            cleanup_workers(&shared);
            ensure_pool(&shared, target_workers);
            shared.config.poll_interval()
        } else {
            shared.config.overload_backoff()
        };

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => {}
        }
    }

    debug!("control_loop: exiting");
}

/// Sample the probe and open or close the gate. A probe error counts as headroom.
async fn check_resources(shared: &Shared) -> bool {
    let snapshot = match shared.probe.sample().await {
        Ok(snapshot) => snapshot,
        Err(e) => {
            debug!(error = %e, "check_resources: probe failed, assuming headroom");
            shared.gate_open.store(true, Ordering::Release);
            return true;
        }
    };
    *shared.resources.lock().unwrap_or_else(|e| e.into_inner()) = snapshot;

    match shared.config.limits().exceeded(&snapshot) {
        Some(reason) => {
            if shared.gate_open.swap(false, Ordering::AcqRel) {
                warn!(%reason, "Resource ceiling exceeded, deferring new work");
            }
            false
        }
        None => {
            if !shared.gate_open.swap(true, Ordering::AcqRel) {
                info!("Resources back under ceiling, resuming");
            }
            true
        }
    }
}

fn ensure_pool(shared: &Arc<Shared>, target_workers: usize) {
    let mut workers = shared.workers();
    let active = workers.values().filter(|slot| slot.record.is_active()).count();
    if active >= target_workers {
        return;
    }

    let capabilities = Capabilities::only(shared.handlers.read().unwrap_or_else(|e| e.into_inner()).task_types());
    for _ in active..target_workers {
        let seq = shared.next_worker.fetch_add(1, Ordering::Relaxed);
        let id = format!("worker-{seq}");
        debug!(worker_id = %id, "ensure_pool: starting worker");
        workers.insert(
            seq,
            WorkerSlot {
                record: WorkerRecord::new(id, capabilities.clone()),
                handle: None,
            },
        );
        let handle = tokio::spawn(worker_loop(Arc::clone(shared), seq));
        if let Some(slot) = workers.get_mut(&seq) {
            slot.handle = Some(handle);
        }
    }
    info!(active, target_workers, "Worker pool grown");
}

fn cleanup_workers(shared: &Shared) {
    let mut workers = shared.workers();
    for slot in workers.values_mut() {
        let exited = slot.handle.as_ref().is_some_and(|h| h.is_finished());
        if exited && slot.record.is_active() {
            warn!(worker_id = %slot.record.id, "Worker exited unexpectedly");
            slot.record.status = WorkerStatus::Stopped;
        }
    }
    let before = workers.len();
    workers.retain(|_, slot| !slot.is_finished());
    let removed = before - workers.len();
    if removed > 0 {
        info!(removed, "Cleaned up stopped workers");
    }
}
