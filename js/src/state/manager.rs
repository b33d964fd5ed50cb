//! StateManager - actor that owns the task Store
//!
//! Processes commands via channels so every store mutation, including the
//! select-and-claim step of `next_eligible`, runs one at a time. Other
//! processes (the `js` CLI) may write the same queue file; the store picks
//! their changes up on each mutation and the actor refreshes before reads.

use std::path::PathBuf;
use std::time::Duration;

use taskqueue::{
    Capabilities, DependencyReport, NewTask, QueueStatistics, Store, StoreConfig, TaskFilter, TaskRecord, TaskStatus,
};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use super::messages::{StateCommand, StateError, StateResponse};

/// Event broadcast when work may have become available
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateEvent {
    /// A new task was added
    TaskAdded { id: String, task_type: String },
    /// A task returned to Pending, or completed and may unblock dependents
    TaskReleased { id: String },
}

/// Handle to send commands to the StateManager
#[derive(Clone)]
pub struct StateManager {
    tx: mpsc::Sender<StateCommand>,
    /// Broadcast sender for state change notifications
    event_tx: broadcast::Sender<StateEvent>,
}

impl StateManager {
    /// Spawn the actor around an already opened store
    pub fn spawn(store: Store) -> Self {
        debug!(path = %store.path().display(), "spawn: called");
        let (tx, rx) = mpsc::channel(256);
        let (event_tx, _) = broadcast::channel(64);

        tokio::spawn(actor_loop(store, rx));

        info!("StateManager spawned");
        Self { tx, event_tx }
    }

    /// Open the store at `path` and spawn the actor
    pub fn open(path: impl Into<PathBuf>, config: StoreConfig) -> eyre::Result<Self> {
        let store = Store::open_with(path, config)?;
        Ok(Self::spawn(store))
    }

    /// Subscribe to state change events (workers use this for immediate pickup)
    pub fn subscribe_events(&self) -> broadcast::Receiver<StateEvent> {
        self.event_tx.subscribe()
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<StateResponse<T>>) -> StateCommand) -> StateResponse<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| StateError::ChannelError)?;
        reply_rx.await.map_err(|_| StateError::ChannelError)?
    }

    fn notify(&self, event: StateEvent) {
        // no subscribers is fine
        let _ = self.event_tx.send(event);
    }

    pub async fn add_task(&self, task: NewTask) -> StateResponse<String> {
        debug!(task_type = %task.task_type, owner = %task.owner, "add_task: called");
        let task_type = task.task_type.clone();
        let id = self.request(|reply| StateCommand::AddTask { task, reply }).await?;
        self.notify(StateEvent::TaskAdded {
            id: id.clone(),
            task_type,
        });
        Ok(id)
    }

    pub async fn get_task(&self, id: &str) -> StateResponse<Option<TaskRecord>> {
        debug!(%id, "get_task: called");
        let id = id.to_string();
        self.request(|reply| StateCommand::GetTask { id, reply }).await
    }

    /// Claim the best eligible task for `capabilities`, if any
    pub async fn next_eligible(&self, capabilities: Capabilities) -> StateResponse<Option<TaskRecord>> {
        debug!(?capabilities, "next_eligible: called");
        self.request(|reply| StateCommand::NextEligible { capabilities, reply })
            .await
    }

    pub async fn update_status(
        &self,
        id: &str,
        status: TaskStatus,
        progress: Option<f64>,
        error: Option<String>,
    ) -> StateResponse<bool> {
        debug!(%id, %status, ?progress, "update_status: called");
        let task_id = id.to_string();
        let applied = self
            .request(|reply| StateCommand::UpdateStatus {
                id: task_id,
                status,
                progress,
                error,
                reply,
            })
            .await?;
        if applied && status == TaskStatus::Completed {
            self.notify(StateEvent::TaskReleased { id: id.to_string() });
        }
        Ok(applied)
    }

    pub async fn cancel_task(&self, id: &str) -> StateResponse<bool> {
        debug!(%id, "cancel_task: called");
        let id = id.to_string();
        self.request(|reply| StateCommand::CancelTask { id, reply }).await
    }

    pub async fn retry_task(&self, id: &str) -> StateResponse<bool> {
        debug!(%id, "retry_task: called");
        let task_id = id.to_string();
        let retried = self
            .request(|reply| StateCommand::RetryTask { id: task_id, reply })
            .await?;
        if retried {
            self.notify(StateEvent::TaskReleased { id: id.to_string() });
        }
        Ok(retried)
    }

    pub async fn requeue_task(&self, id: &str) -> StateResponse<bool> {
        debug!(%id, "requeue_task: called");
        let task_id = id.to_string();
        let requeued = self
            .request(|reply| StateCommand::RequeueTask { id: task_id, reply })
            .await?;
        if requeued {
            self.notify(StateEvent::TaskReleased { id: id.to_string() });
        }
        Ok(requeued)
    }

    pub async fn list_tasks(&self, filter: TaskFilter) -> StateResponse<Vec<TaskRecord>> {
        debug!(?filter, "list_tasks: called");
        self.request(|reply| StateCommand::ListTasks { filter, reply }).await
    }

    pub async fn statistics(&self) -> StateResponse<QueueStatistics> {
        debug!("statistics: called");
        self.request(|reply| StateCommand::Statistics { reply }).await
    }

    pub async fn purge_older_than(&self, statuses: Vec<TaskStatus>, age: Duration) -> StateResponse<usize> {
        debug!(?statuses, ?age, "purge_older_than: called");
        self.request(|reply| StateCommand::PurgeOlderThan { statuses, age, reply })
            .await
    }

    pub async fn estimate_queue_time(&self, id: &str) -> StateResponse<Duration> {
        debug!(%id, "estimate_queue_time: called");
        let id = id.to_string();
        self.request(|reply| StateCommand::EstimateQueueTime { id, reply })
            .await
    }

    pub async fn validate_dependencies(&self) -> StateResponse<DependencyReport> {
        debug!("validate_dependencies: called");
        self.request(|reply| StateCommand::ValidateDependencies { reply })
            .await
    }

    /// Shutdown the StateManager
    pub async fn shutdown(&self) -> Result<(), StateError> {
        debug!("shutdown: called");
        self.tx
            .send(StateCommand::Shutdown)
            .await
            .map_err(|_| StateError::ChannelError)
    }
}

fn store_err(e: taskqueue::StoreError) -> StateError {
    StateError::StoreError(e.to_string())
}

/// Pick up external writes before answering a read; a failed reload serves
/// the last loaded view
fn refresh(store: &mut Store) {
    if let Err(e) = store.refresh() {
        warn!(error = %e, "Failed to reload task store, serving last view");
    }
}

async fn actor_loop(mut store: Store, mut rx: mpsc::Receiver<StateCommand>) {
    debug!("StateManager actor started");

    while let Some(cmd) = rx.recv().await {
        match cmd {
            StateCommand::AddTask { task, reply } => {
                debug!(task_type = %task.task_type, "actor_loop: AddTask command");
                let _ = reply.send(store.add(task).map_err(store_err));
            }

            StateCommand::GetTask { id, reply } => {
                debug!(%id, "actor_loop: GetTask command");
                refresh(&mut store);
                let _ = reply.send(Ok(store.get(&id)));
            }

            StateCommand::NextEligible { capabilities, reply } => {
                debug!("actor_loop: NextEligible command");
                let _ = reply.send(store.next_eligible(&capabilities).map_err(store_err));
            }

            StateCommand::UpdateStatus {
                id,
                status,
                progress,
                error,
                reply,
            } => {
                debug!(%id, %status, "actor_loop: UpdateStatus command");
                let result = store.update_status(&id, status, progress, error).map_err(store_err);
                let _ = reply.send(result);
            }

            StateCommand::CancelTask { id, reply } => {
                debug!(%id, "actor_loop: CancelTask command");
                let _ = reply.send(store.cancel(&id).map_err(store_err));
            }

            StateCommand::RetryTask { id, reply } => {
                debug!(%id, "actor_loop: RetryTask command");
                let _ = reply.send(store.retry(&id).map_err(store_err));
            }

            StateCommand::RequeueTask { id, reply } => {
                debug!(%id, "actor_loop: RequeueTask command");
                let _ = reply.send(store.requeue(&id).map_err(store_err));
            }

            StateCommand::ListTasks { filter, reply } => {
                debug!(?filter, "actor_loop: ListTasks command");
                refresh(&mut store);
                let _ = reply.send(Ok(store.list(&filter)));
            }

            StateCommand::Statistics { reply } => {
                debug!("actor_loop: Statistics command");
                refresh(&mut store);
                let _ = reply.send(Ok(store.statistics()));
            }

            StateCommand::PurgeOlderThan { statuses, age, reply } => {
                debug!(?statuses, ?age, "actor_loop: PurgeOlderThan command");
                let _ = reply.send(store.purge_older_than(&statuses, age).map_err(store_err));
            }

            StateCommand::EstimateQueueTime { id, reply } => {
                debug!(%id, "actor_loop: EstimateQueueTime command");
                refresh(&mut store);
                let _ = reply.send(Ok(store.estimate_queue_time(&id)));
            }

            StateCommand::ValidateDependencies { reply } => {
                debug!("actor_loop: ValidateDependencies command");
                refresh(&mut store);
                let _ = reply.send(Ok(store.validate_dependencies()));
            }

            StateCommand::Shutdown => {
                info!("StateManager shutting down");
                break;
            }
        }
    }

    debug!("StateManager actor stopped");
}
