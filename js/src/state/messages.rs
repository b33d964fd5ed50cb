//! State manager messages
//!
//! Commands and responses for the actor pattern.

use std::time::Duration;

use taskqueue::{Capabilities, DependencyReport, NewTask, QueueStatistics, TaskFilter, TaskRecord, TaskStatus};
use thiserror::Error;
use tokio::sync::oneshot;

/// Errors from state operations
#[derive(Debug, Error)]
pub enum StateError {
    #[error("Store error: {0}")]
    StoreError(String),

    #[error("Channel error")]
    ChannelError,
}

/// Response from state operations
pub type StateResponse<T> = Result<T, StateError>;

/// Commands sent to the StateManager actor
#[derive(Debug)]
pub enum StateCommand {
    AddTask {
        task: NewTask,
        reply: oneshot::Sender<StateResponse<String>>,
    },
    GetTask {
        id: String,
        reply: oneshot::Sender<StateResponse<Option<TaskRecord>>>,
    },
    /// Select and claim in one step
    NextEligible {
        capabilities: Capabilities,
        reply: oneshot::Sender<StateResponse<Option<TaskRecord>>>,
    },
    UpdateStatus {
        id: String,
        status: TaskStatus,
        progress: Option<f64>,
        error: Option<String>,
        reply: oneshot::Sender<StateResponse<bool>>,
    },
    CancelTask {
        id: String,
        reply: oneshot::Sender<StateResponse<bool>>,
    },
    RetryTask {
        id: String,
        reply: oneshot::Sender<StateResponse<bool>>,
    },
    RequeueTask {
        id: String,
        reply: oneshot::Sender<StateResponse<bool>>,
    },
    ListTasks {
        filter: TaskFilter,
        reply: oneshot::Sender<StateResponse<Vec<TaskRecord>>>,
    },
    Statistics {
        reply: oneshot::Sender<StateResponse<QueueStatistics>>,
    },
    PurgeOlderThan {
        statuses: Vec<TaskStatus>,
        age: Duration,
        reply: oneshot::Sender<StateResponse<usize>>,
    },
    EstimateQueueTime {
        id: String,
        reply: oneshot::Sender<StateResponse<Duration>>,
    },
    ValidateDependencies {
        reply: oneshot::Sender<StateResponse<DependencyReport>>,
    },

    // Shutdown
    Shutdown,
}
