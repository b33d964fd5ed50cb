//! Task handlers
//!
//! A handler turns a [`TaskRecord`] into an outcome. Workers look handlers up
//! by task type in a [`HandlerRegistry`]; an `Err` or a panic from a handler is
//! recorded as a failed task and never takes the worker down.

mod builtin;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use taskqueue::{TaskRecord, TaskStatus};
use tracing::debug;

use crate::state::StateManager;

pub use builtin::{BUILTIN_TASK_TYPES, StagedHandler, register_builtins};

/// Executes tasks of one type
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Run `task` to an outcome, reporting progress along the way
    async fn run(&self, task: TaskRecord, progress: ProgressReporter) -> eyre::Result<HandlerResult>;
}

/// Outcome reported by a handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerResult {
    pub success: bool,
    /// Failure reason; ignored on success
    pub message: Option<String>,
}

impl HandlerResult {
    pub fn success() -> Self {
        debug!("HandlerResult::success: called");
        Self {
            success: true,
            message: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        debug!("HandlerResult::failure: called");
        Self {
            success: false,
            message: Some(message.into()),
        }
    }
}

/// Progress and cancellation channel handed to a running handler
#[derive(Clone)]
pub struct ProgressReporter {
    task_id: String,
    state: StateManager,
}

impl ProgressReporter {
    pub fn new(task_id: impl Into<String>, state: StateManager) -> Self {
        Self {
            task_id: task_id.into(),
            state,
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Record progress in percent. Returns `false` once the task no longer
    /// accepts updates (for example after it was cancelled).
    pub async fn report(&self, percent: f64) -> bool {
        debug!(task_id = %self.task_id, percent, "ProgressReporter::report: called");
        match self
            .state
            .update_status(&self.task_id, TaskStatus::Running, Some(percent), None)
            .await
        {
            Ok(applied) => applied,
            Err(e) => {
                debug!(task_id = %self.task_id, error = %e, "ProgressReporter::report: update failed");
                false
            }
        }
    }

    /// Whether a caller has cancelled the task. Handlers may poll this to stop early.
    pub async fn is_cancelled(&self) -> bool {
        matches!(
            self.state.get_task(&self.task_id).await,
            Ok(Some(task)) if task.status == TaskStatus::Cancelled
        )
    }
}

/// Handler backed by an async closure
pub struct FnHandler<F> {
    f: F,
}

/// Wrap an async closure as a [`TaskHandler`]
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(TaskRecord, ProgressReporter) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = eyre::Result<HandlerResult>> + Send + 'static,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(TaskRecord, ProgressReporter) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = eyre::Result<HandlerResult>> + Send + 'static,
{
    async fn run(&self, task: TaskRecord, progress: ProgressReporter) -> eyre::Result<HandlerResult> {
        (self.f)(task, progress).await
    }
}

/// Task type -> handler
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with the built-in staged handlers
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        register_builtins(&mut registry);
        registry
    }

    /// Register `handler` for `task_type`, replacing any previous one
    pub fn register(&mut self, task_type: impl Into<String>, handler: impl TaskHandler + 'static) {
        let task_type = task_type.into();
        debug!(%task_type, "HandlerRegistry::register: called");
        self.handlers.insert(task_type, Arc::new(handler));
    }

    pub fn get(&self, task_type: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(task_type).cloned()
    }

    pub fn contains(&self, task_type: &str) -> bool {
        self.handlers.contains_key(task_type)
    }

    /// Registered task types, sorted
    pub fn task_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handler_result() {
        assert!(HandlerResult::success().success);
        let failure = HandlerResult::failure("bad input");
        assert!(!failure.success);
        assert_eq!(failure.message.as_deref(), Some("bad input"));
    }

    #[test]
    fn test_registry_builtins_and_override() {
        let mut registry = HandlerRegistry::with_builtins();
        assert_eq!(registry.len(), BUILTIN_TASK_TYPES.len());
        assert!(registry.contains("video_transcoding"));

        registry.register(
            "video_transcoding",
            handler_fn(|_task, _progress| async { Ok(HandlerResult::failure("disabled")) }),
        );
        registry.register(
            "thumbnail",
            handler_fn(|_task, _progress| async { Ok(HandlerResult::success()) }),
        );
        assert_eq!(registry.len(), BUILTIN_TASK_TYPES.len() + 1);
        assert_eq!(registry.task_types().first().map(String::as_str), Some("audio_extraction"));
        assert!(registry.get("missing").is_none());
    }
}
