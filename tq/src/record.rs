//! Task records
//!
//! A [`TaskRecord`] is the unit of schedulable work. Records are created from a
//! [`NewTask`] by the store and only ever mutated by store operations; callers
//! receive clones.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::debug;

use crate::priority::Priority;

/// Default bound on retries for a task
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default estimate when the caller gives none (one hour)
pub const DEFAULT_ESTIMATED_DURATION_MS: u64 = 60 * 60 * 1000;

/// Task lifecycle status
///
/// `Pending -> Queued -> Running -> {Completed, Failed}`, `Failed -> Pending`
/// through retry, and any non-terminal status `-> Cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for dispatch
    #[default]
    Pending,
    /// Claimed by a worker, not yet started
    Queued,
    /// Handler is executing
    Running,
    /// Handler reported success
    Completed,
    /// Handler reported failure (retryable while retries remain)
    Failed,
    /// Cancelled by a caller
    Cancelled,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 6] = [
        Self::Pending,
        Self::Queued,
        Self::Running,
        Self::Completed,
        Self::Failed,
        Self::Cancelled,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Pending and Queued both mean "not yet running"
    pub fn is_awaiting_dispatch(self) -> bool {
        matches!(self, Self::Pending | Self::Queued)
    }

    /// Whether `update_status` may move a record from `self` to `next`.
    ///
    /// Non-terminal records may move anywhere. Terminal records only accept a
    /// repeat of their own status, which leaves their timestamps untouched.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        self == next || !self.is_terminal()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "completed" | "complete" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" | "canceled" => Ok(Self::Cancelled),
            _ => Err(format!("Unknown task status: {}", s)),
        }
    }
}

/// Task types a worker is allowed to execute
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Capabilities {
    /// No restriction
    #[default]
    Any,
    /// Only these task types
    Only(BTreeSet<String>),
}

impl Capabilities {
    pub fn only<I, S>(types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Only(types.into_iter().map(Into::into).collect())
    }

    pub fn allows(&self, task_type: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Only(types) => types.contains(task_type),
        }
    }
}

/// Durable record of one task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Unique, immutable identifier
    pub id: String,

    /// Handler capability required to run this task
    #[serde(rename = "type")]
    pub task_type: String,

    /// Grouping key (project id or similar), opaque to the store
    pub owner: String,

    pub priority: Priority,

    pub status: TaskStatus,

    /// Insertion counter, breaks `created_at` ties
    #[serde(default)]
    pub seq: u64,

    /// Creation timestamp (Unix milliseconds)
    pub created_at: i64,

    /// First transition into Running (Unix milliseconds)
    #[serde(default)]
    pub started_at: Option<i64>,

    /// First transition into a terminal status (Unix milliseconds)
    #[serde(default)]
    pub completed_at: Option<i64>,

    /// Ids that must be Completed before this task is eligible
    #[serde(default)]
    pub dependencies: BTreeSet<String>,

    /// Free-form labels for external filtering
    #[serde(default)]
    pub tags: BTreeSet<String>,

    #[serde(default)]
    pub retry_count: u32,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// 0.0 to 100.0
    #[serde(default)]
    pub progress_percentage: f64,

    #[serde(default)]
    pub estimated_duration_ms: u64,

    #[serde(default)]
    pub actual_duration_ms: Option<u64>,

    #[serde(default)]
    pub error_message: Option<String>,

    /// Input file handed to the handler
    #[serde(default)]
    pub input_file: Option<String>,

    /// Output directory handed to the handler
    #[serde(default)]
    pub output_dir: Option<String>,

    /// Handler-specific configuration
    #[serde(default)]
    pub config: Value,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

impl TaskRecord {
    pub(crate) fn from_new(task: NewTask, id: String, seq: u64, now: i64, default_max_retries: u32) -> Self {
        debug!(%id, task_type = %task.task_type, seq, "TaskRecord::from_new: called");
        Self {
            id,
            task_type: task.task_type,
            owner: task.owner,
            priority: task.priority,
            status: TaskStatus::Pending,
            seq,
            created_at: now,
            started_at: None,
            completed_at: None,
            dependencies: task.dependencies,
            tags: task.tags,
            retry_count: 0,
            max_retries: task.max_retries.unwrap_or(default_max_retries),
            progress_percentage: 0.0,
            estimated_duration_ms: task.estimated_duration_ms,
            actual_duration_ms: None,
            error_message: None,
            input_file: task.input_file,
            output_dir: task.output_dir,
            config: task.config,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Failed with retries left
    pub fn can_retry(&self) -> bool {
        self.status == TaskStatus::Failed && self.retry_count < self.max_retries
    }

    /// Failed with no retries left, or cancelled: will never complete
    pub fn is_dead(&self) -> bool {
        match self.status {
            TaskStatus::Cancelled => true,
            TaskStatus::Failed => self.retry_count >= self.max_retries,
            _ => false,
        }
    }

    /// Time spent waiting between creation and first start
    pub fn wait_ms(&self) -> Option<u64> {
        self.started_at.map(|s| (s - self.created_at).max(0) as u64)
    }
}

/// Input for [`Store::add`](crate::Store::add)
#[derive(Debug, Clone, PartialEq)]
pub struct NewTask {
    pub task_type: String,
    pub owner: String,
    pub priority: Priority,
    pub dependencies: BTreeSet<String>,
    pub tags: BTreeSet<String>,
    pub estimated_duration_ms: u64,
    /// Falls back to the store's configured default
    pub max_retries: Option<u32>,
    pub input_file: Option<String>,
    pub output_dir: Option<String>,
    pub config: Value,
}

impl NewTask {
    pub fn new(task_type: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            task_type: task_type.into(),
            owner: owner.into(),
            priority: Priority::Normal,
            dependencies: BTreeSet::new(),
            tags: BTreeSet::new(),
            estimated_duration_ms: DEFAULT_ESTIMATED_DURATION_MS,
            max_retries: None,
            input_file: None,
            output_dir: None,
            config: Value::Null,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_dependency(mut self, id: impl Into<String>) -> Self {
        self.dependencies.insert(id.into());
        self
    }

    pub fn with_dependencies<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn with_estimated_duration(mut self, estimate: Duration) -> Self {
        self.estimated_duration_ms = estimate.as_millis() as u64;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_input_file(mut self, path: impl Into<String>) -> Self {
        self.input_file = Some(path.into());
        self
    }

    pub fn with_output_dir(mut self, path: impl Into<String>) -> Self {
        self.output_dir = Some(path.into());
        self
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }
}
