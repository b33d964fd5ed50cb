//! List filters

use crate::record::{TaskRecord, TaskStatus};

/// Conjunction of optional criteria for [`Store::list`](crate::Store::list)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub owner: Option<String>,
    pub task_type: Option<String>,
    /// Matches when the record's tag set contains this tag
    pub tag: Option<String>,
}

impl TaskFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn task_type(mut self, task_type: impl Into<String>) -> Self {
        self.task_type = Some(task_type.into());
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn matches(&self, record: &TaskRecord) -> bool {
        self.status.is_none_or(|s| record.status == s)
            && self.owner.as_deref().is_none_or(|o| record.owner == o)
            && self.task_type.as_deref().is_none_or(|t| record.task_type == t)
            && self.tag.as_deref().is_none_or(|t| record.tags.contains(t))
    }
}
