//! Scheduler configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::resources::ResourceLimits;

/// Scheduler configuration (the `scheduler` section of the config file)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Worker pool size used by `js run` when none is given
    pub workers: usize,

    /// Control loop interval in milliseconds
    #[serde(rename = "poll-interval-ms")]
    pub poll_interval_ms: u64,

    /// How long an idle worker sleeps when nothing is eligible
    #[serde(rename = "idle-backoff-ms")]
    pub idle_backoff_ms: u64,

    /// Control loop back-off while the host is over a resource ceiling
    #[serde(rename = "overload-backoff-ms")]
    pub overload_backoff_ms: u64,

    /// How long `stop` waits for workers to finish their current task
    #[serde(rename = "shutdown-timeout-ms")]
    pub shutdown_timeout_ms: u64,

    #[serde(rename = "max-cpu-percent")]
    pub max_cpu_percent: f64,

    #[serde(rename = "max-memory-percent")]
    pub max_memory_percent: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            poll_interval_ms: 2_000,
            idle_backoff_ms: 1_000,
            overload_backoff_ms: 10_000,
            shutdown_timeout_ms: 5_000,
            max_cpu_percent: 80.0,
            max_memory_percent: 85.0,
        }
    }
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn idle_backoff(&self) -> Duration {
        Duration::from_millis(self.idle_backoff_ms)
    }

    pub fn overload_backoff(&self) -> Duration {
        Duration::from_millis(self.overload_backoff_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn limits(&self) -> ResourceLimits {
        ResourceLimits {
            max_cpu_percent: self.max_cpu_percent,
            max_memory_percent: self.max_memory_percent,
        }
    }
}
