//! Host resource probing
//!
//! The scheduler's resource gate asks a [`ResourceProbe`] for CPU, memory and
//! disk utilization before starting workers or dispatching tasks.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use eyre::{Context, Result};
use serde::Serialize;
use tracing::debug;

/// Utilization percentages (0.0 to 100.0)
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ResourceSnapshot {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_percent: f64,
}

/// Source of host utilization figures
#[async_trait]
pub trait ResourceProbe: Send + Sync {
    async fn sample(&self) -> Result<ResourceSnapshot>;
}

/// Ceilings above which the scheduler defers new work
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceLimits {
    pub max_cpu_percent: f64,
    pub max_memory_percent: f64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_cpu_percent: 80.0,
            max_memory_percent: 85.0,
        }
    }
}

impl ResourceLimits {
    /// Reason the snapshot is over a ceiling, if it is
    pub fn exceeded(&self, snapshot: &ResourceSnapshot) -> Option<String> {
        if snapshot.cpu_percent > self.max_cpu_percent {
            return Some(format!(
                "CPU usage {:.1}% exceeds {:.1}%",
                snapshot.cpu_percent, self.max_cpu_percent
            ));
        }
        if snapshot.memory_percent > self.max_memory_percent {
            return Some(format!(
                "memory usage {:.1}% exceeds {:.1}%",
                snapshot.memory_percent, self.max_memory_percent
            ));
        }
        None
    }
}

/// Cumulative jiffies from the aggregate `cpu` line of /proc/stat
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CpuTimes {
    idle: u64,
    total: u64,
}

/// Linux probe reading /proc and statvfs
pub struct ProcProbe {
    proc_root: PathBuf,
    disk_path: PathBuf,
    last_cpu: Mutex<Option<CpuTimes>>,
}

impl ProcProbe {
    pub fn new() -> Self {
        Self::with_paths("/proc", "/")
    }

    pub fn with_paths(proc_root: impl Into<PathBuf>, disk_path: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
            disk_path: disk_path.into(),
            last_cpu: Mutex::new(None),
        }
    }

    /// CPU busy percentage since the previous sample (since boot on the first)
    fn cpu_percent(&self) -> Result<f64> {
        let stat = std::fs::read_to_string(self.proc_root.join("stat")).context("Failed to read /proc/stat")?;
        let now = parse_cpu_times(&stat).ok_or_else(|| eyre::eyre!("No cpu line in /proc/stat"))?;

        let mut last = self
            .last_cpu
            .lock()
            .map_err(|_| eyre::eyre!("CPU sample lock poisoned"))?;
        let previous = last.replace(now);
        Ok(cpu_busy_percent(previous, now))
    }

    fn memory_percent(&self) -> Result<f64> {
        let meminfo =
            std::fs::read_to_string(self.proc_root.join("meminfo")).context("Failed to read /proc/meminfo")?;
        parse_memory_percent(&meminfo).ok_or_else(|| eyre::eyre!("MemTotal/MemAvailable missing from /proc/meminfo"))
    }
}

impl Default for ProcProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResourceProbe for ProcProbe {
    async fn sample(&self) -> Result<ResourceSnapshot> {
        let snapshot = ResourceSnapshot {
            cpu_percent: self.cpu_percent()?,
            memory_percent: self.memory_percent()?,
            disk_percent: disk_percent(&self.disk_path)?,
        };
        debug!(?snapshot, "ProcProbe::sample: complete");
        Ok(snapshot)
    }
}

/// Probe returning whatever was last set; for tests and hosts without /proc
#[derive(Debug, Default)]
pub struct FixedProbe {
    snapshot: Mutex<ResourceSnapshot>,
}

impl FixedProbe {
    pub fn new(snapshot: ResourceSnapshot) -> Self {
        Self {
            snapshot: Mutex::new(snapshot),
        }
    }

    pub fn set(&self, snapshot: ResourceSnapshot) {
        if let Ok(mut current) = self.snapshot.lock() {
            *current = snapshot;
        }
    }
}

#[async_trait]
impl ResourceProbe for FixedProbe {
    async fn sample(&self) -> Result<ResourceSnapshot> {
        self.snapshot
            .lock()
            .map(|s| *s)
            .map_err(|_| eyre::eyre!("FixedProbe lock poisoned"))
    }
}

fn parse_cpu_times(stat: &str) -> Option<CpuTimes> {
    let line = stat.lines().find(|l| l.starts_with("cpu "))?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .take(8)
        .filter_map(|f| f.parse().ok())
        .collect();
    if fields.len() < 4 {
        return None;
    }
    // idle + iowait
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    Some(CpuTimes {
        idle,
        total: fields.iter().sum(),
    })
}

fn cpu_busy_percent(previous: Option<CpuTimes>, now: CpuTimes) -> f64 {
    let (idle, total) = match previous {
        Some(prev) if now.total > prev.total => (now.idle.saturating_sub(prev.idle), now.total - prev.total),
        _ => (now.idle, now.total),
    };
    if total == 0 {
        return 0.0;
    }
    (1.0 - idle as f64 / total as f64) * 100.0
}

fn parse_memory_percent(meminfo: &str) -> Option<f64> {
    let field = |name: &str| -> Option<u64> {
        meminfo
            .lines()
            .find(|l| l.starts_with(name))?
            .split_whitespace()
            .nth(1)?
            .parse()
            .ok()
    };
    let total = field("MemTotal:")?;
    let available = field("MemAvailable:")?;
    if total == 0 {
        return None;
    }
    Some((1.0 - available as f64 / total as f64) * 100.0)
}

fn disk_percent(path: &Path) -> Result<f64> {
    let stat = nix::sys::statvfs::statvfs(path).with_context(|| format!("statvfs failed for {}", path.display()))?;
    let blocks = stat.blocks() as f64;
    let free = stat.blocks_free() as f64;
    let available = stat.blocks_available() as f64;
    let used = blocks - free;
    if used + available <= 0.0 {
        return Ok(0.0);
    }
    Ok(used / (used + available) * 100.0)
}
