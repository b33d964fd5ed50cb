//! JobScheduler configuration types and loading

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use taskqueue::{DEFAULT_MAX_RETRIES, DEFAULT_QUEUE_FILE, StoreConfig};

use crate::scheduler::SchedulerConfig;
use crate::state::RecoveryPolicy;

/// Main configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Worker pool, polling and resource ceilings
    pub scheduler: SchedulerConfig,

    /// Where the queue file lives
    pub storage: StorageConfig,

    /// Queue defaults
    pub queue: QueueConfig,

    /// Startup reconciliation of in-flight tasks
    pub recovery: RecoveryConfig,

    /// Log level (overridden by --log-level)
    #[serde(rename = "log-level")]
    pub log_level: Option<String>,
}

impl Config {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try project-local config: .jobscheduler.yml
        let local_config = PathBuf::from(".jobscheduler.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // Try user config: ~/.config/jobscheduler/jobscheduler.yml
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("jobscheduler").join("jobscheduler.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Read only the log level, before logging is set up. Errors are ignored;
    /// the full load reports them.
    pub fn load_log_level(config_path: Option<&PathBuf>) -> Option<String> {
        let candidates: Vec<PathBuf> = match config_path {
            Some(path) => vec![path.clone()],
            None => {
                let mut paths = vec![PathBuf::from(".jobscheduler.yml")];
                if let Some(config_dir) = dirs::config_dir() {
                    paths.push(config_dir.join("jobscheduler").join("jobscheduler.yml"));
                }
                paths
            }
        };

        candidates
            .iter()
            .filter(|p| p.exists())
            .find_map(|p| Self::load_from_file(p).ok())
            .and_then(|config| config.log_level)
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    /// Full path of the queue file
    pub fn queue_path(&self) -> PathBuf {
        self.storage.dir.join(&self.storage.file)
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            default_max_retries: self.queue.default_max_retries,
            stale_pending_after: Duration::from_secs(self.queue.stale_pending_secs),
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding the queue file and its lock
    pub dir: PathBuf,

    /// Queue file name
    pub file: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dir: dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("jobscheduler"),
            file: DEFAULT_QUEUE_FILE.to_string(),
        }
    }
}

/// Queue defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// `max_retries` for tasks added without one
    #[serde(rename = "default-max-retries")]
    pub default_max_retries: u32,

    /// Pending tasks older than this are reported as stale
    #[serde(rename = "stale-pending-secs")]
    pub stale_pending_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            default_max_retries: DEFAULT_MAX_RETRIES,
            stale_pending_secs: 60 * 60,
        }
    }
}

/// Recovery configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub policy: RecoveryPolicy,
}
