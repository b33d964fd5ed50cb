//! CLI command definitions and subcommands

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use taskqueue::{Priority, TaskStatus};
use tracing::debug;

/// JobScheduler - batch task queue and worker pool
#[derive(Parser)]
#[command(name = "js", about = "Persistent batch task queue with a resource-aware worker pool", version)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(
        short = 'l',
        long = "log-level",
        global = true,
        help = "Log level (TRACE, DEBUG, INFO, WARN, ERROR)"
    )]
    pub log_level: Option<String>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Add a task to the queue
    Add {
        /// Task type (selects the handler)
        #[arg(value_name = "TYPE")]
        task_type: String,

        /// Owner / project the task belongs to
        #[arg(short, long, default_value = "default")]
        owner: String,

        /// Priority (low, normal, high, critical)
        #[arg(short, long, default_value = "normal")]
        priority: Priority,

        /// Task id that must complete first (repeatable)
        #[arg(short = 'd', long = "depends-on", value_name = "ID")]
        depends_on: Vec<String>,

        /// Label (repeatable)
        #[arg(short, long = "tag", value_name = "TAG")]
        tags: Vec<String>,

        /// Estimated run time in seconds
        #[arg(short, long, value_name = "SECS")]
        estimate: Option<u64>,

        /// Retry bound (defaults to the queue's default-max-retries)
        #[arg(long)]
        max_retries: Option<u32>,

        /// Input file passed to the handler
        #[arg(long)]
        input: Option<String>,

        /// Output directory passed to the handler
        #[arg(long)]
        output_dir: Option<String>,

        /// Handler configuration as a JSON document
        #[arg(long = "task-config", value_name = "JSON")]
        task_config: Option<String>,
    },

    /// Show one task
    Get {
        /// Task id
        id: String,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// List tasks, newest first
    List {
        /// Filter by status (pending, queued, running, completed, failed, cancelled)
        #[arg(short, long)]
        status: Option<TaskStatus>,

        /// Filter by owner
        #[arg(short, long)]
        owner: Option<String>,

        /// Filter by task type
        #[arg(short = 't', long = "type")]
        task_type: Option<String>,

        /// Filter by tag
        #[arg(long)]
        tag: Option<String>,

        /// Show at most this many tasks
        #[arg(short = 'n', long)]
        limit: Option<usize>,

        /// Output format
        #[arg(short, long, default_value = "table")]
        format: OutputFormat,
    },

    /// Cancel a task that has not finished
    Cancel {
        /// Task id
        id: String,
    },

    /// Put a failed task back in the queue
    Retry {
        /// Task id
        id: String,
    },

    /// Show queue statistics
    Stats {
        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Remove old finished tasks
    Purge {
        /// Statuses to purge (default: completed, failed, cancelled)
        #[arg(short, long = "status", value_delimiter = ',')]
        statuses: Vec<TaskStatus>,

        /// Only tasks finished more than this many days ago
        #[arg(long = "older-than-days", default_value = "7")]
        older_than_days: u64,
    },

    /// Check the dependency graph for cycles, missing and dead dependencies
    Validate {
        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Run the scheduler in the foreground until Ctrl+C / SIGTERM
    Run {
        /// Worker pool size (defaults to scheduler.workers)
        #[arg(short, long)]
        workers: Option<usize>,

        /// Exit once no task can make progress
        #[arg(long)]
        until_idle: bool,
    },
}

/// Get the log file path
pub fn get_log_path() -> PathBuf {
    debug!("get_log_path: called");
    let path = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("jobscheduler")
        .join("logs")
        .join("jobscheduler.log");
    debug!(?path, "get_log_path: returning path");
    path
}

/// Output format for read commands
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
    Table,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        debug!(%s, "OutputFormat::from_str: called");
        match s.to_lowercase().as_str() {
            "text" | "plain" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            "table" => Ok(Self::Table),
            _ => Err(format!("Unknown format: {}. Use: text, json, or table", s)),
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Json => write!(f, "json"),
            Self::Table => write!(f, "table"),
        }
    }
}
