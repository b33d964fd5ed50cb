//! JobScheduler - worker-pool batch scheduler over a persistent task queue
//!
//! Runs a bounded pool of workers that pull eligible tasks out of a
//! [`taskqueue::Store`] and execute them with handlers registered per task
//! type, pausing new work while the host is over its resource ceilings.
//!
//! # Core Concepts
//!
//! - **Single Access Point**: the store is owned by a [`state::StateManager`]
//!   actor; every worker goes through it, so claims never race
//! - **Pull Workers**: idle workers claim their own next task, woken early by
//!   state events when work is added or released
//! - **Isolated Handlers**: a handler error or panic fails its task, never the
//!   worker
//! - **Startup Recovery**: tasks left Queued or Running by a previous process
//!   are reconciled before the pool starts
//!
//! # Modules
//!
//! - [`state`] - store actor and recovery
//! - [`scheduler`] - control loop, workers and statistics
//! - [`handler`] - handler trait, registry and built-in handlers
//! - [`resources`] - host resource probes and limits
//! - [`config`] / [`cli`] - configuration and command line

pub mod cli;
pub mod config;
pub mod handler;
pub mod resources;
pub mod scheduler;
pub mod state;

pub use config::Config;
pub use handler::{HandlerRegistry, HandlerResult, ProgressReporter, TaskHandler, handler_fn};
pub use resources::{FixedProbe, ProcProbe, ResourceLimits, ResourceProbe, ResourceSnapshot};
pub use scheduler::{JobScheduler, SchedulerConfig, SchedulerStatistics, WorkerRecord, WorkerStatus};
pub use state::{RecoveryPolicy, StateManager};
