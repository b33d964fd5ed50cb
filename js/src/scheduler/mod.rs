//! Job scheduler
//!
//! A pool of workers that pull eligible tasks from the StateManager and run
//! them with registered handlers, under a resource gate driven by a control
//! loop.

mod config;
mod core;
mod stats;
mod worker;

pub use config::SchedulerConfig;
pub use self::core::JobScheduler;
pub use stats::SchedulerStatistics;
pub use worker::{HANDLER_FAILED_MESSAGE, WorkerRecord, WorkerStatus};
