//! TaskQueue - persistent task store for batch scheduling
//!
//! Owns the durable set of [`TaskRecord`]s and every mutation applied to them:
//! status transitions, priority and dependency aware candidate selection,
//! retries, cancellation and purging. The full record set is rewritten to a
//! single JSON file after each mutation.
//!
//! # Core Concepts
//!
//! - **Exclusive Ownership**: all mutations take `&mut Store`, so callers that
//!   share a store must serialise access (a mutex or an actor)
//! - **Claim Then Run**: [`Store::next_eligible`] moves the winning record to
//!   `Queued` in the same step that selects it, so it is never handed out twice
//! - **Permissive Dependencies**: unknown dependency ids are accepted at add
//!   time and simply never become satisfied
//!
//! # Modules
//!
//! - [`record`] - task records, statuses and the `NewTask` builder
//! - [`store`] - the store itself
//! - [`graph`] - dependency graph validation
//! - [`stats`] - aggregate queue statistics

pub mod error;
pub mod filter;
pub mod graph;
mod persist;
pub mod priority;
pub mod record;
pub mod stats;
pub mod store;

pub use error::StoreError;
pub use filter::TaskFilter;
pub use graph::{DependencyReport, blocked_tasks, find_cycles};
pub use priority::Priority;
pub use record::{Capabilities, DEFAULT_ESTIMATED_DURATION_MS, DEFAULT_MAX_RETRIES, NewTask, TaskRecord, TaskStatus};
pub use stats::QueueStatistics;
pub use store::{DEFAULT_QUEUE_FILE, Store, StoreConfig};

/// Current time as Unix milliseconds
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
