//! State management with actor pattern
//!
//! StateManager owns the task Store and processes messages via channels,
//! giving the scheduler and its workers serialised access to persistent state.

mod manager;
mod messages;
mod recovery;

pub use manager::{StateEvent, StateManager};
pub use messages::{StateCommand, StateError, StateResponse};
pub use recovery::{INTERRUPTED_MESSAGE, RecoveryPolicy, RecoveryStats, recover};
