//! Store error types

use std::path::PathBuf;
use thiserror::Error;

/// Failures of the store itself.
///
/// Unknown ids and rejected transitions are not errors; those operations
/// return `false` or `None`.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Queue file {path} is unreadable")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Timed out waiting for the lock on queue file {path}")]
    Locked { path: PathBuf },

    #[error("Store was opened read-only")]
    ReadOnly,
}
