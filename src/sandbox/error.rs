//! Domain-specific error types for sandbox operations.
//!
//! Typed errors enable callers to match on specific failure modes
//! rather than parsing error message strings.

use std::path::PathBuf;

use crate::engine::EngineError;

/// Errors that can occur during sandbox lifecycle and snapshot operations.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// The operation needs a running container and there is none.
    #[error("Sandbox not running")]
    NotRunning,

    /// The container engine rejected or failed a call.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// Reading or writing a snapshot archive on disk failed.
    #[error("Snapshot archive I/O failed: {0}")]
    Archive(#[from] std::io::Error),

    /// No snapshot record with this id.
    #[error("Snapshot not found: {id}")]
    SnapshotNotFound { id: i64 },

    /// The record exists but its archive file does not.
    #[error("Snapshot file missing from disk: {}", path.display())]
    SnapshotMissing { id: i64, path: PathBuf },

    /// The record store failed.
    #[error("Store error: {0:#}")]
    Store(#[from] anyhow::Error),
}

impl SandboxError {
    /// Creates a `SnapshotNotFound` error.
    pub fn snapshot_not_found(id: i64) -> Self {
        Self::SnapshotNotFound { id }
    }

    /// Creates a `SnapshotMissing` error.
    pub fn snapshot_missing(id: i64, path: impl Into<PathBuf>) -> Self {
        Self::SnapshotMissing {
            id,
            path: path.into(),
        }
    }

    /// Returns true if no container was running.
    pub fn is_not_running(&self) -> bool {
        matches!(self, Self::NotRunning)
    }

    /// Returns true if the snapshot record does not exist.
    pub fn is_snapshot_not_found(&self) -> bool {
        matches!(self, Self::SnapshotNotFound { .. })
    }

    /// Returns true if the engine was unreachable.
    pub fn is_engine_unavailable(&self) -> bool {
        matches!(self, Self::Engine(e) if e.is_unavailable())
    }
}
