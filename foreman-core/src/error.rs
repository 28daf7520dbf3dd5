//! Error types for foreman-core.

use std::path::PathBuf;

use thiserror::Error;

/// All errors that can arise from state store and config operations.
#[derive(Debug, Error)]
pub enum StateError {
    /// Underlying I/O failure, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// JSON serialization/deserialization error.
    #[error("state JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Could not acquire the exclusive state file lock.
    #[error("failed to lock state file at {path}: {source}")]
    Lock {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The stored schema version is newer than this binary understands.
    #[error("state schema version {found} is newer than supported version {supported}")]
    VersionTooNew { found: u32, supported: u32 },
}

/// Convenience constructor for [`StateError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> StateError {
    StateError::Io {
        path: path.into(),
        source,
    }
}
