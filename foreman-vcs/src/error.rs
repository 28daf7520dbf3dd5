//! Error types for foreman-vcs.

use std::path::PathBuf;

use thiserror::Error;

/// All errors that can arise from checkpoint and worktree operations.
#[derive(Debug, Error)]
pub enum VcsError {
    /// An I/O error, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A git invocation exited nonzero.
    #[error("git {args} failed: {stderr}")]
    Command { args: String, stderr: String },

    /// The target directory is not inside a git repository.
    #[error("not a git repository: {path}")]
    NotARepo { path: PathBuf },

    /// The requested checkpoint has no tag and no metadata.
    #[error("checkpoint not found: {id}")]
    CheckpointNotFound { id: String },

    /// A squash merge was rejected with conflicting edits. The trunk
    /// working tree has been reset; nothing from the branch landed.
    #[error("merge conflict merging {branch}")]
    MergeConflict { branch: String },

    /// Checkpoint metadata JSON error.
    #[error("checkpoint metadata JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Convenience constructor for [`VcsError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> VcsError {
    VcsError::Io {
        path: path.into(),
        source,
    }
}
