//! Error types for foreman-engine.

use std::path::PathBuf;

use thiserror::Error;

use foreman_core::StateError;
use foreman_provenance::ProvenanceError;
use foreman_vcs::VcsError;

/// All errors that can arise from orchestration.
#[derive(Debug, Error)]
pub enum EngineError {
    /// An error from the state store.
    #[error("state error: {0}")]
    State(#[from] StateError),

    /// An error from checkpoint/worktree operations. Non-fatal outside the
    /// merge phase: it fails the task it occurred in.
    #[error("vcs error: {0}")]
    Vcs(#[from] VcsError),

    /// An error from the provenance ledger.
    #[error("provenance error: {0}")]
    Provenance(#[from] ProvenanceError),

    /// An I/O error, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Task source JSON error.
    #[error("task source JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A background task panicked or was cancelled.
    #[error("worker task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    /// A trunk/VCS primitive failed during the merge phase. The run cannot
    /// continue safely.
    #[error("fatal during merge of {branch}: {source}")]
    Fatal {
        branch: String,
        #[source]
        source: VcsError,
    },
}

/// Convenience constructor for [`EngineError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> EngineError {
    EngineError::Io {
        path: path.into(),
        source,
    }
}
