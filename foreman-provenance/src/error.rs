//! Error types for foreman-provenance.

use std::path::PathBuf;

use thiserror::Error;

/// All errors that can arise from ledger operations.
#[derive(Debug, Error)]
pub enum ProvenanceError {
    /// An I/O error, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Ledger JSON error.
    #[error("ledger JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The requested entry does not exist.
    #[error("provenance entry not found: {id}")]
    EntryNotFound { id: String },
}

/// Convenience constructor for [`ProvenanceError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> ProvenanceError {
    ProvenanceError::Io {
        path: path.into(),
        source,
    }
}
