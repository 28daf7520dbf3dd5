//! Provenance entries: content-addressed records of generation calls.
//!
//! An entry's id is the SHA-256 of its content fields only — task id, prompt
//! hash, context hash, model, sorted touched files, parent id. Status and
//! timestamps are metadata and never feed the id, so re-recording the same
//! generation at a different time yields the same id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use foreman_core::types::TaskId;

/// Outcome classification of a generation call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    #[default]
    Pending,
    Accepted,
    Rejected,
}

impl std::fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntryStatus::Pending => write!(f, "pending"),
            EntryStatus::Accepted => write!(f, "accepted"),
            EntryStatus::Rejected => write!(f, "rejected"),
        }
    }
}

/// How a draft chains into the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ParentRef {
    /// Chain onto the ledger's current head (the common case).
    #[default]
    Auto,
    /// Explicitly a root entry, even if the ledger is non-empty.
    Root,
    /// Chain onto a specific entry; this is how branches form.
    Explicit(String),
}

/// Content of an entry before it is assigned an id and chained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryDraft {
    pub task_id: TaskId,
    pub prompt_hash: String,
    pub context_hash: String,
    pub model: String,
    pub touched_files: Vec<String>,
    pub parent: ParentRef,
    pub status: EntryStatus,
}

impl EntryDraft {
    pub fn new(
        task_id: TaskId,
        prompt_hash: impl Into<String>,
        context_hash: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            task_id,
            prompt_hash: prompt_hash.into(),
            context_hash: context_hash.into(),
            model: model.into(),
            touched_files: Vec::new(),
            parent: ParentRef::Auto,
            status: EntryStatus::Pending,
        }
    }

    pub fn touched(mut self, files: Vec<String>) -> Self {
        self.touched_files = files;
        self
    }

    pub fn with_parent(mut self, parent: ParentRef) -> Self {
        self.parent = parent;
        self
    }

    pub fn with_status(mut self, status: EntryStatus) -> Self {
        self.status = status;
        self
    }
}

/// A persisted ledger record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvenanceEntry {
    pub id: String,
    pub task_id: TaskId,
    pub prompt_hash: String,
    pub context_hash: String,
    pub model: String,
    /// Always stored sorted; ordering is part of the id.
    pub touched_files: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    pub status: EntryStatus,
    pub created_at: DateTime<Utc>,
}

impl ProvenanceEntry {
    /// Materialize a draft: sort the file set, resolve the parent, stamp it.
    pub(crate) fn from_draft(mut draft: EntryDraft, parent: Option<String>) -> Self {
        draft.touched_files.sort();
        let id = compute_id(
            &draft.task_id,
            &draft.prompt_hash,
            &draft.context_hash,
            &draft.model,
            &draft.touched_files,
            parent.as_deref(),
        );
        Self {
            id,
            task_id: draft.task_id,
            prompt_hash: draft.prompt_hash,
            context_hash: draft.context_hash,
            model: draft.model,
            touched_files: draft.touched_files,
            parent,
            status: draft.status,
            created_at: Utc::now(),
        }
    }

    /// Recompute the id from stored content. Differs from `self.id` iff the
    /// record was altered after the fact.
    pub fn recomputed_id(&self) -> String {
        let mut files = self.touched_files.clone();
        files.sort();
        compute_id(
            &self.task_id,
            &self.prompt_hash,
            &self.context_hash,
            &self.model,
            &files,
            self.parent.as_deref(),
        )
    }
}

/// Hex SHA-256 over the ordered content fields. Field order is fixed and
/// newline-delimited; changing any content field changes the id.
pub fn compute_id(
    task_id: &TaskId,
    prompt_hash: &str,
    context_hash: &str,
    model: &str,
    sorted_files: &[String],
    parent: Option<&str>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"task:");
    hasher.update(task_id.0.as_bytes());
    hasher.update(b"\nprompt:");
    hasher.update(prompt_hash.as_bytes());
    hasher.update(b"\ncontext:");
    hasher.update(context_hash.as_bytes());
    hasher.update(b"\nmodel:");
    hasher.update(model.as_bytes());
    hasher.update(b"\nfiles:");
    hasher.update(sorted_files.join(",").as_bytes());
    hasher.update(b"\nparent:");
    hasher.update(parent.unwrap_or("").as_bytes());
    hex::encode(hasher.finalize())
}

/// Short (16 hex char) digest of a prompt, for recording without retaining
/// the prompt itself.
pub fn hash_prompt(prompt: &str) -> String {
    short_digest(prompt.as_bytes())
}

/// Short digest over concatenated context chunks, in the order given.
pub fn hash_context<'a>(chunks: impl IntoIterator<Item = &'a str>) -> String {
    let mut hasher = Sha256::new();
    for chunk in chunks {
        hasher.update(chunk.as_bytes());
    }
    hex::encode(hasher.finalize())[..16].to_string()
}

fn short_digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())[..16].to_string()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
