//! Foreman provenance library — a content-addressed, hash-chained record of
//! every generation call.
//!
//! Public API surface:
//! - [`entry`] — [`ProvenanceEntry`], [`EntryDraft`], id computation, hash helpers
//! - [`ledger`] — [`Ledger`]: record / query / verify
//! - [`error`] — [`ProvenanceError`]

pub mod entry;
pub mod error;
pub mod ledger;

pub use entry::{hash_context, hash_prompt, EntryDraft, EntryStatus, ParentRef, ProvenanceEntry};
pub use error::ProvenanceError;
pub use ledger::{ChainBreak, Ledger, LedgerStats};
