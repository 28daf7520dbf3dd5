//! Foreman VCS library — git checkpoints and task worktrees.
//!
//! Public API surface:
//! - [`git`] — thin wrappers over the `git` binary
//! - [`checkpoint`] — tag-plus-metadata snapshots with hard-reset restore
//! - [`worktree`] — branch-bound task worktrees and squash merges
//! - [`error`] — [`VcsError`]

pub mod checkpoint;
pub mod error;
pub mod git;
pub mod worktree;

pub use checkpoint::{CheckpointManager, CheckpointMetadata, DiffStats, RestoreTarget};
pub use error::VcsError;
pub use worktree::{WorktreeEntry, WorktreeManager};
