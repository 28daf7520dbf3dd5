//! Branch-bound git worktrees, one per task.
//!
//! # Layout
//!
//! ```text
//! <repo>/.worktrees/<task_id>/   checked-out worktree
//! foreman/task/<task_id>         its branch, based on the trunk tip
//! ```
//!
//! Merging is always a squash into the trunk: one commit per task lands
//! regardless of how many commits the workspace accumulated. A conflicting
//! merge is fully backed out before the error is returned, so the trunk
//! working tree is clean either way.

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use foreman_core::types::{AgentWorkspace, TaskId};

use crate::error::{io_err, VcsError};
use crate::git;

/// Branch namespace for task worktrees.
pub const BRANCH_PREFIX: &str = "foreman/task";

/// Directory (relative to the repo root) holding all task worktrees.
pub const WORKTREES_DIR: &str = ".worktrees";

/// `foreman/task/<task_id>` — pure, no I/O.
pub fn branch_for(task_id: &TaskId) -> String {
    format!("{BRANCH_PREFIX}/{task_id}")
}

/// `<repo>/.worktrees/<task_id>` — pure, no I/O.
pub fn worktree_path(repo: &Path, task_id: &TaskId) -> PathBuf {
    repo.join(WORKTREES_DIR).join(&task_id.0)
}

/// One entry from `git worktree list --porcelain`, filtered to task worktrees.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeEntry {
    pub path: PathBuf,
    pub head: String,
    pub branch: Option<String>,
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Allocates, lists, merges, and removes task worktrees in one repository.
pub struct WorktreeManager {
    repo: PathBuf,
    trunk: String,
}

impl WorktreeManager {
    pub fn new(repo: impl Into<PathBuf>, trunk: impl Into<String>) -> Self {
        Self {
            repo: repo.into(),
            trunk: trunk.into(),
        }
    }

    pub fn trunk(&self) -> &str {
        &self.trunk
    }

    /// Create (or reattach to) the worktree for a task.
    ///
    /// The branch is based on the current trunk tip. If the worktree
    /// directory already exists from an interrupted run, it is reused.
    pub fn allocate(&self, task_id: &TaskId) -> Result<AgentWorkspace, VcsError> {
        self.require_repo()?;
        git::ensure_excluded(&self.repo)?;
        let branch = branch_for(task_id);
        let path = worktree_path(&self.repo, task_id);

        if path.exists() {
            debug!(task = %task_id, path = %path.display(), "reusing existing worktree");
            return Ok(AgentWorkspace::new(task_id.clone(), branch, path));
        }

        let parent = self.repo.join(WORKTREES_DIR);
        std::fs::create_dir_all(&parent).map_err(|e| io_err(&parent, e))?;

        let path_str = path.to_string_lossy().to_string();
        let created = git::run_git(
            &self.repo,
            &["worktree", "add", "-b", &branch, &path_str, &self.trunk],
        );
        if created.is_err() {
            // Branch survives from an earlier run; attach to it instead.
            git::run_git(&self.repo, &["worktree", "add", &path_str, &branch])?;
        }

        info!(task = %task_id, branch = %branch, "allocated worktree");
        Ok(AgentWorkspace::new(task_id.clone(), branch, path))
    }

    /// Remove a task's worktree and delete its branch.
    pub fn remove(&self, task_id: &TaskId, force: bool) -> Result<(), VcsError> {
        self.require_repo()?;
        let path = worktree_path(&self.repo, task_id);
        let branch = branch_for(task_id);

        if path.exists() {
            let path_str = path.to_string_lossy().to_string();
            let mut args = vec!["worktree", "remove", path_str.as_str()];
            if force {
                args.push("--force");
            }
            git::run_git(&self.repo, &args)?;
        }

        let delete_flag = if force { "-D" } else { "-d" };
        if git::try_git(&self.repo, &["branch", delete_flag, &branch]).is_none() {
            debug!(branch = %branch, "branch already gone or not deletable");
        }
        Ok(())
    }

    /// All live task worktrees, parsed from porcelain output.
    pub fn list(&self) -> Result<Vec<WorktreeEntry>, VcsError> {
        self.require_repo()?;
        let out = git::run_git(&self.repo, &["worktree", "list", "--porcelain"])?;
        let worktrees_root = self.repo.join(WORKTREES_DIR);

        let mut entries = Vec::new();
        let mut current: Option<WorktreeEntry> = None;
        for line in out.lines().chain(std::iter::once("")) {
            if line.is_empty() {
                if let Some(entry) = current.take() {
                    if entry.path.starts_with(&worktrees_root) {
                        entries.push(entry);
                    }
                }
            } else if let Some(path) = line.strip_prefix("worktree ") {
                current = Some(WorktreeEntry {
                    path: PathBuf::from(path),
                    head: String::new(),
                    branch: None,
                });
            } else if let Some(head) = line.strip_prefix("HEAD ") {
                if let Some(entry) = current.as_mut() {
                    entry.head = head.to_string();
                }
            } else if let Some(branch) = line.strip_prefix("branch ") {
                if let Some(entry) = current.as_mut() {
                    entry.branch = Some(
                        branch
                            .strip_prefix("refs/heads/")
                            .unwrap_or(branch)
                            .to_string(),
                    );
                }
            }
        }
        Ok(entries)
    }

    /// Squash-merge a task branch into the trunk. Returns the new trunk sha.
    ///
    /// On conflict the index and working tree are reset to the trunk tip
    /// before [`VcsError::MergeConflict`] is returned; nothing from the
    /// branch lands.
    pub fn merge_into_trunk(&self, task_id: &TaskId, message: &str) -> Result<String, VcsError> {
        self.require_repo()?;
        let branch = branch_for(task_id);

        git::run_git(&self.repo, &["checkout", &self.trunk])?;
        if git::run_git(&self.repo, &["merge", "--squash", &branch]).is_err() {
            // Back out the half-applied merge, trunk tree must stay clean.
            let _ = git::try_git(&self.repo, &["reset", "--merge"]);
            warn!(task = %task_id, branch = %branch, "squash merge conflicted, backed out");
            return Err(VcsError::MergeConflict { branch });
        }

        // An empty branch stages nothing; the trunk tip is already correct.
        if git::try_git(&self.repo, &["diff", "--cached", "--quiet"]).is_some() {
            debug!(task = %task_id, "branch introduced no changes");
            return git::head_sha(&self.repo);
        }

        git::commit(&self.repo, message)?;
        let sha = git::head_sha(&self.repo)?;
        info!(task = %task_id, sha = %sha, "merged into {}", self.trunk);
        Ok(sha)
    }

    /// Files the task branch changed relative to the trunk merge base.
    pub fn modified_files(&self, task_id: &TaskId) -> Result<Vec<String>, VcsError> {
        self.require_repo()?;
        git::diff_name_only(&self.repo, &self.trunk, &branch_for(task_id))
    }

    fn require_repo(&self) -> Result<(), VcsError> {
        if git::is_git_repo(&self.repo) {
            Ok(())
        } else {
            Err(VcsError::NotARepo {
                path: self.repo.clone(),
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
