//! Git checkpoints: lightweight tags plus metadata records.
//!
//! A checkpoint is a commit (dirty files are committed first), a tag under
//! `foreman/checkpoint/`, and a JSON metadata file.
//!
//! # Storage layout
//!
//! ```text
//! <repo>/.foreman/checkpoints/
//!   cp-T-42-20260830-101530.json
//!   cp-20260830-104512.json
//! ```
//!
//! Restore verifies the target commit exists before mutating anything, so a
//! failed lookup never leaves the working tree half-reset.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use foreman_core::types::TaskId;

use crate::error::{io_err, VcsError};
use crate::git;

/// Tag namespace for checkpoints. Pruning only ever deletes tags under it.
pub const TAG_PREFIX: &str = "foreman/checkpoint";

/// `<repo>/.foreman/checkpoints/` — pure, no I/O.
pub fn checkpoints_dir(repo: &Path) -> PathBuf {
    repo.join(".foreman").join("checkpoints")
}

/// Everything recorded about one checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub id: String,
    pub commit_sha: String,
    pub tag_name: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub branch: String,
    #[serde(default)]
    pub files_changed: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
}

/// Which checkpoint a restore targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreTarget {
    /// The most recently created checkpoint.
    Latest,
    /// A specific checkpoint by id.
    Id(String),
}

/// Summary of `git diff --shortstat` between a checkpoint and HEAD.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DiffStats {
    pub files_changed: usize,
    pub insertions: usize,
    pub deletions: usize,
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Creates, restores, lists, and prunes checkpoints in one repository.
pub struct CheckpointManager {
    repo: PathBuf,
    /// Where metadata lives. Distinct from `repo` for worktree checkpoints,
    /// whose records must not travel with the branch into a merge.
    metadata_root: PathBuf,
}

impl CheckpointManager {
    pub fn new(repo: impl Into<PathBuf>) -> Self {
        let repo = repo.into();
        Self {
            metadata_root: repo.clone(),
            repo,
        }
    }

    /// Git operations run in `repo`; metadata is kept under
    /// `<metadata_root>/.foreman/checkpoints/`.
    pub fn with_metadata_root(repo: impl Into<PathBuf>, metadata_root: impl Into<PathBuf>) -> Self {
        Self {
            repo: repo.into(),
            metadata_root: metadata_root.into(),
        }
    }

    pub fn repo(&self) -> &Path {
        &self.repo
    }

    /// Create a checkpoint. Dirty files are committed first so the tag
    /// captures the working tree, not just the last commit.
    pub fn create(
        &self,
        message: Option<&str>,
        task_id: Option<&TaskId>,
    ) -> Result<CheckpointMetadata, VcsError> {
        self.require_repo()?;
        // Metadata lands under .foreman/; keep it out of the commits it
        // describes.
        git::ensure_excluded(&self.repo)?;

        let now = Utc::now();
        let id = self.unique_id(task_id, now)?;

        let mut files_changed = 0;
        if git::has_changes(&self.repo)? {
            files_changed = git::changed_file_count(&self.repo)?;
            git::stage_all(&self.repo)?;
            let commit_message = message
                .map(str::to_string)
                .unwrap_or_else(|| format!("checkpoint: {id}"));
            git::commit(&self.repo, &commit_message)?;
        }

        let commit_sha = git::head_sha(&self.repo)?;
        let branch = git::current_branch(&self.repo)?;
        let tag_name = format!("{TAG_PREFIX}/{id}");
        git::tag(&self.repo, &tag_name)?;

        let metadata = CheckpointMetadata {
            id: id.clone(),
            commit_sha,
            tag_name,
            message: message.map(str::to_string).unwrap_or_else(|| {
                match task_id {
                    Some(task) => format!("checkpoint before {task}"),
                    None => format!("checkpoint: {id}"),
                }
            }),
            created_at: now,
            branch,
            files_changed,
            task_id: task_id.cloned(),
        };
        self.save_metadata(&metadata)?;
        info!(checkpoint = %id, files_changed, "checkpoint created");
        Ok(metadata)
    }

    /// Restore the working tree to a checkpoint with a hard reset.
    ///
    /// The target commit is resolved and verified before any mutation; an
    /// unknown id returns [`VcsError::CheckpointNotFound`] with the tree
    /// untouched.
    pub fn restore(&self, target: RestoreTarget) -> Result<CheckpointMetadata, VcsError> {
        self.require_repo()?;

        let metadata = match target {
            RestoreTarget::Latest => self
                .list(1)?
                .into_iter()
                .next()
                .ok_or(VcsError::CheckpointNotFound {
                    id: "latest".to_string(),
                })?,
            RestoreTarget::Id(id) => match self.load_metadata(&id)? {
                Some(metadata) => metadata,
                // Metadata lost but the tag may survive.
                None => self.metadata_from_tag(&id)?,
            },
        };

        if git::rev_parse(&self.repo, &metadata.commit_sha).is_none() {
            return Err(VcsError::CheckpointNotFound {
                id: metadata.id.clone(),
            });
        }

        git::run_git(&self.repo, &["reset", "--hard", &metadata.commit_sha])?;
        info!(checkpoint = %metadata.id, sha = %metadata.commit_sha, "restored checkpoint");
        Ok(metadata)
    }

    /// List checkpoints, newest first, at most `limit`.
    pub fn list(&self, limit: usize) -> Result<Vec<CheckpointMetadata>, VcsError> {
        let dir = checkpoints_dir(&self.metadata_root);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut checkpoints = Vec::new();
        for entry in std::fs::read_dir(&dir).map_err(|e| io_err(&dir, e))? {
            let entry = entry.map_err(|e| io_err(&dir, e))?;
            let path = entry.path();
            if path.extension().map_or(true, |ext| ext != "json") {
                continue;
            }
            let contents = std::fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
            match serde_json::from_str::<CheckpointMetadata>(&contents) {
                Ok(metadata) => checkpoints.push(metadata),
                Err(e) => debug!(path = %path.display(), error = %e, "skipping unreadable checkpoint metadata"),
            }
        }
        checkpoints.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        checkpoints.truncate(limit);
        Ok(checkpoints)
    }

    /// Delete all but the `keep` newest checkpoints (tags and metadata).
    /// Returns how many were removed.
    pub fn prune(&self, keep: usize) -> Result<usize, VcsError> {
        let all = self.list(usize::MAX)?;
        if all.len() <= keep {
            return Ok(0);
        }
        let mut removed = 0;
        for metadata in &all[keep..] {
            git::delete_tag(&self.repo, &metadata.tag_name);
            let path = self.metadata_path(&metadata.id);
            if path.exists() {
                std::fs::remove_file(&path).map_err(|e| io_err(&path, e))?;
            }
            removed += 1;
        }
        info!(removed, keep, "pruned checkpoints");
        Ok(removed)
    }

    /// Diff summary from a checkpoint (or the newest one) to HEAD.
    pub fn diff_stats(&self, id: Option<&str>) -> Result<DiffStats, VcsError> {
        self.require_repo()?;
        let base = match id {
            Some(id) => match self.load_metadata(id)? {
                Some(metadata) => metadata.commit_sha,
                None => self.metadata_from_tag(id)?.commit_sha,
            },
            None => match self.list(1)?.into_iter().next() {
                Some(metadata) => metadata.commit_sha,
                None => "HEAD".to_string(),
            },
        };
        let out = git::run_git(&self.repo, &["diff", "--shortstat", &base, "HEAD"])?;
        Ok(parse_shortstat(&out))
    }

    // -- internals ----------------------------------------------------------

    fn require_repo(&self) -> Result<(), VcsError> {
        if git::is_git_repo(&self.repo) {
            Ok(())
        } else {
            Err(VcsError::NotARepo {
                path: self.repo.clone(),
            })
        }
    }

    /// `cp-[<task>-]<timestamp>`, disambiguated when two land in one second.
    fn unique_id(&self, task_id: Option<&TaskId>, now: DateTime<Utc>) -> Result<String, VcsError> {
        let stamp = now.format("%Y%m%d-%H%M%S");
        let base = match task_id {
            Some(task) => format!("cp-{task}-{stamp}"),
            None => format!("cp-{stamp}"),
        };
        let mut id = base.clone();
        let mut n = 1;
        while self.metadata_path(&id).exists() {
            n += 1;
            id = format!("{base}-{n}");
        }
        Ok(id)
    }

    fn metadata_path(&self, id: &str) -> PathBuf {
        checkpoints_dir(&self.metadata_root).join(format!("{id}.json"))
    }

    /// Atomic write: serialize, `.tmp` sibling, rename.
    fn save_metadata(&self, metadata: &CheckpointMetadata) -> Result<(), VcsError> {
        let dir = checkpoints_dir(&self.metadata_root);
        std::fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
        let path = self.metadata_path(&metadata.id);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(metadata)?;
        std::fs::write(&tmp, json).map_err(|e| io_err(&tmp, e))?;
        std::fs::rename(&tmp, &path).map_err(|e| io_err(&path, e))?;
        Ok(())
    }

    fn load_metadata(&self, id: &str) -> Result<Option<CheckpointMetadata>, VcsError> {
        let path = self.metadata_path(id);
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
        Ok(Some(serde_json::from_str(&contents)?))
    }

    /// Reconstruct minimal metadata from a surviving tag.
    fn metadata_from_tag(&self, id: &str) -> Result<CheckpointMetadata, VcsError> {
        let tag_name = format!("{TAG_PREFIX}/{id}");
        let commit_sha = git::rev_parse(&self.repo, &tag_name)
            .ok_or_else(|| VcsError::CheckpointNotFound { id: id.to_string() })?;
        Ok(CheckpointMetadata {
            id: id.to_string(),
            commit_sha,
            tag_name,
            message: "restored from tag".to_string(),
            created_at: Utc::now(),
            branch: git::current_branch(&self.repo)?,
            files_changed: 0,
            task_id: None,
        })
    }
}

fn parse_shortstat(line: &str) -> DiffStats {
    // e.g. " 3 files changed, 10 insertions(+), 2 deletions(-)"
    let mut stats = DiffStats::default();
    for part in line.split(',') {
        let part = part.trim();
        let Some(count) = part
            .split_whitespace()
            .next()
            .and_then(|n| n.parse::<usize>().ok())
        else {
            continue;
        };
        if part.contains("file") {
            stats.files_changed = count;
        } else if part.contains("insertion") {
            stats.insertions = count;
        } else if part.contains("deletion") {
            stats.deletions = count;
        }
    }
    stats
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
