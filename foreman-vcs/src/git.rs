//! Thin wrappers over the `git` binary.
//!
//! Every function takes an explicit `repo: &Path` so tests can point them at
//! a `TempDir`. Output is captured; a nonzero exit becomes
//! [`VcsError::Command`] with the invocation and stderr attached.

use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::{io_err, VcsError};

/// Paths foreman owns; kept out of version control via `info/exclude`.
const EXCLUDED_PATHS: &[&str] = &[".foreman/", ".worktrees/"];

/// Run a git command in `repo`, returning trimmed stdout.
pub fn run_git(repo: &Path, args: &[&str]) -> Result<String, VcsError> {
    let output = Command::new("git")
        .args(args)
        .current_dir(repo)
        .output()
        .map_err(|e| io_err(repo, e))?;
    if !output.status.success() {
        return Err(VcsError::Command {
            args: args.join(" "),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Like [`run_git`] but tolerates a nonzero exit, returning `None` instead.
pub fn try_git(repo: &Path, args: &[&str]) -> Option<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(repo)
        .output()
        .ok()?;
    if output.status.success() {
        Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        None
    }
}

pub fn is_git_repo(repo: &Path) -> bool {
    try_git(repo, &["rev-parse", "--git-dir"]).is_some()
}

pub fn current_branch(repo: &Path) -> Result<String, VcsError> {
    run_git(repo, &["rev-parse", "--abbrev-ref", "HEAD"])
}

pub fn head_sha(repo: &Path) -> Result<String, VcsError> {
    run_git(repo, &["rev-parse", "HEAD"])
}

/// Resolve a ref (tag, branch, sha) to a commit sha, if it exists.
pub fn rev_parse(repo: &Path, reference: &str) -> Option<String> {
    try_git(repo, &["rev-parse", "--verify", &format!("{reference}^{{commit}}")])
}

pub fn has_changes(repo: &Path) -> Result<bool, VcsError> {
    Ok(!run_git(repo, &["status", "--porcelain"])?.is_empty())
}

pub fn changed_file_count(repo: &Path) -> Result<usize, VcsError> {
    let status = run_git(repo, &["status", "--porcelain"])?;
    Ok(status.lines().filter(|l| !l.is_empty()).count())
}

pub fn stage_all(repo: &Path) -> Result<(), VcsError> {
    run_git(repo, &["add", "-A"]).map(|_| ())
}

pub fn commit(repo: &Path, message: &str) -> Result<(), VcsError> {
    run_git(repo, &["commit", "-m", message]).map(|_| ())
}

pub fn tag(repo: &Path, name: &str) -> Result<(), VcsError> {
    run_git(repo, &["tag", name]).map(|_| ())
}

pub fn delete_tag(repo: &Path, name: &str) {
    // Already-gone tags are fine during pruning.
    let _ = try_git(repo, &["tag", "-d", name]);
}

/// Make sure foreman's own directories never show up as repository changes.
///
/// Appends the missing patterns to `info/exclude` in the common git dir, so
/// the exclusion is shared by every worktree and never lands in a commit the
/// way a tracked `.gitignore` edit would.
pub fn ensure_excluded(repo: &Path) -> Result<(), VcsError> {
    let git_dir = run_git(repo, &["rev-parse", "--git-common-dir"])?;
    let mut git_dir = PathBuf::from(git_dir);
    if git_dir.is_relative() {
        git_dir = repo.join(git_dir);
    }
    let exclude_path = git_dir.join("info").join("exclude");

    let existing = std::fs::read_to_string(&exclude_path).unwrap_or_default();
    let missing: Vec<&str> = EXCLUDED_PATHS
        .iter()
        .copied()
        .filter(|pattern| !existing.lines().any(|line| line.trim() == *pattern))
        .collect();
    if missing.is_empty() {
        return Ok(());
    }

    if let Some(dir) = exclude_path.parent() {
        std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
    }
    let mut contents = existing;
    if !contents.is_empty() && !contents.ends_with('\n') {
        contents.push('\n');
    }
    for pattern in missing {
        contents.push_str(pattern);
        contents.push('\n');
    }
    std::fs::write(&exclude_path, contents).map_err(|e| io_err(&exclude_path, e))?;
    Ok(())
}

/// Files that differ between `base` and `head` (three-dot: since the merge
/// base), relative paths as git prints them.
pub fn diff_name_only(repo: &Path, base: &str, head: &str) -> Result<Vec<String>, VcsError> {
    let out = run_git(repo, &["diff", "--name-only", &format!("{base}...{head}")])?;
    Ok(out.lines().filter(|l| !l.is_empty()).map(str::to_string).collect())
}

#[cfg(test)]
pub(crate) mod testutil {
    use std::path::Path;

    /// `git init` a repository with `main` as the initial branch and an
    /// identity configured, then make an initial commit.
    pub fn init_repo(dir: &Path) {
        git(dir, &["init", "--initial-branch=main"]);
        git(dir, &["config", "user.name", "test"]);
        git(dir, &["config", "user.email", "test@example.com"]);
        std::fs::write(dir.join("README.md"), "seed\n").unwrap();
        git(dir, &["add", "-A"]);
        git(dir, &["commit", "-m", "initial"]);
    }

    pub fn git(dir: &Path, args: &[&str]) -> String {
        super::run_git(dir, args).unwrap_or_else(|e| panic!("git {args:?}: {e}"))
    }
}
