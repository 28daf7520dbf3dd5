//! Engine configuration — one explicit structure enumerating every
//! recognized option, persisted in `.foreman/config.json`.
//!
//! # API pattern
//!
//! Mutating functions take an explicit `root: &Path` (the project root) so
//! tests can point them at a `TempDir`. There are no implicit-cwd wrappers.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{io_err, StateError};
use crate::state::foreman_dir;

/// Policy applied when a squash merge into the trunk is rejected with
/// conflicting edits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum MergePolicy {
    /// Stop merging the remainder of the batch (default). Keeps trunk
    /// history reproducible: nothing after the conflict lands.
    #[default]
    StopOnConflict,
    /// Skip the conflicting workspace and keep merging independent survivors.
    SkipAndContinue,
}

/// Every recognized engine option and its effect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Failures in CLOSED before a breaker opens.
    pub breaker_failure_threshold: u32,
    /// Seconds an OPEN breaker rejects attempts before HALF_OPEN.
    pub breaker_cooldown_secs: u64,
    /// Consecutive HALF_OPEN successes required to close a breaker.
    pub breaker_success_quota: u32,
    /// Maximum checkpoints retained per workspace before pruning.
    pub checkpoint_retention: usize,
    /// Timeout for one external generation invocation, in seconds.
    pub generation_timeout_secs: u64,
    /// Timeout for one verification run, in seconds.
    pub verification_timeout_secs: u64,
    /// Maximum concurrently executing workspaces per batch.
    pub parallelism: usize,
    /// Times a FAILED task may return to DISPATCHED before it is abandoned.
    pub max_task_retries: u32,
    /// Consecutive task failures across the run before automatic
    /// continuation halts.
    pub failure_budget: u32,
    /// Conflict handling during the serial merge phase.
    pub merge_policy: MergePolicy,
    /// Trunk branch that all workspaces merge into.
    pub trunk_branch: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            breaker_failure_threshold: 3,
            breaker_cooldown_secs: 300,
            breaker_success_quota: 2,
            checkpoint_retention: 50,
            generation_timeout_secs: 600,
            verification_timeout_secs: 300,
            parallelism: 3,
            max_task_retries: 2,
            failure_budget: 3,
            merge_policy: MergePolicy::StopOnConflict,
            trunk_branch: "main".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn breaker_cooldown(&self) -> Duration {
        Duration::from_secs(self.breaker_cooldown_secs)
    }

    pub fn generation_timeout(&self) -> Duration {
        Duration::from_secs(self.generation_timeout_secs)
    }

    pub fn verification_timeout(&self) -> Duration {
        Duration::from_secs(self.verification_timeout_secs)
    }
}

/// `<root>/.foreman/config.json` — pure, no I/O.
pub fn config_path(root: &Path) -> PathBuf {
    foreman_dir(root).join("config.json")
}

/// Load the config for a project root, defaults when the file is absent.
///
/// A malformed config file is an error rather than a silent default: the
/// operator asked for specific behavior and should not lose it quietly.
pub fn load_at(root: &Path) -> Result<EngineConfig, StateError> {
    let path = config_path(root);
    if !path.exists() {
        return Ok(EngineConfig::default());
    }
    let contents = std::fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
    Ok(serde_json::from_str(&contents)?)
}

/// Atomically save the config. Write flow: serialize → `.tmp` sibling → rename.
pub fn save_at(root: &Path, config: &EngineConfig) -> Result<(), StateError> {
    let path = config_path(root);
    let dir = foreman_dir(root);
    std::fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;

    let json = serde_json::to_string_pretty(config)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json).map_err(|e| io_err(&tmp, e))?;
    std::fs::rename(&tmp, &path).map_err(|e| io_err(&path, e))?;
    Ok(())
}
