//! Domain types for the Foreman engine.
//!
//! All path fields use `PathBuf`; never `&str` or `String` for filesystem paths.
//! All types are serializable/deserializable via serde + serde_json.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Current schema version of [`UnifiedState`]. Bump when a migration step is added.
pub const STATE_VERSION: u32 = 2;

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// A strongly-typed identifier for a task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub String);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// A strongly-typed name for a circuit breaker (one per operation class).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BreakerName(pub String);

impl fmt::Display for BreakerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for BreakerName {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Lifecycle status of a task in the dispatch/execute/verify/merge pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    #[default]
    Pending,
    Dispatched,
    Executing,
    Verifying,
    Merged,
    Failed,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Dispatched => write!(f, "dispatched"),
            TaskStatus::Executing => write!(f, "executing"),
            TaskStatus::Verifying => write!(f, "verifying"),
            TaskStatus::Merged => write!(f, "merged"),
            TaskStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Status of an agent workspace, from allocation through merge or cleanup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceStatus {
    #[default]
    Created,
    Executing,
    Verifying,
    Passed,
    Failed,
    Merged,
}

/// Circuit breaker state. Transitions only follow Closed→Open,
/// Open→HalfOpen, HalfOpen→{Closed, Open}.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakerState::Closed => write!(f, "CLOSED"),
            BreakerState::Open => write!(f, "OPEN"),
            BreakerState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

// ---------------------------------------------------------------------------
// Domain structs
// ---------------------------------------------------------------------------

/// A unit of work consumed from the task source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    /// Tasks that must reach [`TaskStatus::Merged`] before this one dispatches.
    #[serde(default)]
    pub depends_on: Vec<TaskId>,
    #[serde(default)]
    pub status: TaskStatus,
}

impl Task {
    pub fn new(id: impl Into<TaskId>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            depends_on: Vec::new(),
            status: TaskStatus::Pending,
        }
    }

    pub fn with_deps(mut self, deps: Vec<TaskId>) -> Self {
        self.depends_on = deps;
        self
    }
}

/// Record of one circuit breaker. Stored per operation class in
/// [`UnifiedState::breakers`], created lazily, reset on explicit clear.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct BreakerRecord {
    pub failures: u32,
    pub state: BreakerState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opened_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub consecutive_successes: u32,
    /// Set while the single HALF_OPEN trial is in flight.
    #[serde(default)]
    pub trial_in_flight: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure: Option<DateTime<Utc>>,
}

/// An isolated, branch-bound copy of the project assigned to one task.
///
/// Path and branch are unique among live workspaces; the entry is removed
/// from the registry at merge or explicit cleanup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentWorkspace {
    pub task_id: TaskId,
    pub branch: String,
    pub path: PathBuf,
    pub status: WorkspaceStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub checkpoints: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AgentWorkspace {
    pub fn new(task_id: TaskId, branch: String, path: PathBuf) -> Self {
        Self {
            task_id,
            branch,
            path,
            status: WorkspaceStatus::Created,
            started_at: Utc::now(),
            checkpoints: Vec::new(),
            error: None,
        }
    }
}

/// Engine loop counters and the most recent checkpoint reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct LoopState {
    pub iteration: u64,
    pub current_batch: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_checkpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub consecutive_failures: u32,
}

/// Aggregate run metrics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Metrics {
    pub total_tasks: u64,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    pub total_merges: u64,
    pub total_rollbacks: u64,
    pub total_checkpoints: u64,
}

impl Metrics {
    /// Completed / (completed + failed), or 0.0 before any task resolves.
    pub fn success_rate(&self) -> f64 {
        let resolved = self.completed_tasks + self.failed_tasks;
        if resolved == 0 {
            0.0
        } else {
            self.completed_tasks as f64 / resolved as f64
        }
    }
}

/// The single source of truth for engine state, persisted in
/// `.foreman/state.json`. Owned exclusively by the state store; all
/// mutation goes through it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnifiedState {
    pub version: u32,
    #[serde(rename = "loop", default)]
    pub loop_state: LoopState,
    #[serde(default)]
    pub breakers: HashMap<String, BreakerRecord>,
    #[serde(default)]
    pub agents: HashMap<TaskId, AgentWorkspace>,
    #[serde(default)]
    pub metrics: Metrics,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Default for UnifiedState {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            version: STATE_VERSION,
            loop_state: LoopState::default(),
            breakers: HashMap::new(),
            agents: HashMap::new(),
            metrics: Metrics::default(),
            created_at: now,
            updated_at: now,
        }
    }
}

impl UnifiedState {
    /// Get or lazily create the breaker record for an operation class.
    pub fn breaker_mut(&mut self, name: &BreakerName) -> &mut BreakerRecord {
        self.breakers.entry(name.0.clone()).or_default()
    }

    pub fn breaker(&self, name: &BreakerName) -> Option<&BreakerRecord> {
        self.breakers.get(&name.0)
    }

    /// Register a live agent workspace. Replaces a stale entry for the same task.
    pub fn register_agent(&mut self, agent: AgentWorkspace) {
        self.agents.insert(agent.task_id.clone(), agent);
    }

    /// Remove an agent at merge or cleanup. Returns the removed entry if any.
    pub fn remove_agent(&mut self, task_id: &TaskId) -> Option<AgentWorkspace> {
        self.agents.remove(task_id)
    }

    pub fn record_task_complete(&mut self) {
        self.metrics.completed_tasks += 1;
        self.loop_state.consecutive_failures = 0;
    }

    pub fn record_task_failed(&mut self) {
        self.metrics.failed_tasks += 1;
        self.loop_state.consecutive_failures += 1;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn newtype_display() {
        assert_eq!(TaskId::from("t-01").to_string(), "t-01");
        assert_eq!(BreakerName::from("generation").to_string(), "generation");
    }

    #[test]
    fn breaker_created_lazily() {
        let mut state = UnifiedState::default();
        assert!(state.breaker(&BreakerName::from("gen")).is_none());
        state.breaker_mut(&BreakerName::from("gen")).failures = 2;
        assert_eq!(state.breaker(&BreakerName::from("gen")).unwrap().failures, 2);
    }

    #[test]
    fn state_serde_roundtrip() {
        let mut state = UnifiedState::default();
        state.register_agent(AgentWorkspace::new(
            TaskId::from("t-01"),
            "foreman/task/t-01".to_string(),
            PathBuf::from(".worktrees/t-01"),
        ));
        let json = serde_json::to_string_pretty(&state).expect("serialize");
        let back: UnifiedState = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, state);
    }

    #[test]
    fn breaker_state_uses_wire_names() {
        let json = serde_json::to_string(&BreakerState::HalfOpen).unwrap();
        assert_eq!(json, "\"HALF_OPEN\"");
    }

    #[test]
    fn success_rate_zero_before_any_resolution() {
        let metrics = Metrics::default();
        assert_eq!(metrics.success_rate(), 0.0);
    }

    #[test]
    fn consecutive_failures_reset_on_completion() {
        let mut state = UnifiedState::default();
        state.record_task_failed();
        state.record_task_failed();
        assert_eq!(state.loop_state.consecutive_failures, 2);
        state.record_task_complete();
        assert_eq!(state.loop_state.consecutive_failures, 0);
    }
}
