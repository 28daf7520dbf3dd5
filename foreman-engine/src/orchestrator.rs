//! The dispatch → execute → verify → merge pipeline.
//!
//! Each batch selects ready tasks in source order, runs them concurrently in
//! isolated worktrees, and then merges the survivors serially in dispatch
//! order under the trunk lock. The state store's own lock is never acquired
//! while the trunk lock is held: merge results are collected first and
//! applied to state afterwards.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{Mutex as TokioMutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use foreman_core::breaker::{Breaker, BreakerPolicy};
use foreman_core::config::{EngineConfig, MergePolicy};
use foreman_core::state::StateStore;
use foreman_core::types::{AgentWorkspace, Task, TaskId, WorkspaceStatus};
use foreman_provenance::{EntryDraft, EntryStatus, Ledger};
use foreman_vcs::{checkpoint::CheckpointManager, git, worktree::WorktreeManager, VcsError};

use crate::error::EngineError;
use crate::invoker::{GenerationInvoker, GenerationOutcome};
use crate::policy::{Admission, RetryPolicy};
use crate::scheduler::{is_deadlocked, ready_tasks};
use crate::task_source::TaskSource;
use crate::verifier::VerificationRunner;

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// Why a run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum HaltReason {
    /// No pending tasks remain.
    Completed,
    /// Consecutive failures reached the failure budget.
    FailureBudget,
    /// The batch limit was reached.
    MaxBatches,
    /// The generation breaker rejected every candidate.
    BreakerOpen,
    /// Remaining tasks wait on dependencies that can never merge.
    Blocked,
}

impl std::fmt::Display for HaltReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HaltReason::Completed => write!(f, "completed"),
            HaltReason::FailureBudget => write!(f, "failure budget exhausted"),
            HaltReason::MaxBatches => write!(f, "batch limit reached"),
            HaltReason::BreakerOpen => write!(f, "generation breaker open"),
            HaltReason::Blocked => write!(f, "blocked on unresolvable dependencies"),
        }
    }
}

/// What one batch did, in dispatch order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    pub batch: u64,
    pub dispatched: Vec<TaskId>,
    pub merged: Vec<TaskId>,
    pub failed: Vec<TaskId>,
    /// Passing workspaces left unmerged after a StopOnConflict halt.
    pub skipped: Vec<TaskId>,
}

/// Result of a whole run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub batches: Vec<BatchReport>,
    pub halt: HaltReason,
}

impl RunSummary {
    pub fn merged_count(&self) -> usize {
        self.batches.iter().map(|b| b.merged.len()).sum()
    }

    pub fn failed_count(&self) -> usize {
        self.batches.iter().map(|b| b.failed.len()).sum()
    }
}

#[derive(Debug, Clone)]
enum TaskOutcome {
    Passed,
    Failed(String),
}

enum MergeDisposition {
    Merged,
    Conflicted,
    Skipped,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Drives the pipeline over injected collaborators.
pub struct Orchestrator {
    root: PathBuf,
    config: EngineConfig,
    state: Arc<dyn StateStore>,
    tasks: Arc<dyn TaskSource>,
    invoker: Arc<dyn GenerationInvoker>,
    verifier: Arc<dyn VerificationRunner>,
    ledger: Arc<Ledger>,
    policy: Arc<RetryPolicy>,
    /// Serializes the merge phase; held only around VCS operations.
    trunk_lock: TokioMutex<()>,
    /// Dispatch counts per task, for the retry budget.
    attempts: Mutex<HashMap<TaskId, u32>>,
}

impl Orchestrator {
    pub fn new(
        root: impl Into<PathBuf>,
        config: EngineConfig,
        state: Arc<dyn StateStore>,
        tasks: Arc<dyn TaskSource>,
        invoker: Arc<dyn GenerationInvoker>,
        verifier: Arc<dyn VerificationRunner>,
    ) -> Self {
        let root = root.into();
        let ledger = Arc::new(Ledger::new(&root));
        let policy = Arc::new(RetryPolicy::new(
            Breaker::new(BreakerPolicy::from(&config)),
            config.max_task_retries,
        ));
        Self {
            root,
            config,
            state,
            tasks,
            invoker,
            verifier,
            ledger,
            policy,
            trunk_lock: TokioMutex::new(()),
            attempts: Mutex::new(HashMap::new()),
        }
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Run batches until done, halted, or `max_batches` is reached.
    pub async fn run(&self, max_batches: Option<u64>) -> Result<RunSummary, EngineError> {
        let mut batches = Vec::new();
        loop {
            let batch_no = batches.len() as u64 + 1;
            if let Some(max) = max_batches {
                if batch_no > max {
                    return Ok(RunSummary {
                        batches,
                        halt: HaltReason::MaxBatches,
                    });
                }
            }

            let pending = self.tasks.pending_tasks()?;
            if pending.is_empty() {
                return Ok(RunSummary {
                    batches,
                    halt: HaltReason::Completed,
                });
            }
            let merged = self.tasks.merged_tasks()?;
            if is_deadlocked(&pending, &merged) {
                warn!("remaining tasks all wait on unresolvable dependencies");
                return Ok(RunSummary {
                    batches,
                    halt: HaltReason::Blocked,
                });
            }

            let candidates = ready_tasks(&pending, &merged, self.config.parallelism);
            if candidates.is_empty() {
                return Ok(RunSummary {
                    batches,
                    halt: HaltReason::Blocked,
                });
            }

            let (admitted, exhausted) = self.admit(&candidates)?;
            for id in &exhausted {
                warn!(task = %id, "retry budget exhausted, abandoning task");
                self.tasks.mark_failed(id)?;
            }
            if admitted.is_empty() {
                if exhausted.is_empty() {
                    return Ok(RunSummary {
                        batches,
                        halt: HaltReason::BreakerOpen,
                    });
                }
                continue;
            }

            self.state.update(&mut |s| {
                s.loop_state.iteration += 1;
                s.loop_state.current_batch = batch_no;
                if s.loop_state.started_at.is_none() {
                    s.loop_state.started_at = Some(Utc::now());
                }
            })?;

            let report = self.run_batch(batch_no, admitted).await?;
            info!(
                batch = batch_no,
                merged = report.merged.len(),
                failed = report.failed.len(),
                "batch finished"
            );
            batches.push(report);

            let state_now = self.state.load()?;
            if state_now.loop_state.consecutive_failures >= self.config.failure_budget {
                warn!(
                    consecutive = state_now.loop_state.consecutive_failures,
                    budget = self.config.failure_budget,
                    "failure budget exhausted, halting"
                );
                return Ok(RunSummary {
                    batches,
                    halt: HaltReason::FailureBudget,
                });
            }
        }
    }

    /// One batch: dispatch, execute + verify concurrently, merge serially.
    async fn run_batch(&self, batch_no: u64, admitted: Vec<Task>) -> Result<BatchReport, EngineError> {
        let mut report = BatchReport {
            batch: batch_no,
            ..BatchReport::default()
        };

        // Dispatch: allocate worktrees in source order.
        let mut dispatched: Vec<(Task, AgentWorkspace)> = Vec::new();
        for task in admitted {
            let first_attempt = !self.has_attempted(&task.id);
            self.bump_attempt(&task.id);
            match self.allocate_workspace(&task.id).await {
                Ok(workspace) => {
                    self.state.update(&mut |s| {
                        if first_attempt {
                            s.metrics.total_tasks += 1;
                        }
                        s.register_agent(workspace.clone());
                    })?;
                    report.dispatched.push(task.id.clone());
                    dispatched.push((task, workspace));
                }
                Err(e) => {
                    error!(task = %task.id, error = %e, "worktree allocation failed");
                    let name = self.policy.breaker_name().clone();
                    self.state.update(&mut |s| {
                        // Admission may have consumed the HALF_OPEN trial;
                        // resolve it or the breaker stays wedged.
                        self.policy.record_failure(s.breaker_mut(&name));
                        s.record_task_failed();
                    })?;
                    report.failed.push(task.id.clone());
                }
            }
        }

        // Execute + verify, bounded by the semaphore.
        let semaphore = Arc::new(Semaphore::new(self.config.parallelism));
        let mut set: JoinSet<(TaskId, TaskOutcome)> = JoinSet::new();
        for (task, workspace) in dispatched.clone() {
            let semaphore = semaphore.clone();
            let ctx = self.worker_ctx();
            set.spawn(async move {
                let id = task.id.clone();
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return (id, TaskOutcome::Failed("executor shut down".to_string()));
                };
                let outcome = match run_task(ctx, task, workspace).await {
                    Ok(outcome) => outcome,
                    // Per-task failures never abort the batch.
                    Err(e) => TaskOutcome::Failed(e.to_string()),
                };
                (id, outcome)
            });
        }
        let mut outcomes: HashMap<TaskId, TaskOutcome> = HashMap::new();
        while let Some(joined) = set.join_next().await {
            let (id, outcome) = joined?;
            if let TaskOutcome::Failed(reason) = &outcome {
                warn!(task = %id, reason = %reason, "task failed before merge");
                report.failed.push(id.clone());
                self.mark_agent_failed(&id, reason)?;
                self.state.update(&mut |s| s.record_task_failed())?;
            }
            outcomes.insert(id, outcome);
        }

        // Merge serially, in dispatch order, under the trunk lock.
        let merge_results = self.merge_phase(&dispatched, &outcomes).await?;

        // Apply results only after the trunk lock is released.
        for (task, disposition) in merge_results {
            match disposition {
                MergeDisposition::Merged => {
                    self.tasks.mark_merged(&task.id)?;
                    self.state.update(&mut |s| {
                        s.remove_agent(&task.id);
                        s.metrics.total_merges += 1;
                        s.record_task_complete();
                    })?;
                    self.release_workspace(&task.id).await;
                    report.merged.push(task.id.clone());
                }
                MergeDisposition::Conflicted => {
                    self.tasks.mark_failed(&task.id)?;
                    self.mark_agent_failed(&task.id, "merge conflict")?;
                    self.state.update(&mut |s| s.record_task_failed())?;
                    report.failed.push(task.id.clone());
                }
                MergeDisposition::Skipped => {
                    // Skipped through no fault of its own; the dispatch must
                    // not count against the task's retry budget.
                    self.refund_attempt(&task.id);
                    report.skipped.push(task.id.clone());
                }
            }
        }
        Ok(report)
    }

    /// The serial merge walk. Only VCS work happens while the lock is held.
    async fn merge_phase(
        &self,
        dispatched: &[(Task, AgentWorkspace)],
        outcomes: &HashMap<TaskId, TaskOutcome>,
    ) -> Result<Vec<(Task, MergeDisposition)>, EngineError> {
        let mut results = Vec::new();
        let _trunk = self.trunk_lock.lock().await;
        let mut halted = false;

        for (task, workspace) in dispatched {
            if !matches!(outcomes.get(&task.id), Some(TaskOutcome::Passed)) {
                continue;
            }
            if halted {
                results.push((task.clone(), MergeDisposition::Skipped));
                continue;
            }

            let root = self.root.clone();
            let trunk = self.config.trunk_branch.clone();
            let id = task.id.clone();
            let message = format!("feat({}): {}", task.id, task.title);
            let merge = tokio::task::spawn_blocking(move || {
                WorktreeManager::new(root, trunk).merge_into_trunk(&id, &message)
            })
            .await?;

            match merge {
                Ok(sha) => {
                    info!(task = %task.id, sha = %sha, "merged");
                    results.push((task.clone(), MergeDisposition::Merged));
                }
                Err(VcsError::MergeConflict { branch }) => {
                    warn!(task = %task.id, branch = %branch, policy = ?self.config.merge_policy, "merge conflict");
                    results.push((task.clone(), MergeDisposition::Conflicted));
                    if self.config.merge_policy == MergePolicy::StopOnConflict {
                        halted = true;
                    }
                }
                Err(source) => {
                    return Err(EngineError::Fatal {
                        branch: workspace.branch.clone(),
                        source,
                    });
                }
            }
        }
        Ok(results)
    }

    // -- helpers ------------------------------------------------------------

    fn admit(&self, candidates: &[Task]) -> Result<(Vec<Task>, Vec<TaskId>), EngineError> {
        let attempt_counts: Vec<u32> = candidates.iter().map(|t| self.attempt(&t.id)).collect();
        let mut admitted = Vec::new();
        let mut exhausted = Vec::new();
        self.state.update(&mut |s| {
            admitted.clear();
            exhausted.clear();
            let name = self.policy.breaker_name().clone();
            for (task, attempts) in candidates.iter().zip(&attempt_counts) {
                match self.policy.admit(s.breaker_mut(&name), *attempts) {
                    Admission::Admit => admitted.push(task.clone()),
                    Admission::BreakerOpen => {}
                    Admission::RetriesExhausted => exhausted.push(task.id.clone()),
                }
            }
        })?;
        Ok((admitted, exhausted))
    }

    async fn allocate_workspace(&self, id: &TaskId) -> Result<AgentWorkspace, EngineError> {
        let root = self.root.clone();
        let trunk = self.config.trunk_branch.clone();
        let id = id.clone();
        Ok(tokio::task::spawn_blocking(move || {
            WorktreeManager::new(root, trunk).allocate(&id)
        })
        .await??)
    }

    async fn release_workspace(&self, id: &TaskId) {
        let root = self.root.clone();
        let trunk = self.config.trunk_branch.clone();
        let id = id.clone();
        let removed = tokio::task::spawn_blocking(move || {
            WorktreeManager::new(root, trunk).remove(&id, true)
        })
        .await;
        if let Ok(Err(e)) = removed {
            warn!(error = %e, "worktree cleanup failed, leaving it in place");
        }
    }

    fn mark_agent_failed(&self, id: &TaskId, reason: &str) -> Result<(), EngineError> {
        self.state.update(&mut |s| {
            if let Some(agent) = s.agents.get_mut(id) {
                agent.status = WorkspaceStatus::Failed;
                agent.error = Some(reason.to_string());
            }
        })?;
        Ok(())
    }

    fn attempt(&self, id: &TaskId) -> u32 {
        *self
            .attempts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .unwrap_or(&0)
    }

    /// Whether this task has ever been dispatched, refunds included.
    fn has_attempted(&self, id: &TaskId) -> bool {
        self.attempts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(id)
    }

    fn bump_attempt(&self, id: &TaskId) {
        let mut attempts = self.attempts.lock().unwrap_or_else(|e| e.into_inner());
        *attempts.entry(id.clone()).or_insert(0) += 1;
    }

    fn refund_attempt(&self, id: &TaskId) {
        let mut attempts = self.attempts.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(count) = attempts.get_mut(id) {
            *count = count.saturating_sub(1);
        }
    }

    fn worker_ctx(&self) -> Arc<WorkerCtx> {
        Arc::new(WorkerCtx {
            root: self.root.clone(),
            state: self.state.clone(),
            invoker: self.invoker.clone(),
            verifier: self.verifier.clone(),
            ledger: self.ledger.clone(),
            policy: self.policy.clone(),
        })
    }
}

// ---------------------------------------------------------------------------
// Per-task worker
// ---------------------------------------------------------------------------

struct WorkerCtx {
    root: PathBuf,
    state: Arc<dyn StateStore>,
    invoker: Arc<dyn GenerationInvoker>,
    verifier: Arc<dyn VerificationRunner>,
    ledger: Arc<Ledger>,
    policy: Arc<RetryPolicy>,
}

/// Checkpoint, generate, commit, verify — for one task in its workspace.
async fn run_task(
    ctx: Arc<WorkerCtx>,
    task: Task,
    workspace: AgentWorkspace,
) -> Result<TaskOutcome, EngineError> {
    // Checkpoint first so a bad generation can be rolled back by hand.
    let checkpoint = {
        let path = workspace.path.clone();
        let root = ctx.root.clone();
        let id = task.id.clone();
        tokio::task::spawn_blocking(move || {
            CheckpointManager::with_metadata_root(&path, &root).create(None, Some(&id))
        })
        .await??
    };
    ctx.state.update(&mut |s| {
        s.metrics.total_checkpoints += 1;
        s.loop_state.last_checkpoint = Some(checkpoint.id.clone());
        if let Some(agent) = s.agents.get_mut(&task.id) {
            agent.status = WorkspaceStatus::Executing;
            agent.checkpoints.push(checkpoint.id.clone());
        }
    })?;

    let outcome = match ctx.invoker.generate(&task, &workspace.path).await {
        Ok(outcome) => outcome,
        Err(e) => {
            error!(task = %task.id, error = %e, "generation invocation errored");
            GenerationOutcome {
                success: false,
                touched_files: Vec::new(),
                prompt_hash: String::new(),
                context_hash: String::new(),
                model: "unknown".to_string(),
            }
        }
    };

    // Every generation call leaves a ledger record, failures included.
    {
        let ledger = ctx.ledger.clone();
        let draft = EntryDraft::new(
            task.id.clone(),
            outcome.prompt_hash.clone(),
            outcome.context_hash.clone(),
            outcome.model.clone(),
        )
        .touched(outcome.touched_files.clone())
        .with_status(if outcome.success {
            EntryStatus::Accepted
        } else {
            EntryStatus::Rejected
        });
        tokio::task::spawn_blocking(move || ledger.record(draft)).await??;
    }

    let name = ctx.policy.breaker_name().clone();
    ctx.state.update(&mut |s| {
        let record = s.breaker_mut(&name);
        if outcome.success {
            ctx.policy.record_success(record);
        } else {
            ctx.policy.record_failure(record);
        }
    })?;

    if !outcome.success {
        return Ok(TaskOutcome::Failed("generation failed".to_string()));
    }

    // Commit whatever the generation left behind on the task branch.
    {
        let path = workspace.path.clone();
        let message = format!("task {}: {}", task.id, task.title);
        tokio::task::spawn_blocking(move || -> Result<(), VcsError> {
            if git::has_changes(&path)? {
                git::stage_all(&path)?;
                git::commit(&path, &message)?;
            }
            Ok(())
        })
        .await??;
    }

    ctx.state.update(&mut |s| {
        if let Some(agent) = s.agents.get_mut(&task.id) {
            agent.status = WorkspaceStatus::Verifying;
        }
    })?;
    let report = ctx.verifier.verify(&workspace.path).await?;
    if report.passed {
        ctx.state.update(&mut |s| {
            if let Some(agent) = s.agents.get_mut(&task.id) {
                agent.status = WorkspaceStatus::Passed;
            }
        })?;
        Ok(TaskOutcome::Passed)
    } else {
        Ok(TaskOutcome::Failed(format!(
            "verification failed: {}",
            report.summary
        )))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::path::Path;
    use std::process::Command;

    use async_trait::async_trait;
    use tempfile::TempDir;

    use foreman_core::state::MemoryStateStore;
    use foreman_core::types::TaskStatus;

    use crate::task_source::MemoryTaskSource;
    use crate::verifier::VerificationReport;

    fn sh_git(dir: &Path, args: &[&str]) -> String {
        let out = Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .unwrap_or_else(|e| panic!("git {args:?}: {e}"));
        assert!(
            out.status.success(),
            "git {args:?}: {}",
            String::from_utf8_lossy(&out.stderr)
        );
        String::from_utf8_lossy(&out.stdout).trim().to_string()
    }

    fn init_repo(dir: &Path) {
        sh_git(dir, &["init", "--initial-branch=main"]);
        sh_git(dir, &["config", "user.name", "test"]);
        sh_git(dir, &["config", "user.email", "test@example.com"]);
        std::fs::write(dir.join("README.md"), "seed\n").unwrap();
        sh_git(dir, &["add", "-A"]);
        sh_git(dir, &["commit", "-m", "initial"]);
    }

    /// Writes a fixed file per task instead of calling a real generator.
    struct ScriptedInvoker {
        scripts: HashMap<TaskId, (String, String)>,
        fail: HashSet<TaskId>,
    }

    impl ScriptedInvoker {
        fn new() -> Self {
            Self {
                scripts: HashMap::new(),
                fail: HashSet::new(),
            }
        }

        fn writes(mut self, task: &str, file: &str, content: &str) -> Self {
            self.scripts
                .insert(TaskId::from(task), (file.to_string(), content.to_string()));
            self
        }

        fn fails(mut self, task: &str) -> Self {
            self.fail.insert(TaskId::from(task));
            self
        }
    }

    #[async_trait]
    impl GenerationInvoker for ScriptedInvoker {
        async fn generate(
            &self,
            task: &Task,
            workspace: &Path,
        ) -> Result<GenerationOutcome, EngineError> {
            let mut touched = Vec::new();
            if let Some((file, content)) = self.scripts.get(&task.id) {
                std::fs::write(workspace.join(file), content).unwrap();
                touched.push(file.clone());
            }
            Ok(GenerationOutcome {
                success: !self.fail.contains(&task.id),
                touched_files: touched,
                prompt_hash: foreman_provenance::hash_prompt(&task.title),
                context_hash: "ctx".to_string(),
                model: "scripted".to_string(),
            })
        }
    }

    struct AlwaysPass;

    #[async_trait]
    impl VerificationRunner for AlwaysPass {
        async fn verify(&self, _workspace: &Path) -> Result<VerificationReport, EngineError> {
            Ok(VerificationReport::passed("ok"))
        }
    }

    /// Fails workspaces whose path contains the given needle.
    struct FailFor(&'static str);

    #[async_trait]
    impl VerificationRunner for FailFor {
        async fn verify(&self, workspace: &Path) -> Result<VerificationReport, EngineError> {
            if workspace.to_string_lossy().contains(self.0) {
                Ok(VerificationReport::failed(Some(1), "tests failed"))
            } else {
                Ok(VerificationReport::passed("ok"))
            }
        }
    }

    struct Fixture {
        _dir: TempDir,
        root: PathBuf,
        state: Arc<MemoryStateStore>,
        tasks: Arc<MemoryTaskSource>,
    }

    fn fixture(tasks: Vec<Task>) -> Fixture {
        let dir = TempDir::new().unwrap();
        init_repo(dir.path());
        Fixture {
            root: dir.path().to_path_buf(),
            _dir: dir,
            state: Arc::new(MemoryStateStore::new()),
            tasks: Arc::new(MemoryTaskSource::new(tasks)),
        }
    }

    fn orchestrator(
        fixture: &Fixture,
        config: EngineConfig,
        invoker: impl GenerationInvoker + 'static,
        verifier: impl VerificationRunner + 'static,
    ) -> Orchestrator {
        Orchestrator::new(
            fixture.root.clone(),
            config,
            fixture.state.clone(),
            fixture.tasks.clone(),
            Arc::new(invoker),
            Arc::new(verifier),
        )
    }

    fn status_of(fixture: &Fixture, id: &str) -> TaskStatus {
        fixture
            .tasks
            .snapshot()
            .into_iter()
            .find(|t| t.id == TaskId::from(id))
            .unwrap()
            .status
    }

    #[tokio::test]
    async fn single_task_flows_through_to_trunk() {
        let fx = fixture(vec![Task::new("A", "add a file")]);
        let orch = orchestrator(
            &fx,
            EngineConfig::default(),
            ScriptedInvoker::new().writes("A", "a.txt", "from A\n"),
            AlwaysPass,
        );

        let summary = orch.run(None).await.unwrap();

        assert_eq!(summary.halt, HaltReason::Completed);
        assert_eq!(summary.merged_count(), 1);
        assert_eq!(status_of(&fx, "A"), TaskStatus::Merged);
        assert_eq!(
            std::fs::read_to_string(fx.root.join("a.txt")).unwrap(),
            "from A\n"
        );

        let state = fx.state.load().unwrap();
        assert!(state.agents.is_empty(), "merged agent is released");
        assert_eq!(state.metrics.total_merges, 1);
        assert_eq!(state.metrics.completed_tasks, 1);
        assert_eq!(
            orch.ledger().for_task(&TaskId::from("A")).unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn dependent_task_waits_for_parent_merge() {
        let fx = fixture(vec![
            Task::new("A", "first"),
            Task::new("B", "second").with_deps(vec![TaskId::from("A")]),
        ]);
        let orch = orchestrator(
            &fx,
            EngineConfig::default(),
            ScriptedInvoker::new()
                .writes("A", "a.txt", "a\n")
                .writes("B", "b.txt", "b\n"),
            AlwaysPass,
        );

        let summary = orch.run(None).await.unwrap();

        assert_eq!(summary.halt, HaltReason::Completed);
        assert_eq!(summary.batches.len(), 2, "B must wait for a later batch");
        assert_eq!(summary.batches[0].dispatched, vec![TaskId::from("A")]);
        assert_eq!(summary.batches[1].dispatched, vec![TaskId::from("B")]);
        assert_eq!(status_of(&fx, "B"), TaskStatus::Merged);
        assert!(fx.root.join("b.txt").exists());
    }

    #[tokio::test]
    async fn conflict_with_stop_on_conflict_halts_batch_merges() {
        let fx = fixture(vec![
            Task::new("A", "writes shared"),
            Task::new("B", "also writes shared"),
            Task::new("C", "independent"),
        ]);
        let orch = orchestrator(
            &fx,
            EngineConfig::default(),
            ScriptedInvoker::new()
                .writes("A", "shared.txt", "A version\n")
                .writes("B", "shared.txt", "B version\n")
                .writes("C", "c.txt", "c\n"),
            AlwaysPass,
        );

        let summary = orch.run(Some(1)).await.unwrap();
        let batch = &summary.batches[0];

        assert_eq!(batch.merged, vec![TaskId::from("A")]);
        assert_eq!(batch.failed, vec![TaskId::from("B")]);
        assert_eq!(batch.skipped, vec![TaskId::from("C")]);
        assert_eq!(
            std::fs::read_to_string(fx.root.join("shared.txt")).unwrap(),
            "A version\n"
        );
        assert!(!fx.root.join("c.txt").exists(), "merge halted before C");
        assert_eq!(status_of(&fx, "B"), TaskStatus::Failed);
        assert_eq!(status_of(&fx, "C"), TaskStatus::Pending);
    }

    #[tokio::test]
    async fn conflict_with_skip_and_continue_merges_survivors() {
        let fx = fixture(vec![
            Task::new("A", "writes shared"),
            Task::new("B", "also writes shared"),
            Task::new("C", "independent"),
        ]);
        let config = EngineConfig {
            merge_policy: MergePolicy::SkipAndContinue,
            ..EngineConfig::default()
        };
        let orch = orchestrator(
            &fx,
            config,
            ScriptedInvoker::new()
                .writes("A", "shared.txt", "A version\n")
                .writes("B", "shared.txt", "B version\n")
                .writes("C", "c.txt", "c\n"),
            AlwaysPass,
        );

        let summary = orch.run(Some(1)).await.unwrap();
        let batch = &summary.batches[0];

        assert_eq!(batch.merged, vec![TaskId::from("A"), TaskId::from("C")]);
        assert_eq!(batch.failed, vec![TaskId::from("B")]);
        assert!(batch.skipped.is_empty());
        assert_eq!(
            std::fs::read_to_string(fx.root.join("c.txt")).unwrap(),
            "c\n"
        );
        assert_eq!(status_of(&fx, "B"), TaskStatus::Failed);
    }

    #[tokio::test]
    async fn skipped_task_keeps_its_retry_budget() {
        let fx = fixture(vec![
            Task::new("A", "writes shared"),
            Task::new("B", "also writes shared"),
            Task::new("C", "independent"),
        ]);
        let config = EngineConfig {
            max_task_retries: 0,
            ..EngineConfig::default()
        };
        let orch = orchestrator(
            &fx,
            config,
            ScriptedInvoker::new()
                .writes("A", "shared.txt", "A version\n")
                .writes("B", "shared.txt", "B version\n")
                .writes("C", "c.txt", "c\n"),
            AlwaysPass,
        );

        let summary = orch.run(None).await.unwrap();

        // C was skipped behind B's conflict in batch one; with no retries to
        // spare it must still be admitted and merged in batch two.
        assert_eq!(summary.halt, HaltReason::Completed);
        assert_eq!(summary.batches[0].skipped, vec![TaskId::from("C")]);
        assert_eq!(summary.batches[1].merged, vec![TaskId::from("C")]);
        assert_eq!(status_of(&fx, "C"), TaskStatus::Merged);
    }

    #[tokio::test]
    async fn allocation_failure_resolves_the_breaker_attempt() {
        // No git repo: allocation fails before any task work starts.
        let dir = TempDir::new().unwrap();
        let fx = Fixture {
            root: dir.path().to_path_buf(),
            _dir: dir,
            state: Arc::new(MemoryStateStore::new()),
            tasks: Arc::new(MemoryTaskSource::new(vec![Task::new("A", "stillborn")])),
        };
        let orch = orchestrator(
            &fx,
            EngineConfig::default(),
            ScriptedInvoker::new(),
            AlwaysPass,
        );

        let summary = orch.run(Some(1)).await.unwrap();

        assert_eq!(summary.batches[0].failed, vec![TaskId::from("A")]);
        let state = fx.state.load().unwrap();
        let record = state
            .breaker(&foreman_core::types::BreakerName::from("generation"))
            .unwrap();
        assert_eq!(record.failures, 1);
        assert!(!record.trial_in_flight);
    }

    #[tokio::test]
    async fn verification_failure_blocks_merge_and_retains_workspace() {
        let fx = fixture(vec![Task::new("A", "bad work")]);
        let orch = orchestrator(
            &fx,
            EngineConfig::default(),
            ScriptedInvoker::new().writes("A", "a.txt", "broken\n"),
            FailFor("A"),
        );

        let summary = orch.run(Some(1)).await.unwrap();

        assert_eq!(summary.merged_count(), 0);
        assert!(!fx.root.join("a.txt").exists());
        assert!(
            fx.root.join(".worktrees").join("A").exists(),
            "failed workspace is kept for inspection"
        );
        let state = fx.state.load().unwrap();
        let agent = state.agents.get(&TaskId::from("A")).unwrap();
        assert_eq!(agent.status, WorkspaceStatus::Failed);
        assert!(agent.error.as_deref().unwrap().contains("verification"));
    }

    #[tokio::test]
    async fn generation_failure_feeds_breaker_and_ledger() {
        let fx = fixture(vec![Task::new("A", "never works")]);
        let orch = orchestrator(
            &fx,
            EngineConfig::default(),
            ScriptedInvoker::new().fails("A"),
            AlwaysPass,
        );

        let summary = orch.run(Some(1)).await.unwrap();

        assert_eq!(summary.merged_count(), 0);
        let state = fx.state.load().unwrap();
        let record = state
            .breaker(&foreman_core::types::BreakerName::from("generation"))
            .unwrap();
        assert_eq!(record.failures, 1);
        assert_eq!(state.metrics.failed_tasks, 1);

        let entries = orch.ledger().for_task(&TaskId::from("A")).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, EntryStatus::Rejected);
    }

    #[tokio::test]
    async fn failure_budget_halts_the_run() {
        let fx = fixture(vec![Task::new("A", "never works")]);
        let config = EngineConfig {
            failure_budget: 1,
            max_task_retries: 5,
            ..EngineConfig::default()
        };
        let orch = orchestrator(
            &fx,
            config,
            ScriptedInvoker::new().fails("A"),
            AlwaysPass,
        );

        let summary = orch.run(None).await.unwrap();
        assert_eq!(summary.halt, HaltReason::FailureBudget);
        assert_eq!(summary.batches.len(), 1);
    }

    #[tokio::test]
    async fn unresolvable_dependency_blocks_instead_of_spinning() {
        let fx = fixture(vec![
            Task::new("B", "waits forever").with_deps(vec![TaskId::from("missing")])
        ]);
        let orch = orchestrator(
            &fx,
            EngineConfig::default(),
            ScriptedInvoker::new(),
            AlwaysPass,
        );

        let summary = orch.run(None).await.unwrap();
        assert_eq!(summary.halt, HaltReason::Blocked);
        assert!(summary.batches.is_empty());
    }
}
