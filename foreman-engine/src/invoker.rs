//! Generation invocation behind a trait.
//!
//! The engine never generates anything itself; it shells out to an external
//! tool per task and records what came back. A timeout counts as a failed
//! invocation for breaker accounting, not as an engine error.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use foreman_core::types::Task;
use foreman_provenance::{hash_context, hash_prompt};

use crate::error::{io_err, EngineError};

/// What one generation call produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationOutcome {
    /// Whether the tool exited successfully within its timeout.
    pub success: bool,
    /// Workspace-relative files the call touched.
    pub touched_files: Vec<String>,
    pub prompt_hash: String,
    pub context_hash: String,
    pub model: String,
}

/// Runs one generation call inside a task workspace.
#[async_trait]
pub trait GenerationInvoker: Send + Sync {
    async fn generate(
        &self,
        task: &Task,
        workspace: &Path,
    ) -> Result<GenerationOutcome, EngineError>;
}

// ---------------------------------------------------------------------------
// Command invoker
// ---------------------------------------------------------------------------

/// Shells out to an external generation tool with the workspace as cwd.
///
/// The task id and title are passed through `FOREMAN_TASK_ID` /
/// `FOREMAN_TASK_TITLE`; touched files are read from `git status` afterwards.
pub struct CommandInvoker {
    program: String,
    args: Vec<String>,
    timeout: Duration,
    model: String,
}

impl CommandInvoker {
    pub fn new(
        program: impl Into<String>,
        args: Vec<String>,
        timeout: Duration,
        model: impl Into<String>,
    ) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
            model: model.into(),
        }
    }
}

#[async_trait]
impl GenerationInvoker for CommandInvoker {
    async fn generate(
        &self,
        task: &Task,
        workspace: &Path,
    ) -> Result<GenerationOutcome, EngineError> {
        let prompt = format!("{}: {}", task.id, task.title);
        let prompt_hash = hash_prompt(&prompt);
        let context_hash = hash_context(self.args.iter().map(String::as_str));

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .current_dir(workspace)
            .env("FOREMAN_TASK_ID", task.id.to_string())
            .env("FOREMAN_TASK_TITLE", &task.title)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| io_err(workspace, e))?;

        let success = match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(status) => status.map_err(|e| io_err(workspace, e))?.success(),
            Err(_) => {
                warn!(task = %task.id, timeout = ?self.timeout, "generation timed out");
                let _ = child.kill().await;
                false
            }
        };

        let touched_files = dirty_files(workspace).await;
        debug!(task = %task.id, success, touched = touched_files.len(), "generation finished");
        Ok(GenerationOutcome {
            success,
            touched_files,
            prompt_hash,
            context_hash,
            model: self.model.clone(),
        })
    }
}

/// Workspace-relative paths with uncommitted changes.
async fn dirty_files(workspace: &Path) -> Vec<String> {
    let output = Command::new("git")
        .args(["status", "--porcelain"])
        .current_dir(workspace)
        .output()
        .await;
    let Ok(output) = output else {
        return Vec::new();
    };
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter_map(|line| line.get(3..))
        .map(str::to_string)
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
