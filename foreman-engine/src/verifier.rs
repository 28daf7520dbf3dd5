//! Verification behind a trait: did the workspace pass its checks?

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::error::{io_err, EngineError};

/// Result of one verification run. FAIL blocks merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationReport {
    pub passed: bool,
    pub exit_code: Option<i32>,
    pub summary: String,
}

impl VerificationReport {
    pub fn passed(summary: impl Into<String>) -> Self {
        Self {
            passed: true,
            exit_code: Some(0),
            summary: summary.into(),
        }
    }

    pub fn failed(exit_code: Option<i32>, summary: impl Into<String>) -> Self {
        Self {
            passed: false,
            exit_code,
            summary: summary.into(),
        }
    }
}

/// Runs the verification suite in a workspace.
#[async_trait]
pub trait VerificationRunner: Send + Sync {
    async fn verify(&self, workspace: &Path) -> Result<VerificationReport, EngineError>;
}

/// Shells out to a verification command (test suite, linter) with a timeout.
/// A timeout is a failed verification, not an engine error.
pub struct CommandRunner {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandRunner {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }
}

#[async_trait]
impl VerificationRunner for CommandRunner {
    async fn verify(&self, workspace: &Path) -> Result<VerificationReport, EngineError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .current_dir(workspace)
            .kill_on_drop(true)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .map_err(|e| io_err(workspace, e))?;

        let report = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(output) => {
                let output = output.map_err(|e| io_err(workspace, e))?;
                let summary = if output.status.success() {
                    "verification passed".to_string()
                } else {
                    String::from_utf8_lossy(&output.stderr)
                        .lines()
                        .last()
                        .unwrap_or("verification failed")
                        .to_string()
                };
                VerificationReport {
                    passed: output.status.success(),
                    exit_code: output.status.code(),
                    summary,
                }
            }
            Err(_) => VerificationReport::failed(None, format!("timed out after {:?}", self.timeout)),
        };
        debug!(workspace = %workspace.display(), passed = report.passed, "verification finished");
        Ok(report)
    }
}
