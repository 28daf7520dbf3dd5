//! Where tasks come from.
//!
//! The orchestrator only sees the [`TaskSource`] trait. The file-backed
//! implementation reads an ordered JSON array from `tasks.json` and writes
//! status changes back atomically; source order is dispatch order.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::debug;

use foreman_core::types::{Task, TaskId, TaskStatus};

use crate::error::{io_err, EngineError};

/// Supplies tasks and accepts status transitions.
pub trait TaskSource: Send + Sync {
    /// Tasks still awaiting dispatch, in source order.
    fn pending_tasks(&self) -> Result<Vec<Task>, EngineError>;

    /// Ids of tasks that have landed on the trunk. Dependency gating reads
    /// this set.
    fn merged_tasks(&self) -> Result<HashSet<TaskId>, EngineError>;

    fn mark_merged(&self, id: &TaskId) -> Result<(), EngineError>;

    fn mark_failed(&self, id: &TaskId) -> Result<(), EngineError>;
}

// ---------------------------------------------------------------------------
// JSON file source
// ---------------------------------------------------------------------------

/// `tasks.json` in the project root: a JSON array of tasks.
pub struct JsonTaskSource {
    path: PathBuf,
    // One writer at a time; marks are read-modify-write on the whole file.
    write_guard: Mutex<()>,
}

impl JsonTaskSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_guard: Mutex::new(()),
        }
    }

    /// `<root>/tasks.json`
    pub fn in_root(root: &Path) -> Self {
        Self::new(root.join("tasks.json"))
    }

    fn load(&self) -> Result<Vec<Task>, EngineError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let contents = std::fs::read_to_string(&self.path).map_err(|e| io_err(&self.path, e))?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Atomic write: serialize, `.tmp` sibling, rename.
    fn save(&self, tasks: &[Task]) -> Result<(), EngineError> {
        let json = serde_json::to_string_pretty(tasks)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(|e| io_err(&tmp, e))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| io_err(&self.path, e))?;
        Ok(())
    }

    fn mark(&self, id: &TaskId, status: TaskStatus) -> Result<(), EngineError> {
        let _guard = self.write_guard.lock().unwrap_or_else(|e| e.into_inner());
        let mut tasks = self.load()?;
        for task in &mut tasks {
            if task.id == *id {
                debug!(task = %id, from = %task.status, to = %status, "task status change");
                task.status = status;
            }
        }
        self.save(&tasks)
    }
}

impl TaskSource for JsonTaskSource {
    fn pending_tasks(&self) -> Result<Vec<Task>, EngineError> {
        Ok(self
            .load()?
            .into_iter()
            .filter(|t| t.status == TaskStatus::Pending)
            .collect())
    }

    fn merged_tasks(&self) -> Result<HashSet<TaskId>, EngineError> {
        Ok(self
            .load()?
            .into_iter()
            .filter(|t| t.status == TaskStatus::Merged)
            .map(|t| t.id)
            .collect())
    }

    fn mark_merged(&self, id: &TaskId) -> Result<(), EngineError> {
        self.mark(id, TaskStatus::Merged)
    }

    fn mark_failed(&self, id: &TaskId) -> Result<(), EngineError> {
        self.mark(id, TaskStatus::Failed)
    }
}

// ---------------------------------------------------------------------------
// In-memory source
// ---------------------------------------------------------------------------

/// In-memory task source for tests and embedding.
pub struct MemoryTaskSource {
    tasks: Mutex<Vec<Task>>,
}

impl MemoryTaskSource {
    pub fn new(tasks: Vec<Task>) -> Self {
        Self {
            tasks: Mutex::new(tasks),
        }
    }

    pub fn snapshot(&self) -> Vec<Task> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn mark(&self, id: &TaskId, status: TaskStatus) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        for task in tasks.iter_mut() {
            if task.id == *id {
                task.status = status;
            }
        }
    }
}

impl TaskSource for MemoryTaskSource {
    fn pending_tasks(&self) -> Result<Vec<Task>, EngineError> {
        Ok(self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|t| t.status == TaskStatus::Pending)
            .cloned()
            .collect())
    }

    fn merged_tasks(&self) -> Result<HashSet<TaskId>, EngineError> {
        Ok(self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|t| t.status == TaskStatus::Merged)
            .map(|t| t.id.clone())
            .collect())
    }

    fn mark_merged(&self, id: &TaskId) -> Result<(), EngineError> {
        self.mark(id, TaskStatus::Merged);
        Ok(())
    }

    fn mark_failed(&self, id: &TaskId) -> Result<(), EngineError> {
        self.mark(id, TaskStatus::Failed);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
