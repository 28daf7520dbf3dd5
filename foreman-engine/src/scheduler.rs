//! Dependency-gated batch selection.
//!
//! Pure function of the pending list and the merged set: a task is ready
//! when every dependency has merged. Selection preserves source order and
//! never exceeds the parallelism limit.

use std::collections::HashSet;

use foreman_core::types::{Task, TaskId};

/// Up to `limit` ready tasks, in source order.
pub fn ready_tasks(pending: &[Task], merged: &HashSet<TaskId>, limit: usize) -> Vec<Task> {
    pending
        .iter()
        .filter(|task| task.depends_on.iter().all(|dep| merged.contains(dep)))
        .take(limit)
        .cloned()
        .collect()
}

/// True when no pending task can ever become ready: every remaining task
/// waits on a dependency that is neither merged nor pending.
pub fn is_deadlocked(pending: &[Task], merged: &HashSet<TaskId>) -> bool {
    if pending.is_empty() {
        return false;
    }
    let pending_ids: HashSet<&TaskId> = pending.iter().map(|t| &t.id).collect();
    pending.iter().all(|task| {
        task.depends_on
            .iter()
            .any(|dep| !merged.contains(dep) && !pending_ids.contains(dep))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tasks() -> Vec<Task> {
        vec![
            Task::new("A", "a"),
            Task::new("B", "b").with_deps(vec![TaskId::from("A")]),
            Task::new("C", "c"),
        ]
    }

    #[test]
    fn unmet_dependency_never_selected() {
        let merged = HashSet::new();
        let ready = ready_tasks(&tasks(), &merged, 10);
        let ids: Vec<_> = ready.iter().map(|t| t.id.0.as_str()).collect();
        assert_eq!(ids, vec!["A", "C"]);
    }

    #[test]
    fn dependency_met_after_merge() {
        let merged: HashSet<_> = [TaskId::from("A")].into();
        let pending = vec![Task::new("B", "b").with_deps(vec![TaskId::from("A")])];
        assert_eq!(ready_tasks(&pending, &merged, 10).len(), 1);
    }

    #[test]
    fn limit_respected_in_source_order() {
        let merged = HashSet::new();
        let ready = ready_tasks(&tasks(), &merged, 1);
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].id, TaskId::from("A"));
    }

    #[test]
    fn detects_unresolvable_dependency() {
        let merged = HashSet::new();
        let pending = vec![Task::new("B", "b").with_deps(vec![TaskId::from("gone")])];
        assert!(is_deadlocked(&pending, &merged));
        assert!(!is_deadlocked(&tasks(), &merged));
        assert!(!is_deadlocked(&[], &merged));
    }
}
