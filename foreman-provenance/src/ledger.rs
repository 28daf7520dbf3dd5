//! The on-disk ledger: append-only entries plus a task index.
//!
//! # Storage layout
//!
//! ```text
//! <root>/.foreman/provenance/
//!   <id>.json     one entry per content hash
//!   index.json    task id -> [entry ids], in record order
//! ```
//!
//! Recording the same content twice returns the existing entry; the ledger
//! never grows for a duplicate. Chains may branch: two entries sharing a
//! parent are both valid (a retry after a rejected attempt, for example).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use foreman_core::types::TaskId;

use crate::entry::{EntryDraft, EntryStatus, ParentRef, ProvenanceEntry};
use crate::error::{io_err, ProvenanceError};

const INDEX_FILE: &str = "index.json";
const LOCK_FILE: &str = "ledger.lock";

/// `<root>/.foreman/provenance/` — pure, no I/O.
pub fn provenance_dir(root: &Path) -> PathBuf {
    root.join(".foreman").join("provenance")
}

/// One defect found by [`Ledger::verify`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainBreak {
    pub id: String,
    pub reason: String,
}

/// Aggregate counts over the whole ledger.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct LedgerStats {
    pub total: usize,
    pub by_status: HashMap<String, usize>,
    pub by_model: HashMap<String, usize>,
}

type TaskIndex = HashMap<String, Vec<String>>;

/// Exclusive advisory lock over the ledger directory. Writers block on it;
/// dropping the guard releases the lock.
struct LedgerLock {
    file: std::fs::File,
}

impl LedgerLock {
    fn acquire(dir: &Path) -> Result<Self, ProvenanceError> {
        std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
        let path = dir.join(LOCK_FILE);
        let file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(&path)
            .map_err(|e| io_err(&path, e))?;
        file.lock_exclusive().map_err(|e| io_err(&path, e))?;
        Ok(Self { file })
    }
}

impl Drop for LedgerLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

/// Content-addressed provenance ledger rooted at a project directory.
pub struct Ledger {
    root: PathBuf,
}

impl Ledger {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Record a generation call. Content-identical drafts dedupe: the
    /// existing entry comes back and nothing is written.
    pub fn record(&self, draft: EntryDraft) -> Result<ProvenanceEntry, ProvenanceError> {
        // Parallel workers record concurrently; the head resolution and the
        // index read-modify-write must happen under one exclusive lock or
        // interleaved writers drop each other's index entries.
        let _lock = LedgerLock::acquire(&provenance_dir(&self.root))?;

        let parent = match draft.parent.clone() {
            ParentRef::Auto => self.head()?.map(|e| e.id),
            ParentRef::Root => None,
            ParentRef::Explicit(id) => Some(id),
        };
        let entry = ProvenanceEntry::from_draft(draft, parent);

        let path = self.entry_path(&entry.id);
        if path.exists() {
            debug!(id = %entry.id, "duplicate content, returning existing entry");
            return self.load_entry(&entry.id);
        }

        self.write_json(&path, &entry)?;

        let mut index = self.load_index()?;
        let ids = index.entry(entry.task_id.0.clone()).or_default();
        if !ids.contains(&entry.id) {
            ids.push(entry.id.clone());
        }
        self.save_index(&index)?;

        info!(id = %entry.id, task = %entry.task_id, status = %entry.status, "recorded provenance entry");
        Ok(entry)
    }

    /// Rewrite an entry's status. Content fields (and so the id) are immutable.
    pub fn mark(&self, id: &str, status: EntryStatus) -> Result<ProvenanceEntry, ProvenanceError> {
        let mut entry = self.load_entry(id)?;
        entry.status = status;
        self.write_json(&self.entry_path(id), &entry)?;
        Ok(entry)
    }

    pub fn get(&self, id: &str) -> Result<Option<ProvenanceEntry>, ProvenanceError> {
        if self.entry_path(id).exists() {
            Ok(Some(self.load_entry(id)?))
        } else {
            Ok(None)
        }
    }

    /// Entries for one task, in record order.
    pub fn for_task(&self, task_id: &TaskId) -> Result<Vec<ProvenanceEntry>, ProvenanceError> {
        let index = self.load_index()?;
        let Some(ids) = index.get(&task_id.0) else {
            return Ok(Vec::new());
        };
        ids.iter().map(|id| self.load_entry(id)).collect()
    }

    /// Entries created within `[from, to]`, oldest first. Time is metadata
    /// only; ids are unaffected by it.
    pub fn in_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<ProvenanceEntry>, ProvenanceError> {
        let mut entries: Vec<_> = self
            .all_entries()?
            .into_iter()
            .filter(|e| e.created_at >= from && e.created_at <= to)
            .collect();
        entries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(entries)
    }

    /// The chain tail: the newest entry, or `None` for an empty ledger.
    pub fn head(&self) -> Result<Option<ProvenanceEntry>, ProvenanceError> {
        Ok(self
            .all_entries()?
            .into_iter()
            .max_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id))))
    }

    /// Walk every entry, recompute its id from content, and resolve its
    /// parent. Returns all breaks found rather than failing on the first.
    pub fn verify(&self) -> Result<Vec<ChainBreak>, ProvenanceError> {
        let dir = provenance_dir(&self.root);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut breaks = Vec::new();
        let mut known = std::collections::HashSet::new();
        let mut entries = Vec::new();

        for (stem, result) in self.read_entry_files(&dir)? {
            match result {
                Ok(entry) => {
                    known.insert(entry.id.clone());
                    entries.push((stem, entry));
                }
                Err(e) => breaks.push(ChainBreak {
                    id: stem,
                    reason: format!("unreadable entry: {e}"),
                }),
            }
        }

        for (stem, entry) in &entries {
            if *stem != entry.id {
                breaks.push(ChainBreak {
                    id: stem.clone(),
                    reason: format!("filename does not match stored id {}", entry.id),
                });
            }
            let recomputed = entry.recomputed_id();
            if recomputed != entry.id {
                breaks.push(ChainBreak {
                    id: entry.id.clone(),
                    reason: format!("content hash mismatch, recomputed {recomputed}"),
                });
            }
            if let Some(parent) = &entry.parent {
                if !known.contains(parent) {
                    breaks.push(ChainBreak {
                        id: entry.id.clone(),
                        reason: format!("parent {parent} not found"),
                    });
                }
            }
        }
        Ok(breaks)
    }

    /// Totals by status and by model.
    pub fn stats(&self) -> Result<LedgerStats, ProvenanceError> {
        let entries = self.all_entries()?;
        let mut stats = LedgerStats {
            total: entries.len(),
            ..LedgerStats::default()
        };
        for entry in &entries {
            *stats.by_status.entry(entry.status.to_string()).or_default() += 1;
            *stats.by_model.entry(entry.model.clone()).or_default() += 1;
        }
        Ok(stats)
    }

    // -- internals ----------------------------------------------------------

    fn entry_path(&self, id: &str) -> PathBuf {
        provenance_dir(&self.root).join(format!("{id}.json"))
    }

    fn load_entry(&self, id: &str) -> Result<ProvenanceEntry, ProvenanceError> {
        let path = self.entry_path(id);
        if !path.exists() {
            return Err(ProvenanceError::EntryNotFound { id: id.to_string() });
        }
        let contents = std::fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
        Ok(serde_json::from_str(&contents)?)
    }

    fn all_entries(&self) -> Result<Vec<ProvenanceEntry>, ProvenanceError> {
        let dir = provenance_dir(&self.root);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut entries = Vec::new();
        for (_, result) in self.read_entry_files(&dir)? {
            if let Ok(entry) = result {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    /// (file stem, parse result) for every non-index JSON file.
    fn read_entry_files(
        &self,
        dir: &Path,
    ) -> Result<Vec<(String, Result<ProvenanceEntry, ProvenanceError>)>, ProvenanceError> {
        let mut out = Vec::new();
        for entry in std::fs::read_dir(dir).map_err(|e| io_err(dir, e))? {
            let entry = entry.map_err(|e| io_err(dir, e))?;
            let path = entry.path();
            if path.extension().map_or(true, |ext| ext != "json") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if stem == "index" {
                continue;
            }
            let result = std::fs::read_to_string(&path)
                .map_err(|e| io_err(&path, e))
                .and_then(|contents| Ok(serde_json::from_str(&contents)?));
            out.push((stem.to_string(), result));
        }
        Ok(out)
    }

    fn load_index(&self) -> Result<TaskIndex, ProvenanceError> {
        let path = provenance_dir(&self.root).join(INDEX_FILE);
        if !path.exists() {
            return Ok(TaskIndex::new());
        }
        let contents = std::fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
        Ok(serde_json::from_str(&contents)?)
    }

    fn save_index(&self, index: &TaskIndex) -> Result<(), ProvenanceError> {
        let path = provenance_dir(&self.root).join(INDEX_FILE);
        self.write_json(&path, index)
    }

    /// Atomic write: serialize, `.tmp` sibling, rename.
    fn write_json<T: Serialize>(&self, path: &Path, value: &T) -> Result<(), ProvenanceError> {
        let dir = provenance_dir(&self.root);
        std::fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(value)?;
        std::fs::write(&tmp, json).map_err(|e| io_err(&tmp, e))?;
        std::fs::rename(&tmp, path).map_err(|e| io_err(path, e))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    use crate::entry::hash_prompt;

    fn draft(task: &str, prompt: &str) -> EntryDraft {
        EntryDraft::new(TaskId::from(task), hash_prompt(prompt), "ctx", "model-a")
            .touched(vec!["src/lib.rs".to_string()])
    }

    #[test]
    fn identical_content_dedupes() {
        let root = TempDir::new().unwrap();
        let ledger = Ledger::new(root.path());

        let first = ledger.record(draft("T-1", "do it")).unwrap();
        // Same content again; Root matches the first entry's resolved parent.
        let second = ledger
            .record(draft("T-1", "do it").with_parent(ParentRef::Root))
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(ledger.for_task(&TaskId::from("T-1")).unwrap().len(), 1);
        assert_eq!(ledger.stats().unwrap().total, 1);
    }

    #[test]
    fn entries_chain_onto_the_head() {
        let root = TempDir::new().unwrap();
        let ledger = Ledger::new(root.path());

        let first = ledger.record(draft("T-1", "one")).unwrap();
        assert_eq!(first.parent, None);
        let second = ledger.record(draft("T-2", "two")).unwrap();
        assert_eq!(second.parent.as_deref(), Some(first.id.as_str()));
        assert_eq!(ledger.head().unwrap().unwrap().id, second.id);
    }

    #[test]
    fn chains_may_branch_from_a_shared_parent() {
        let root = TempDir::new().unwrap();
        let ledger = Ledger::new(root.path());

        let base = ledger.record(draft("T-1", "base")).unwrap();
        let left = ledger
            .record(draft("T-2", "left").with_parent(ParentRef::Explicit(base.id.clone())))
            .unwrap();
        let right = ledger
            .record(draft("T-3", "right").with_parent(ParentRef::Explicit(base.id.clone())))
            .unwrap();

        assert_ne!(left.id, right.id);
        assert!(ledger.verify().unwrap().is_empty());
    }

    #[test]
    fn verify_reports_tampered_entry() {
        let root = TempDir::new().unwrap();
        let ledger = Ledger::new(root.path());
        let entry = ledger.record(draft("T-1", "honest")).unwrap();

        let path = provenance_dir(root.path()).join(format!("{}.json", entry.id));
        let doctored = std::fs::read_to_string(&path)
            .unwrap()
            .replace("model-a", "model-z");
        std::fs::write(&path, doctored).unwrap();

        let breaks = ledger.verify().unwrap();
        assert_eq!(breaks.len(), 1);
        assert_eq!(breaks[0].id, entry.id);
        assert!(breaks[0].reason.contains("content hash mismatch"));
    }

    #[test]
    fn verify_reports_missing_parent() {
        let root = TempDir::new().unwrap();
        let ledger = Ledger::new(root.path());
        let first = ledger.record(draft("T-1", "one")).unwrap();
        let second = ledger.record(draft("T-2", "two")).unwrap();

        std::fs::remove_file(provenance_dir(root.path()).join(format!("{}.json", first.id)))
            .unwrap();

        let breaks = ledger.verify().unwrap();
        assert!(breaks
            .iter()
            .any(|b| b.id == second.id && b.reason.contains("parent")));
    }

    #[test]
    fn concurrent_records_keep_every_index_entry() {
        use std::sync::{Arc, Barrier};

        let root = TempDir::new().unwrap();
        let ledger = Arc::new(Ledger::new(root.path()));
        let threads = 16;
        let barrier = Arc::new(Barrier::new(threads));

        let handles: Vec<_> = (0..threads)
            .map(|i| {
                let ledger = Arc::clone(&ledger);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    ledger
                        .record(draft("T-1", &format!("attempt {i}")))
                        .unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(ledger.for_task(&TaskId::from("T-1")).unwrap().len(), threads);
        assert_eq!(ledger.stats().unwrap().total, threads);
        assert!(ledger.verify().unwrap().is_empty());
    }

    #[test]
    fn for_task_preserves_record_order() {
        let root = TempDir::new().unwrap();
        let ledger = Ledger::new(root.path());
        let a = ledger.record(draft("T-1", "first attempt")).unwrap();
        let b = ledger.record(draft("T-1", "second attempt")).unwrap();

        let entries = ledger.for_task(&TaskId::from("T-1")).unwrap();
        assert_eq!(
            entries.iter().map(|e| e.id.clone()).collect::<Vec<_>>(),
            vec![a.id, b.id]
        );
    }

    #[test]
    fn in_range_filters_on_created_at() {
        let root = TempDir::new().unwrap();
        let ledger = Ledger::new(root.path());
        let before = Utc::now();
        ledger.record(draft("T-1", "now")).unwrap();
        let after = Utc::now();

        assert_eq!(ledger.in_range(before, after).unwrap().len(), 1);
        assert!(ledger
            .in_range(after + chrono::Duration::seconds(1), after + chrono::Duration::seconds(2))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn mark_changes_status_but_not_id() {
        let root = TempDir::new().unwrap();
        let ledger = Ledger::new(root.path());
        let entry = ledger.record(draft("T-1", "try")).unwrap();

        let marked = ledger.mark(&entry.id, EntryStatus::Accepted).unwrap();
        assert_eq!(marked.id, entry.id);
        assert_eq!(marked.status, EntryStatus::Accepted);
        assert!(ledger.verify().unwrap().is_empty());
    }

    #[test]
    fn stats_count_by_status_and_model() {
        let root = TempDir::new().unwrap();
        let ledger = Ledger::new(root.path());
        let a = ledger.record(draft("T-1", "one")).unwrap();
        ledger
            .record(draft("T-2", "two").with_status(EntryStatus::Rejected))
            .unwrap();
        ledger.mark(&a.id, EntryStatus::Accepted).unwrap();

        let stats = ledger.stats().unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.by_status.get("accepted"), Some(&1));
        assert_eq!(stats.by_status.get("rejected"), Some(&1));
        assert_eq!(stats.by_model.get("model-a"), Some(&2));
    }
}
