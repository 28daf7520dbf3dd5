//! Durable, lock-protected, atomically-written unified state.
//!
//! # Storage layout
//!
//! ```text
//! <root>/.foreman/
//!   state.json        unified state document
//!   state.json.bak    rolling backup, copied before each overwrite
//!   state.json.lock   exclusive-lock sentinel (fs2 flock)
//! ```
//!
//! # Write flow
//!
//! `save` acquires the exclusive lock, copies the current file to `.bak`,
//! serializes into a `.tmp` sibling in the same directory, forces the data
//! to stable storage with `sync_all`, then atomically renames over the
//! destination. A crash before the rename leaves the prior valid file
//! intact; a crash after it leaves the new file complete.
//!
//! `update` holds the lock for the full read-modify-write cycle so
//! concurrent writers cannot lose updates.

use std::fs::{self, File, OpenOptions};
use std::io::Write as IoWrite;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use fs2::FileExt;

use crate::error::{io_err, StateError};
use crate::types::{BreakerState, UnifiedState, STATE_VERSION};

// ---------------------------------------------------------------------------
// Paths
// ---------------------------------------------------------------------------

/// `<root>/.foreman/` — pure, no I/O.
pub fn foreman_dir(root: &Path) -> PathBuf {
    root.join(".foreman")
}

/// `<root>/.foreman/state.json` — pure, no I/O.
pub fn state_path(root: &Path) -> PathBuf {
    foreman_dir(root).join("state.json")
}

// ---------------------------------------------------------------------------
// Store interface
// ---------------------------------------------------------------------------

/// Injectable state store. The engine talks to this trait only; production
/// uses [`FileStateStore`], tests use [`MemoryStateStore`].
pub trait StateStore: Send + Sync {
    /// Current state. Never fails into the caller's lap over corruption:
    /// the file implementation falls back backup → default, logging loudly.
    fn load(&self) -> Result<UnifiedState, StateError>;

    /// Persist a full state document.
    fn save(&self, state: &UnifiedState) -> Result<(), StateError>;

    /// Read-modify-write under the store's lock. Returns the state as written.
    fn update(
        &self,
        updater: &mut dyn FnMut(&mut UnifiedState),
    ) -> Result<UnifiedState, StateError>;
}

// ---------------------------------------------------------------------------
// File-backed store
// ---------------------------------------------------------------------------

/// Lock-protected, atomically-written store over `.foreman/state.json`.
pub struct FileStateStore {
    root: PathBuf,
}

/// Exclusive flock on the `.lock` sibling. Released on drop.
struct StateLock {
    file: File,
}

impl StateLock {
    fn acquire(state_path: &Path) -> Result<Self, StateError> {
        let lock_path = state_path.with_extension("json.lock");
        if let Some(dir) = lock_path.parent() {
            fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
        }
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| io_err(&lock_path, e))?;
        file.lock_exclusive().map_err(|source| StateError::Lock {
            path: lock_path,
            source,
        })?;
        Ok(Self { file })
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        // flock releases with the descriptor; unlock explicitly anyway so a
        // long-lived guard cannot outlive its scope on exotic platforms.
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

impl FileStateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self) -> PathBuf {
        state_path(&self.root)
    }

    fn backup_path(&self) -> PathBuf {
        self.path().with_extension("json.bak")
    }

    /// Read without taking the lock. Callers must hold [`StateLock`] or
    /// accept a point-in-time snapshot.
    fn read_unlocked(&self) -> Result<UnifiedState, StateError> {
        let path = self.path();
        if path.exists() {
            match Self::parse_file(&path) {
                Ok(state) => return migrate(state),
                Err(err) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %err,
                        "state file corrupted, trying backup",
                    );
                }
            }
            let backup = self.backup_path();
            if backup.exists() {
                match Self::parse_file(&backup) {
                    Ok(state) => {
                        tracing::info!(path = %backup.display(), "recovered state from backup");
                        return migrate(state);
                    }
                    Err(err) => {
                        tracing::warn!(
                            path = %backup.display(),
                            error = %err,
                            "backup also corrupted, starting fresh",
                        );
                    }
                }
            }
        }
        Ok(UnifiedState::default())
    }

    fn parse_file(path: &Path) -> Result<UnifiedState, StateError> {
        let contents = fs::read_to_string(path).map_err(|e| io_err(path, e))?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Write without taking the lock: rolling backup, tmp sibling, fsync,
    /// atomic rename.
    fn write_unlocked(&self, state: &UnifiedState) -> Result<(), StateError> {
        let path = self.path();
        let dir = foreman_dir(&self.root);
        fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;

        if path.exists() {
            if let Err(err) = fs::copy(&path, self.backup_path()) {
                tracing::warn!(error = %err, "could not create state backup");
            }
        }

        let json = serde_json::to_string_pretty(state)?;
        let tmp = path.with_extension("json.tmp");
        let mut file = File::create(&tmp).map_err(|e| io_err(&tmp, e))?;
        file.write_all(json.as_bytes()).map_err(|e| io_err(&tmp, e))?;
        file.sync_all().map_err(|e| io_err(&tmp, e))?;
        drop(file);
        fs::rename(&tmp, &path).map_err(|e| io_err(&path, e))?;
        Ok(())
    }
}

impl StateStore for FileStateStore {
    fn load(&self) -> Result<UnifiedState, StateError> {
        let _lock = StateLock::acquire(&self.path())?;
        self.read_unlocked()
    }

    fn save(&self, state: &UnifiedState) -> Result<(), StateError> {
        let _lock = StateLock::acquire(&self.path())?;
        let mut state = state.clone();
        state.updated_at = chrono::Utc::now();
        self.write_unlocked(&state)
    }

    fn update(
        &self,
        updater: &mut dyn FnMut(&mut UnifiedState),
    ) -> Result<UnifiedState, StateError> {
        // Hold the lock across the whole read-modify-write cycle: a
        // concurrent writer between our read and write would otherwise be
        // silently overwritten.
        let _lock = StateLock::acquire(&self.path())?;
        let mut state = self.read_unlocked()?;
        updater(&mut state);
        state.updated_at = chrono::Utc::now();
        self.write_unlocked(&state)?;
        Ok(state)
    }
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// Mutex-guarded in-memory store for tests and dry runs.
#[derive(Default)]
pub struct MemoryStateStore {
    inner: Mutex<UnifiedState>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: UnifiedState) -> Self {
        Self {
            inner: Mutex::new(state),
        }
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self) -> Result<UnifiedState, StateError> {
        Ok(self
            .inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone())
    }

    fn save(&self, state: &UnifiedState) -> Result<(), StateError> {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        *guard = state.clone();
        guard.updated_at = chrono::Utc::now();
        Ok(())
    }

    fn update(
        &self,
        updater: &mut dyn FnMut(&mut UnifiedState),
    ) -> Result<UnifiedState, StateError> {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        updater(&mut guard);
        guard.updated_at = chrono::Utc::now();
        Ok(guard.clone())
    }
}

// ---------------------------------------------------------------------------
// Migration
// ---------------------------------------------------------------------------

/// Apply ordered, idempotent upgrade steps based on the stored schema
/// version. Running migrate on an already-current state is a no-op.
pub fn migrate(mut state: UnifiedState) -> Result<UnifiedState, StateError> {
    if state.version > STATE_VERSION {
        return Err(StateError::VersionTooNew {
            found: state.version,
            supported: STATE_VERSION,
        });
    }
    if state.version < 2 {
        step_v1_to_v2(&mut state);
        state.version = 2;
    }
    Ok(state)
}

/// v1 persisted breakers before the HALF_OPEN trial accounting existed.
/// A v1 record claiming HALF_OPEN without an open timestamp cannot be
/// trusted to gate a trial, so it is normalized back to CLOSED.
fn step_v1_to_v2(state: &mut UnifiedState) {
    for record in state.breakers.values_mut() {
        if record.state == BreakerState::HalfOpen && record.opened_at.is_none() {
            record.state = BreakerState::Closed;
            record.failures = 0;
            record.consecutive_successes = 0;
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    use crate::types::BreakerRecord;

    fn store(root: &TempDir) -> FileStateStore {
        FileStateStore::new(root.path())
    }

    #[test]
    fn default_state_when_file_missing() {
        let root = TempDir::new().unwrap();
        let state = store(&root).load().unwrap();
        assert_eq!(state.version, STATE_VERSION);
        assert!(state.agents.is_empty());
    }

    #[test]
    fn save_then_load_roundtrip() {
        let root = TempDir::new().unwrap();
        let s = store(&root);
        let mut state = UnifiedState::default();
        state.loop_state.iteration = 7;
        s.save(&state).unwrap();
        let loaded = s.load().unwrap();
        assert_eq!(loaded.loop_state.iteration, 7);
    }

    #[test]
    fn tmp_file_cleaned_up_after_save() {
        let root = TempDir::new().unwrap();
        let s = store(&root);
        s.save(&UnifiedState::default()).unwrap();
        let tmp = state_path(root.path()).with_extension("json.tmp");
        assert!(!tmp.exists(), "tmp must be gone after atomic rename");
    }

    #[test]
    fn rolling_backup_written_before_overwrite() {
        let root = TempDir::new().unwrap();
        let s = store(&root);
        let mut state = UnifiedState::default();
        state.loop_state.iteration = 1;
        s.save(&state).unwrap();
        state.loop_state.iteration = 2;
        s.save(&state).unwrap();

        let backup = state_path(root.path()).with_extension("json.bak");
        assert!(backup.exists());
        let backed: UnifiedState =
            serde_json::from_str(&fs::read_to_string(backup).unwrap()).unwrap();
        assert_eq!(backed.loop_state.iteration, 1, "backup holds the prior state");
    }

    #[test]
    fn corrupted_state_falls_back_to_backup() {
        let root = TempDir::new().unwrap();
        let s = store(&root);
        let mut state = UnifiedState::default();
        state.loop_state.iteration = 41;
        s.save(&state).unwrap();
        state.loop_state.iteration = 42;
        s.save(&state).unwrap(); // backup now holds iteration 41

        fs::write(state_path(root.path()), "{truncated garb").unwrap();
        let recovered = s.load().unwrap();
        assert_eq!(recovered.loop_state.iteration, 41);
    }

    #[test]
    fn both_corrupted_yields_fresh_default() {
        let root = TempDir::new().unwrap();
        let s = store(&root);
        s.save(&UnifiedState::default()).unwrap();
        s.save(&UnifiedState::default()).unwrap();
        fs::write(state_path(root.path()), "not json").unwrap();
        fs::write(
            state_path(root.path()).with_extension("json.bak"),
            "also not json",
        )
        .unwrap();
        let state = s.load().unwrap();
        assert_eq!(state.version, STATE_VERSION);
        assert_eq!(state.loop_state.iteration, 0);
    }

    #[test]
    fn crash_before_rename_leaves_prior_file_intact() {
        let root = TempDir::new().unwrap();
        let s = store(&root);
        let mut state = UnifiedState::default();
        state.loop_state.iteration = 9;
        s.save(&state).unwrap();

        // A crash mid-write is a tmp sibling that never got renamed.
        let stray = state_path(root.path()).with_extension("json.tmp");
        fs::write(&stray, "{\"version\": half-writ").unwrap();

        let loaded = s.load().unwrap();
        assert_eq!(loaded.loop_state.iteration, 9, "prior valid file untouched");
    }

    #[test]
    fn concurrent_updates_never_lose_increments() {
        let root = TempDir::new().unwrap();
        let s = Arc::new(store(&root));
        s.save(&UnifiedState::default()).unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let s = Arc::clone(&s);
            handles.push(std::thread::spawn(move || {
                s.update(&mut |state| {
                    state.loop_state.iteration += 1;
                })
                .unwrap();
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let final_state = s.load().unwrap();
        assert_eq!(
            final_state.loop_state.iteration, 8,
            "every read-modify-write must land exactly once"
        );
    }

    #[test]
    fn migrate_normalizes_untrustworthy_half_open_v1_records() {
        let mut state = UnifiedState {
            version: 1,
            ..UnifiedState::default()
        };
        state.breakers.insert(
            "generation".to_string(),
            BreakerRecord {
                state: BreakerState::HalfOpen,
                failures: 3,
                opened_at: None,
                ..BreakerRecord::default()
            },
        );

        let migrated = migrate(state).unwrap();
        assert_eq!(migrated.version, 2);
        let record = &migrated.breakers["generation"];
        assert_eq!(record.state, BreakerState::Closed);
        assert_eq!(record.failures, 0);

        // Idempotent: running again changes nothing.
        let again = migrate(migrated.clone()).unwrap();
        assert_eq!(again, migrated);
    }

    #[test]
    fn migrate_rejects_future_versions() {
        let state = UnifiedState {
            version: STATE_VERSION + 1,
            ..UnifiedState::default()
        };
        assert!(matches!(
            migrate(state),
            Err(StateError::VersionTooNew { .. })
        ));
    }

    #[test]
    fn memory_store_update_is_visible_to_load() {
        let s = MemoryStateStore::new();
        s.update(&mut |state| state.metrics.total_tasks = 5).unwrap();
        assert_eq!(s.load().unwrap().metrics.total_tasks, 5);
    }
}
