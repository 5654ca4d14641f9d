//! Keyed expiring record store: the pattern both caches share.
//!
//! A store owns a mutex-guarded map from lookup key to record, plus the
//! bookkeeping for its backing file (path and the modification time seen
//! at the last parse). All mutating operations serialize on the mutex
//! and no I/O happens while it is held.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::hash::Hash;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Behavior a record type must provide for the generic
/// add/merge/revoke cycle.
pub trait PolicyRecord {
    type Key: Eq + Hash + Clone;

    fn key(&self) -> Self::Key;

    /// A record that removes any stored entry for its key instead of
    /// being stored itself: zero max-age, or an empty pin set.
    fn is_revocation(&self) -> bool;

    fn expires_at(&self) -> i64;

    /// Fold a newer observation for the same key into `self`. The
    /// incoming record is consumed.
    fn merge_from(&mut self, incoming: Self);
}

/// Thread-safe map of expiring records with backing-file bookkeeping.
#[derive(Debug)]
pub struct PolicyStore<R: PolicyRecord> {
    entries: Mutex<HashMap<R::Key, R>>,
    path: Option<PathBuf>,
    /// mtime of the backing file at the last successful parse; 0 forces
    /// a re-parse on the next load.
    last_load: AtomicI64,
    /// Number of full parse passes over the backing file, observable by
    /// staleness tests.
    parse_passes: AtomicU64,
}

impl<R: PolicyRecord> PolicyStore<R> {
    /// Create an empty store. No file I/O happens until the owning cache
    /// calls its `load`.
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            path,
            last_load: AtomicI64::new(0),
            parse_passes: AtomicU64::new(0),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn lock_entries(&self) -> MutexGuard<'_, HashMap<R::Key, R>> {
        // Merges are applied in one piece, so a poisoned lock still
        // guards a consistent map.
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert, merge or revoke. The record moves into the store; a
    /// revocation removes the stored entry for the same key and is then
    /// discarded.
    pub fn add(&self, record: R) {
        let mut entries = self.lock_entries();
        if record.is_revocation() {
            entries.remove(&record.key());
            return;
        }
        match entries.entry(record.key()) {
            Entry::Occupied(mut slot) => slot.get_mut().merge_from(record),
            Entry::Vacant(slot) => {
                slot.insert(record);
            }
        }
    }

    /// Run a read-only closure against the map under a single lock
    /// acquisition, so multi-key lookups observe one consistent
    /// snapshot.
    pub fn with_entries<T>(&self, f: impl FnOnce(&HashMap<R::Key, R>) -> T) -> T {
        f(&self.lock_entries())
    }

    pub fn len(&self) -> usize {
        self.lock_entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn last_load(&self) -> &AtomicI64 {
        &self.last_load
    }

    pub fn parse_passes(&self) -> u64 {
        self.parse_passes.load(Ordering::Relaxed)
    }

    pub(crate) fn note_parse_pass(&self) {
        self.parse_passes.fetch_add(1, Ordering::Relaxed);
    }
}

impl<R: PolicyRecord + Clone> PolicyStore<R> {
    /// Clone the records that are neither revoked nor expired at `now`,
    /// releasing the lock before the caller does any I/O with them.
    pub fn snapshot_valid(&self, now: i64) -> Vec<R> {
        self.lock_entries().values().filter(|r| !r.is_revocation() && r.expires_at() >= now).cloned().collect()
    }
}
