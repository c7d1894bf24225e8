use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use dashmap::DashSet;

use super::Fingerprint;
use crate::events::{DuplicateDetected, EventBus, FileIndexed};

/// Concurrent set of content fingerprints with a dirty flag driving periodic
/// persistence.
///
/// `insert` is linearizable (one atomic set insert); the dirty flag is set on
/// every mutation and cleared only by a successful save.
pub struct FingerprintIndex {
    set: DashSet<Fingerprint>,
    dirty: AtomicBool,
    duplicates: AtomicU64,
    bus: Arc<EventBus>,
}

impl FingerprintIndex {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            set: DashSet::new(),
            dirty: AtomicBool::new(false),
            duplicates: AtomicU64::new(0),
            bus,
        }
    }

    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        self.set.contains(fingerprint)
    }

    /// Insert a fingerprint; returns whether it was new. New entries mark the
    /// index dirty.
    pub fn insert(&self, fingerprint: Fingerprint) -> bool {
        let inserted = self.set.insert(fingerprint);
        if inserted {
            self.dirty.store(true, Ordering::Release);
        }
        inserted
    }

    /// Insert without touching the dirty flag; used when reading persisted
    /// state back in.
    pub(super) fn insert_loaded(&self, fingerprint: Fingerprint) -> bool {
        self.set.insert(fingerprint)
    }

    /// Record freshly copied content. Emits a [`FileIndexed`] event when the
    /// fingerprint was new; returns whether it was.
    pub fn record_file(&self, fingerprint: Fingerprint, path: &Path, size: u64) -> bool {
        let inserted = self.insert(fingerprint);
        if inserted {
            self.bus.file_indexed().publish(&FileIndexed::new(
                fingerprint,
                path.to_path_buf(),
                size,
                self.len(),
            ));
        }
        inserted
    }

    /// Check whether `fingerprint` is already known; emits a
    /// [`DuplicateDetected`] event when it is.
    pub fn check_duplicate(&self, path: &Path, fingerprint: &Fingerprint) -> bool {
        if self.contains(fingerprint) {
            self.note_duplicate(path, fingerprint);
            true
        } else {
            false
        }
    }

    /// Emit a duplicate sighting unconditionally (used when another worker is
    /// already building the same content).
    pub fn note_duplicate(&self, path: &Path, fingerprint: &Fingerprint) {
        let count = self.duplicates.fetch_add(1, Ordering::Relaxed) + 1;
        self.bus.duplicate_detected().publish(&DuplicateDetected::new(
            *fingerprint,
            path.to_path_buf(),
            count,
        ));
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Duplicate sightings since startup.
    pub fn duplicate_count(&self) -> u64 {
        self.duplicates.load(Ordering::Relaxed)
    }

    /// Explicitly drop every entry. The index is dirty afterwards so the next
    /// persistence tick rewrites the (now empty) file.
    pub fn reset(&self) {
        self.set.clear();
        self.dirty.store(true, Ordering::Release);
    }

    pub(super) fn clear_loaded(&self) {
        self.set.clear();
    }

    /// Claim the dirty flag for a save attempt. Returns whether a save is
    /// needed; the caller must call [`Self::mark_dirty`] if the save fails.
    pub(super) fn begin_save(&self) -> bool {
        self.dirty.swap(false, Ordering::AcqRel)
    }

    pub(super) fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub fn snapshot(&self) -> Vec<Fingerprint> {
        self.set.iter().map(|entry| *entry).collect()
    }

    pub(crate) fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }
}

impl fmt::Debug for FingerprintIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FingerprintIndex")
            .field("entries", &self.len())
            .field("dirty", &self.is_dirty())
            .field("duplicates", &self.duplicate_count())
            .finish()
    }
}
