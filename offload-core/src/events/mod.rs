//! Engine events and the in-process bus that fans them out.
//!
//! Every observable state change is a concrete event type with its own topic
//! on the [`EventBus`]; listeners register per class, so a statistics view
//! can watch copy completions without seeing device chatter.

mod bus;

pub use bus::{EventBus, Listener, RequestTopic, SubscriberId, Topic};

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use offload_config::settings::RecyclerStrategy;
use serde::Serialize;

use crate::device::{DeviceSnapshot, DeviceState};
use crate::fingerprint::Fingerprint;
use crate::recycle::StorageLevel;
use crate::schedule::CopyOutcome;

/// A volume with an unknown serial was mounted and is now tracked.
#[derive(Clone, Debug, Serialize)]
pub struct DeviceJoined {
    pub at: DateTime<Utc>,
    pub device: DeviceSnapshot,
}

impl DeviceJoined {
    pub fn new(device: DeviceSnapshot) -> Self {
        Self {
            at: Utc::now(),
            device,
        }
    }
}

/// A previously known (ghost) device reappeared with a mount point.
#[derive(Clone, Debug, Serialize)]
pub struct DeviceInserted {
    pub at: DateTime<Utc>,
    pub device: DeviceSnapshot,
}

impl DeviceInserted {
    pub fn new(device: DeviceSnapshot) -> Self {
        Self {
            at: Utc::now(),
            device,
        }
    }
}

/// A tracked device lost its mount point.
#[derive(Clone, Debug, Serialize)]
pub struct DeviceRemoved {
    pub at: DateTime<Utc>,
    pub device: DeviceSnapshot,
}

impl DeviceRemoved {
    pub fn new(device: DeviceSnapshot) -> Self {
        Self {
            at: Utc::now(),
            device,
        }
    }
}

/// A tracked device changed state; emitted once per transition.
#[derive(Clone, Debug, Serialize)]
pub struct DeviceStateChanged {
    pub at: DateTime<Utc>,
    pub device: DeviceSnapshot,
    pub old_state: DeviceState,
    pub new_state: DeviceState,
}

impl DeviceStateChanged {
    pub fn new(device: DeviceSnapshot, old_state: DeviceState, new_state: DeviceState) -> Self {
        Self {
            at: Utc::now(),
            device,
            old_state,
            new_state,
        }
    }
}

/// A file on a device survived the filter chain.
#[derive(Clone, Debug, Serialize)]
pub struct FileDiscovered {
    pub at: DateTime<Utc>,
    pub path: PathBuf,
    pub size: u64,
    pub device_serial: String,
}

impl FileDiscovered {
    pub fn new(path: PathBuf, size: u64, device_serial: String) -> Self {
        Self {
            at: Utc::now(),
            path,
            size,
            device_serial,
        }
    }
}

/// New content entered the fingerprint index.
#[derive(Clone, Debug, Serialize)]
pub struct FileIndexed {
    pub at: DateTime<Utc>,
    pub fingerprint: Fingerprint,
    pub path: PathBuf,
    pub size: u64,
    pub total_indexed: usize,
}

impl FileIndexed {
    pub fn new(fingerprint: Fingerprint, path: PathBuf, size: u64, total_indexed: usize) -> Self {
        Self {
            at: Utc::now(),
            fingerprint,
            path,
            size,
            total_indexed,
        }
    }
}

/// Content already known to the index (or currently being copied) was seen
/// again; `count` is the running duplicate tally for this session.
#[derive(Clone, Debug, Serialize)]
pub struct DuplicateDetected {
    pub at: DateTime<Utc>,
    pub fingerprint: Fingerprint,
    pub path: PathBuf,
    pub count: u64,
}

impl DuplicateDetected {
    pub fn new(fingerprint: Fingerprint, path: PathBuf, count: u64) -> Self {
        Self {
            at: Utc::now(),
            fingerprint,
            path,
            count,
        }
    }
}

/// Terminal outcome of a copy task; exactly one per submitted task.
#[derive(Clone, Debug, Serialize)]
pub struct CopyCompleted {
    pub at: DateTime<Utc>,
    pub outcome: CopyOutcome,
}

impl CopyCompleted {
    pub fn new(outcome: CopyOutcome) -> Self {
        Self {
            at: Utc::now(),
            outcome,
        }
    }
}

/// The fingerprint index finished loading from disk.
#[derive(Clone, Debug, Serialize)]
pub struct IndexLoaded {
    pub at: DateTime<Utc>,
    pub entries: usize,
}

impl IndexLoaded {
    pub fn new(entries: usize) -> Self {
        Self {
            at: Utc::now(),
            entries,
        }
    }
}

/// The fingerprint index was persisted.
#[derive(Clone, Debug, Serialize)]
pub struct IndexSaved {
    pub at: DateTime<Utc>,
    pub entries: usize,
}

impl IndexSaved {
    pub fn new(entries: usize) -> Self {
        Self {
            at: Utc::now(),
            entries,
        }
    }
}

/// The recycler removed a batch of empty directories from the work area.
#[derive(Clone, Debug, Serialize)]
pub struct EmptyFoldersDeleted {
    pub at: DateTime<Utc>,
    pub folders: Vec<PathBuf>,
}

impl EmptyFoldersDeleted {
    pub fn new(folders: Vec<PathBuf>) -> Self {
        Self {
            at: Utc::now(),
            folders,
        }
    }
}

/// The recycler reclaimed work-area files to restore headroom.
#[derive(Clone, Debug, Serialize)]
pub struct FilesRecycled {
    pub at: DateTime<Utc>,
    pub files: Vec<PathBuf>,
    pub strategy: RecyclerStrategy,
    pub bytes_reclaimed: u64,
}

impl FilesRecycled {
    pub fn new(files: Vec<PathBuf>, strategy: RecyclerStrategy, bytes_reclaimed: u64) -> Self {
        Self {
            at: Utc::now(),
            files,
            strategy,
            bytes_reclaimed,
        }
    }
}

/// Work-area usage crossed into a different band.
#[derive(Clone, Debug, Serialize)]
pub struct StorageLevelChanged {
    pub at: DateTime<Utc>,
    pub level: StorageLevel,
}

impl StorageLevelChanged {
    pub fn new(level: StorageLevel) -> Self {
        Self {
            at: Utc::now(),
            level,
        }
    }
}
