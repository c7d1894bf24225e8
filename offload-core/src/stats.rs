//! Session counters fed by the event stream; the numbers behind any
//! dashboard or summary surface.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::events::EventBus;
use crate::schedule::CopyResult;

#[derive(Default)]
struct StatsInner {
    files_discovered: AtomicU64,
    files_indexed: AtomicU64,
    duplicates: AtomicU64,
    copies_succeeded: AtomicU64,
    copies_failed: AtomicU64,
    copies_cancelled: AtomicU64,
    bytes_copied: AtomicU64,
    files_recycled: AtomicU64,
    bytes_recycled: AtomicU64,
}

/// Point-in-time view of the session counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub files_discovered: u64,
    pub files_indexed: u64,
    pub duplicates: u64,
    pub copies_succeeded: u64,
    pub copies_failed: u64,
    pub copies_cancelled: u64,
    pub bytes_copied: u64,
    pub files_recycled: u64,
    pub bytes_recycled: u64,
}

/// Event-bus subscriber aggregating discovery, copy, and recycling totals.
pub struct CopyStatistics {
    inner: Arc<StatsInner>,
}

impl CopyStatistics {
    /// Register listeners on every relevant topic and return the aggregate.
    pub fn attach(bus: &EventBus) -> Self {
        let inner = Arc::new(StatsInner::default());

        {
            let inner = inner.clone();
            bus.file_discovered().subscribe_fn(move |_| {
                inner.files_discovered.fetch_add(1, Ordering::Relaxed);
            });
        }
        {
            let inner = inner.clone();
            bus.file_indexed().subscribe_fn(move |_| {
                inner.files_indexed.fetch_add(1, Ordering::Relaxed);
            });
        }
        {
            let inner = inner.clone();
            bus.duplicate_detected().subscribe_fn(move |_| {
                inner.duplicates.fetch_add(1, Ordering::Relaxed);
            });
        }
        {
            let inner = inner.clone();
            bus.copy_completed().subscribe_fn(move |event| {
                match event.outcome.result {
                    CopyResult::Success => {
                        inner.copies_succeeded.fetch_add(1, Ordering::Relaxed);
                        inner
                            .bytes_copied
                            .fetch_add(event.outcome.bytes_copied, Ordering::Relaxed);
                    }
                    CopyResult::Fail => {
                        inner.copies_failed.fetch_add(1, Ordering::Relaxed);
                    }
                    CopyResult::Cancel => {
                        inner.copies_cancelled.fetch_add(1, Ordering::Relaxed);
                    }
                };
            });
        }
        {
            let inner = inner.clone();
            bus.files_recycled().subscribe_fn(move |event| {
                inner
                    .files_recycled
                    .fetch_add(event.files.len() as u64, Ordering::Relaxed);
                inner
                    .bytes_recycled
                    .fetch_add(event.bytes_reclaimed, Ordering::Relaxed);
            });
        }

        Self { inner }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            files_discovered: self.inner.files_discovered.load(Ordering::Relaxed),
            files_indexed: self.inner.files_indexed.load(Ordering::Relaxed),
            duplicates: self.inner.duplicates.load(Ordering::Relaxed),
            copies_succeeded: self.inner.copies_succeeded.load(Ordering::Relaxed),
            copies_failed: self.inner.copies_failed.load(Ordering::Relaxed),
            copies_cancelled: self.inner.copies_cancelled.load(Ordering::Relaxed),
            bytes_copied: self.inner.bytes_copied.load(Ordering::Relaxed),
            files_recycled: self.inner.files_recycled.load(Ordering::Relaxed),
            bytes_recycled: self.inner.bytes_recycled.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for CopyStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CopyStatistics")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}
