//! Copy scheduling: the priority queue, the load-adaptive admitter, and the
//! worker path that hashes, deduplicates, and copies.

mod copier;
mod load;
mod priority;
mod queue;
mod rate;
mod scheduler;

pub use load::{AdmissionWindow, LoadEvaluator, LoadLevel, LoadScore, SpeedProbe, WorkerGauge};
pub use priority::PriorityRule;
pub use queue::{PriorityQueue, PrioritizedTask};
pub use rate::TokenBucket;
pub use scheduler::TaskScheduler;

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::device::DeviceSerial;
use crate::fingerprint::Fingerprint;

/// An immutable copy request produced by discovery.
#[derive(Clone, Debug)]
pub struct CopyTask {
    pub source: PathBuf,
    pub device_serial: DeviceSerial,
    pub device_root: PathBuf,
    pub device_label: String,
    /// Size the discoverer already read; priority hints only, never refreshed
    /// on the enqueue path.
    pub size_hint: Option<u64>,
    pub is_dir: bool,
    pub enqueued_at: DateTime<Utc>,
    /// Retry generation; 0 for the first run.
    pub attempt: u32,
}

impl CopyTask {
    pub fn new(
        source: PathBuf,
        device_serial: DeviceSerial,
        device_root: PathBuf,
        device_label: String,
        size_hint: Option<u64>,
    ) -> Self {
        Self {
            source,
            device_serial,
            device_root,
            device_label,
            size_hint,
            is_dir: false,
            enqueued_at: Utc::now(),
            attempt: 0,
        }
    }
}

/// Terminal disposition of a copy task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum CopyResult {
    Success,
    Fail,
    Cancel,
}

/// The single history record covering both successful and failed copies.
#[derive(Clone, Debug, Serialize)]
pub struct CopyOutcome {
    pub source: PathBuf,
    pub destination: Option<PathBuf>,
    pub size: u64,
    pub bytes_copied: u64,
    pub result: CopyResult,
    /// Set only when this task actually wrote new content into the work area.
    pub fingerprint: Option<Fingerprint>,
    pub error: Option<String>,
}

impl CopyOutcome {
    pub fn success(
        source: PathBuf,
        destination: Option<PathBuf>,
        size: u64,
        bytes_copied: u64,
        fingerprint: Option<Fingerprint>,
    ) -> Self {
        Self {
            source,
            destination,
            size,
            bytes_copied,
            result: CopyResult::Success,
            fingerprint,
            error: None,
        }
    }

    pub fn fail(source: PathBuf, size: u64, error: String) -> Self {
        Self {
            source,
            destination: None,
            size,
            bytes_copied: 0,
            result: CopyResult::Fail,
            fingerprint: None,
            error: Some(error),
        }
    }

    pub fn cancel(source: PathBuf, reason: &str) -> Self {
        Self {
            source,
            destination: None,
            size: 0,
            bytes_copied: 0,
            result: CopyResult::Cancel,
            fingerprint: None,
            error: Some(reason.to_string()),
        }
    }
}

/// Where discovery hands its survivors; implemented by the scheduler.
pub trait TaskSink: Send + Sync {
    fn submit(&self, task: CopyTask);
}
