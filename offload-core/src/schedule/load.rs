use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use offload_config::{SettingsRegistry, settings};
use serde::Serialize;

use super::PriorityQueue;
use crate::clock::Clock;

/// Coarse load bucket controlling admission caps.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum LoadLevel {
    Low,
    Medium,
    High,
}

/// Composite load score plus its band.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct LoadScore {
    pub score: u8,
    pub level: LoadLevel,
}

impl LoadScore {
    pub fn from_score(raw: f64) -> Self {
        let score = raw.clamp(0.0, 100.0).round() as u8;
        let level = match score {
            0..=40 => LoadLevel::Low,
            41..=70 => LoadLevel::Medium,
            _ => LoadLevel::High,
        };
        Self { score, level }
    }
}

/// Lock-light aggregate copy-throughput probe.
///
/// `record` keeps a running atomic total plus a short window of samples;
/// under concurrent recording the total matches the recorded sum, while the
/// windowed speed tolerates small merge-timing skew.
pub struct SpeedProbe {
    total: AtomicU64,
    samples: Mutex<VecDeque<(Instant, u64)>>,
    window: Duration,
    clock: Arc<dyn Clock>,
}

impl SpeedProbe {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_window(clock, Duration::from_secs(10))
    }

    pub fn with_window(clock: Arc<dyn Clock>, window: Duration) -> Self {
        Self {
            total: AtomicU64::new(0),
            samples: Mutex::new(VecDeque::new()),
            window,
            clock,
        }
    }

    /// Record copied bytes. Zero-byte records are ignored.
    pub fn record(&self, bytes: u64) {
        if bytes == 0 {
            return;
        }
        self.total.fetch_add(bytes, Ordering::Relaxed);
        let now = self.clock.now();
        let mut samples = self.samples.lock().expect("speed probe poisoned");
        samples.push_back((now, bytes));
        Self::prune(&mut samples, now, self.window);
    }

    pub fn total_bytes(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Bytes per second over the sampling window; never negative.
    pub fn speed(&self) -> f64 {
        let now = self.clock.now();
        let mut samples = self.samples.lock().expect("speed probe poisoned");
        Self::prune(&mut samples, now, self.window);
        let sum: u64 = samples.iter().map(|(_, bytes)| bytes).sum();
        sum as f64 / self.window.as_secs_f64()
    }

    fn prune(samples: &mut VecDeque<(Instant, u64)>, now: Instant, window: Duration) {
        while let Some((at, _)) = samples.front() {
            if now.duration_since(*at) > window {
                samples.pop_front();
            } else {
                break;
            }
        }
    }
}

impl fmt::Debug for SpeedProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpeedProbe")
            .field("total_bytes", &self.total_bytes())
            .finish_non_exhaustive()
    }
}

/// Active/total copy worker accounting.
#[derive(Debug)]
pub struct WorkerGauge {
    active: AtomicUsize,
    total: usize,
}

impl WorkerGauge {
    pub fn new(total: usize) -> Self {
        Self {
            active: AtomicUsize::new(0),
            total: total.max(1),
        }
    }

    pub fn acquire(&self) {
        self.active.fetch_add(1, Ordering::AcqRel);
    }

    pub fn release(&self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn total(&self) -> usize {
        self.total
    }
}

/// Sliding window of admission decisions for the rejection-ratio component.
pub struct AdmissionWindow {
    decisions: Mutex<VecDeque<(Instant, bool)>>,
    window: Duration,
    clock: Arc<dyn Clock>,
}

impl AdmissionWindow {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_window(clock, Duration::from_secs(60))
    }

    pub fn with_window(clock: Arc<dyn Clock>, window: Duration) -> Self {
        Self {
            decisions: Mutex::new(VecDeque::new()),
            window,
            clock,
        }
    }

    pub fn record(&self, admitted: bool) {
        let now = self.clock.now();
        let mut decisions = self.decisions.lock().expect("admission window poisoned");
        decisions.push_back((now, admitted));
        Self::prune(&mut decisions, now, self.window);
    }

    /// `rejected / offered` over the window; `None` with no offers.
    pub fn rejection_ratio(&self) -> Option<f64> {
        let now = self.clock.now();
        let mut decisions = self.decisions.lock().expect("admission window poisoned");
        Self::prune(&mut decisions, now, self.window);
        if decisions.is_empty() {
            return None;
        }
        let rejected = decisions.iter().filter(|(_, admitted)| !admitted).count();
        Some(rejected as f64 / decisions.len() as f64)
    }

    fn prune(decisions: &mut VecDeque<(Instant, bool)>, now: Instant, window: Duration) {
        while let Some((at, _)) = decisions.front() {
            if now.duration_since(*at) > window {
                decisions.pop_front();
            } else {
                break;
            }
        }
    }
}

impl fmt::Debug for AdmissionWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionWindow").finish_non_exhaustive()
    }
}

const WEIGHT_QUEUE_DEPTH: f64 = 0.35;
const WEIGHT_COPY_SPEED: f64 = 0.25;
const WEIGHT_WORKER_ACTIVITY: f64 = 0.25;
const WEIGHT_REJECTIONS: f64 = 0.15;

/// Weighted composite of queue depth, throughput, worker activity, and
/// admission rejections. Missing metrics contribute zero.
pub struct LoadEvaluator {
    queue: Arc<PriorityQueue>,
    speed: Arc<SpeedProbe>,
    workers: Arc<WorkerGauge>,
    admissions: Arc<AdmissionWindow>,
    settings: Arc<SettingsRegistry>,
}

impl LoadEvaluator {
    pub fn new(
        queue: Arc<PriorityQueue>,
        speed: Arc<SpeedProbe>,
        workers: Arc<WorkerGauge>,
        admissions: Arc<AdmissionWindow>,
        settings: Arc<SettingsRegistry>,
    ) -> Self {
        Self {
            queue,
            speed,
            workers,
            admissions,
            settings,
        }
    }

    pub fn evaluate(&self) -> LoadScore {
        let depth = {
            let capacity = self.queue.capacity().max(1) as f64;
            (self.queue.len() as f64 / capacity).min(1.0) * 100.0
        };

        let speed = {
            let target = self.settings.get(&settings::COPY_SPEED_TARGET_BYTES);
            if target > 0 {
                (self.speed.speed() / target as f64 * 100.0).clamp(0.0, 100.0)
            } else {
                0.0
            }
        };

        let activity =
            self.workers.active() as f64 / self.workers.total() as f64 * 100.0;

        let rejections = self
            .admissions
            .rejection_ratio()
            .map(|ratio| ratio * 100.0)
            .unwrap_or(0.0);

        LoadScore::from_score(
            depth * WEIGHT_QUEUE_DEPTH
                + speed * WEIGHT_COPY_SPEED
                + activity.min(100.0) * WEIGHT_WORKER_ACTIVITY
                + rejections * WEIGHT_REJECTIONS,
        )
    }
}

impl fmt::Debug for LoadEvaluator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadEvaluator")
            .field("queue_len", &self.queue.len())
            .field("active_workers", &self.workers.active())
            .finish_non_exhaustive()
    }
}
