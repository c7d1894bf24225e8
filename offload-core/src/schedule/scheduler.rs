use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashSet;
use offload_config::{SettingsRegistry, settings};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::copier::{AttemptEnd, CopyContext, execute};
use super::load::{AdmissionWindow, LoadEvaluator, LoadLevel, SpeedProbe, WorkerGauge};
use super::priority::PriorityRule;
use super::queue::{PriorityQueue, PrioritizedTask};
use super::rate::TokenBucket;
use super::{CopyOutcome, CopyTask, TaskSink};
use crate::clock::Clock;
use crate::device::DeviceStatus;
use crate::error::{OffloadError, Result};
use crate::events::{CopyCompleted, EventBus};
use crate::fingerprint::{Fingerprint, FingerprintIndex};

const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);
const RETRY_MAX_DELAY: Duration = Duration::from_secs(60);

fn level_cap(level: LoadLevel, pool: usize) -> usize {
    let scaled = match level {
        LoadLevel::Low => pool as f64,
        LoadLevel::Medium => pool as f64 * 0.7,
        LoadLevel::High => pool as f64 * 0.4,
    };
    (scaled.ceil() as usize).max(1)
}

fn level_factor(level: LoadLevel) -> f64 {
    match level {
        LoadLevel::Low => 1.0,
        LoadLevel::Medium => 0.7,
        LoadLevel::High => 0.4,
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    RETRY_BASE_DELAY
        .saturating_mul(2u32.saturating_pow(attempt))
        .min(RETRY_MAX_DELAY)
}

struct SchedulerInner {
    bus: Arc<EventBus>,
    settings: Arc<SettingsRegistry>,
    index: Arc<FingerprintIndex>,
    devices: Arc<dyn DeviceStatus>,
    queue: Arc<PriorityQueue>,
    rule: PriorityRule,
    limiter: TokenBucket,
    load: Arc<LoadEvaluator>,
    speed: Arc<SpeedProbe>,
    workers: Arc<WorkerGauge>,
    admissions: Arc<AdmissionWindow>,
    in_flight: Arc<DashSet<Fingerprint>>,
    work_root: PathBuf,
    pool_size: usize,
    shutdown: CancellationToken,
    worker_done: Notify,
}

/// Load-adaptive copy scheduler: a single admitter thread pulls from the
/// priority queue under a level-scaled concurrency cap and token bucket, and
/// hands admitted tasks to the shared worker pool.
pub struct TaskScheduler {
    inner: Arc<SchedulerInner>,
    admitter: Mutex<Option<JoinHandle<()>>>,
}

impl TaskScheduler {
    /// Build the scheduler and verify the work area is writable; a work root
    /// that cannot take files is fatal at startup.
    pub fn new(
        bus: Arc<EventBus>,
        settings: Arc<SettingsRegistry>,
        index: Arc<FingerprintIndex>,
        devices: Arc<dyn DeviceStatus>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let work_root = PathBuf::from(settings.get(&settings::WORK_PATH));
        std::fs::create_dir_all(&work_root)
            .map_err(|err| OffloadError::WorkArea(format!("{}: {err}", work_root.display())))?;
        tempfile::NamedTempFile::new_in(&work_root)
            .map_err(|err| {
                OffloadError::WorkArea(format!("{} is not writable: {err}", work_root.display()))
            })?
            .close()
            .map_err(|err| OffloadError::WorkArea(err.to_string()))?;

        let configured_pool = settings.get(&settings::WORKER_POOL_SIZE);
        let pool_size = if configured_pool > 0 {
            configured_pool as usize
        } else {
            num_cpus::get()
        };

        let queue = Arc::new(PriorityQueue::new(
            settings.get(&settings::QUEUE_CAPACITY).max(1) as usize,
        ));
        let speed = Arc::new(SpeedProbe::new(clock.clone()));
        let workers = Arc::new(WorkerGauge::new(pool_size));
        let admissions = Arc::new(AdmissionWindow::new(clock.clone()));
        let load = Arc::new(LoadEvaluator::new(
            queue.clone(),
            speed.clone(),
            workers.clone(),
            admissions.clone(),
            settings.clone(),
        ));

        info!(
            pool_size,
            work_root = %work_root.display(),
            "copy scheduler initialized"
        );

        Ok(Self {
            inner: Arc::new(SchedulerInner {
                bus,
                rule: PriorityRule::new(settings.clone()),
                settings,
                index,
                devices,
                queue,
                limiter: TokenBucket::new(pool_size as f64, clock),
                load,
                speed,
                workers,
                admissions,
                in_flight: Arc::new(DashSet::new()),
                work_root,
                pool_size,
                shutdown: CancellationToken::new(),
                worker_done: Notify::new(),
            }),
            admitter: Mutex::new(None),
        })
    }

    /// Spawn the admitter loop.
    pub fn start(&self) {
        let mut admitter = self.admitter.lock().expect("admitter lock poisoned");
        if admitter.is_some() {
            return;
        }
        let inner = self.inner.clone();
        *admitter = Some(tokio::spawn(async move { admit_loop(inner).await }));
    }

    /// Cancel pending tasks, then let running workers finish (cooperatively
    /// cancelling) within the grace period.
    pub async fn stop(&self, grace: Duration) {
        self.inner.shutdown.cancel();
        for pending in self.inner.queue.drain() {
            self.inner
                .complete_cancelled(&pending.task, "scheduler shutdown");
        }

        let deadline = Instant::now() + grace;
        while self.inner.workers.active() > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        if self.inner.workers.active() > 0 {
            warn!(
                active = self.inner.workers.active(),
                "copy workers still running after grace period, abandoning"
            );
        }

        let admitter = self.admitter.lock().expect("admitter lock poisoned").take();
        if let Some(handle) = admitter {
            let _ = tokio::time::timeout(Duration::from_secs(1), handle).await;
        }
    }

    /// Current composite load reading.
    pub fn load(&self) -> Arc<LoadEvaluator> {
        self.inner.load.clone()
    }

    pub fn speed_probe(&self) -> Arc<SpeedProbe> {
        self.inner.speed.clone()
    }

    pub fn queue_len(&self) -> usize {
        self.inner.queue.len()
    }

    pub fn active_workers(&self) -> usize {
        self.inner.workers.active()
    }

    pub fn pool_size(&self) -> usize {
        self.inner.pool_size
    }
}

impl TaskSink for TaskScheduler {
    fn submit(&self, task: CopyTask) {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            inner.complete_cancelled(&task, "scheduler shutdown");
            return;
        }

        let priority = inner
            .rule
            .priority_for(&task.source, task.is_dir, task.size_hint);
        match inner.queue.offer(task, priority) {
            Ok(()) => {}
            Err(task) => {
                // Bounded queue is full: degrade to a synchronous run in the
                // caller rather than dropping the task.
                inner.admissions.record(false);
                warn!(
                    source = %task.source.display(),
                    "copy queue full, running task inline"
                );
                inner.run_inline(task);
            }
        }
    }
}

impl fmt::Debug for TaskScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskScheduler")
            .field("queue_len", &self.inner.queue.len())
            .field("active_workers", &self.inner.workers.active())
            .field("pool_size", &self.inner.pool_size)
            .finish()
    }
}

async fn admit_loop(inner: Arc<SchedulerInner>) {
    info!("copy admitter started");
    loop {
        let pending = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            pending = inner.queue.take() => pending,
        };

        // Cancellation before the copy begins.
        if inner.devices.is_offline(&pending.task.device_serial) {
            inner.complete_cancelled(&pending.task, "device offline");
            continue;
        }

        if !wait_for_slot(&inner).await {
            inner.complete_cancelled(&pending.task, "scheduler shutdown");
            break;
        }

        let rate = inner.effective_rate();
        tokio::select! {
            _ = inner.shutdown.cancelled() => {
                inner.complete_cancelled(&pending.task, "scheduler shutdown");
                break;
            }
            _ = inner.limiter.acquire(rate) => {}
        }

        inner.admissions.record(true);
        spawn_worker(&inner, pending);
    }
    debug!("copy admitter stopped");
}

/// Wait until the level-scaled concurrency cap admits another worker.
/// Returns false when shutdown interrupts the wait.
async fn wait_for_slot(inner: &Arc<SchedulerInner>) -> bool {
    loop {
        let level = inner.load.evaluate().level;
        let cap = level_cap(level, inner.pool_size);
        if inner.workers.active() < cap {
            return true;
        }
        inner.admissions.record(false);
        tokio::select! {
            _ = inner.shutdown.cancelled() => return false,
            _ = inner.worker_done.notified() => {}
            // The level can drop without a completion; re-evaluate regardless.
            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
        }
    }
}

fn spawn_worker(inner: &Arc<SchedulerInner>, pending: PrioritizedTask) {
    inner.workers.acquire();
    let inner = inner.clone();
    tokio::spawn(async move {
        let ctx = CopyContext {
            task: pending.task.clone(),
            work_root: inner.work_root.clone(),
            buffer_size: inner.buffer_size(),
            index: inner.index.clone(),
            in_flight: inner.in_flight.clone(),
            devices: inner.devices.clone(),
            shutdown: inner.shutdown.clone(),
            speed: inner.speed.clone(),
        };

        let end = match tokio::task::spawn_blocking(move || execute(&ctx)).await {
            Ok(end) => end,
            Err(err) => AttemptEnd::Done(CopyOutcome::fail(
                pending.task.source.clone(),
                pending.task.size_hint.unwrap_or(0),
                format!("copy worker panicked: {err}"),
            )),
        };

        inner.workers.release();
        inner.worker_done.notify_one();
        inner.settle(pending, end);
    });
}

impl SchedulerInner {
    fn buffer_size(&self) -> usize {
        self.settings.get(&settings::HASH_BUFFER_SIZE).max(4096) as usize
    }

    fn effective_rate(&self) -> f64 {
        let base = self.settings.get(&settings::RATE_BASE_PER_MINUTE).max(0) as f64 / 60.0;
        base * level_factor(self.load.evaluate().level)
    }

    fn retry_budget(&self) -> u32 {
        self.settings.get(&settings::RETRY_COUNT).max(0) as u32
    }

    fn complete(&self, outcome: CopyOutcome) {
        self.bus.copy_completed().publish(&CopyCompleted::new(outcome));
    }

    fn complete_cancelled(&self, task: &CopyTask, reason: &str) {
        debug!(source = %task.source.display(), reason, "copy task cancelled");
        self.complete(CopyOutcome::cancel(task.source.clone(), reason));
    }

    /// Route an attempt result: emit the terminal event, or park the task on
    /// the delayed retry queue.
    fn settle(self: &Arc<Self>, pending: PrioritizedTask, end: AttemptEnd) {
        match end {
            AttemptEnd::Done(outcome) => self.complete(outcome),
            AttemptEnd::Transient(err) => {
                let budget = self.retry_budget();
                if pending.task.attempt >= budget {
                    let attempts = pending.task.attempt + 1;
                    self.complete(CopyOutcome::fail(
                        pending.task.source,
                        pending.task.size_hint.unwrap_or(0),
                        format!("read failed after {attempts} attempts: {err}"),
                    ));
                    return;
                }

                let delay = backoff_delay(pending.task.attempt);
                warn!(
                    source = %pending.task.source.display(),
                    attempt = pending.task.attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    "transient read error, scheduling retry: {err}"
                );

                let inner = self.clone();
                let mut task = pending.task;
                task.attempt += 1;
                let priority = pending.priority;
                tokio::spawn(async move {
                    tokio::select! {
                        _ = inner.shutdown.cancelled() => {
                            inner.complete_cancelled(&task, "scheduler shutdown");
                        }
                        _ = tokio::time::sleep(delay) => {
                            if let Err(task) = inner.queue.offer(task, priority) {
                                inner.complete(CopyOutcome::fail(
                                    task.source,
                                    task.size_hint.unwrap_or(0),
                                    "retry rejected, queue full".to_string(),
                                ));
                            }
                        }
                    }
                });
            }
        }
    }

    /// Degraded mode for a full queue: run the task to completion on the
    /// caller's thread, including its retry budget.
    fn run_inline(self: &Arc<Self>, task: CopyTask) {
        let mut attempt_task = task;
        loop {
            let ctx = CopyContext {
                task: attempt_task.clone(),
                work_root: self.work_root.clone(),
                buffer_size: self.buffer_size(),
                index: self.index.clone(),
                in_flight: self.in_flight.clone(),
                devices: self.devices.clone(),
                shutdown: self.shutdown.clone(),
                speed: self.speed.clone(),
            };
            match execute(&ctx) {
                AttemptEnd::Done(outcome) => {
                    self.complete(outcome);
                    return;
                }
                AttemptEnd::Transient(err) => {
                    if attempt_task.attempt >= self.retry_budget() {
                        let attempts = attempt_task.attempt + 1;
                        self.complete(CopyOutcome::fail(
                            attempt_task.source,
                            attempt_task.size_hint.unwrap_or(0),
                            format!("read failed after {attempts} attempts: {err}"),
                        ));
                        return;
                    }
                    std::thread::sleep(backoff_delay(attempt_task.attempt));
                    attempt_task.attempt += 1;
                }
            }
        }
    }
}

impl fmt::Debug for SchedulerInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedulerInner")
            .field("pool_size", &self.pool_size)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::super::CopyResult;
    use super::*;
    use crate::clock::SystemClock;
    use crate::device::DeviceSerial;

    #[test]
    fn level_caps_scale_with_the_pool() {
        assert_eq!(level_cap(LoadLevel::Low, 10), 10);
        assert_eq!(level_cap(LoadLevel::Medium, 10), 7);
        assert_eq!(level_cap(LoadLevel::High, 10), 4);
        // Small pools always keep one slot.
        assert_eq!(level_cap(LoadLevel::High, 1), 1);
        assert_eq!(level_cap(LoadLevel::Medium, 3), 3);
    }

    #[test]
    fn rate_scales_by_the_same_factors() {
        assert_eq!(level_factor(LoadLevel::Low), 1.0);
        assert_eq!(level_factor(LoadLevel::Medium), 0.7);
        assert_eq!(level_factor(LoadLevel::High), 0.4);
    }

    #[test]
    fn retry_backoff_doubles_and_caps() {
        assert_eq!(backoff_delay(0), Duration::from_millis(500));
        assert_eq!(backoff_delay(1), Duration::from_secs(1));
        assert_eq!(backoff_delay(3), Duration::from_secs(4));
        assert_eq!(backoff_delay(30), Duration::from_secs(60));
    }

    struct ScriptedStatus {
        offline: AtomicBool,
    }

    impl ScriptedStatus {
        fn online() -> Arc<Self> {
            Arc::new(Self {
                offline: AtomicBool::new(false),
            })
        }
    }

    impl DeviceStatus for ScriptedStatus {
        fn is_offline(&self, _serial: &DeviceSerial) -> bool {
            self.offline.load(Ordering::Acquire)
        }
    }

    struct Harness {
        scheduler: TaskScheduler,
        index: Arc<FingerprintIndex>,
        status: Arc<ScriptedStatus>,
        outcomes: Arc<StdMutex<Vec<CopyOutcome>>>,
        duplicates: Arc<StdMutex<Vec<PathBuf>>>,
        _work: tempfile::TempDir,
        device: tempfile::TempDir,
    }

    fn harness(configure: impl FnOnce(&SettingsRegistry)) -> Harness {
        let work = tempfile::tempdir().unwrap();
        let device = tempfile::tempdir().unwrap();

        let settings = Arc::new(SettingsRegistry::new());
        settings.set(
            &settings::WORK_PATH,
            work.path().to_string_lossy().to_string(),
        );
        configure(&settings);

        let bus = Arc::new(EventBus::new());
        let outcomes = Arc::new(StdMutex::new(Vec::new()));
        {
            let outcomes = outcomes.clone();
            bus.copy_completed()
                .subscribe_fn(move |event| outcomes.lock().unwrap().push(event.outcome.clone()));
        }
        let duplicates = Arc::new(StdMutex::new(Vec::new()));
        {
            let duplicates = duplicates.clone();
            bus.duplicate_detected()
                .subscribe_fn(move |event| duplicates.lock().unwrap().push(event.path.clone()));
        }

        let index = Arc::new(FingerprintIndex::new(bus.clone()));
        let status = ScriptedStatus::online();
        let scheduler = TaskScheduler::new(
            bus,
            settings,
            index.clone(),
            status.clone(),
            Arc::new(SystemClock),
        )
        .unwrap();

        Harness {
            scheduler,
            index,
            status,
            outcomes,
            duplicates,
            _work: work,
            device,
        }
    }

    impl Harness {
        fn device_file(&self, name: &str, contents: &[u8]) -> CopyTask {
            let path = self.device.path().join(name);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).unwrap();
            }
            fs::write(&path, contents).unwrap();
            CopyTask::new(
                path,
                DeviceSerial::new("SER-1").unwrap(),
                self.device.path().to_path_buf(),
                "STICK".into(),
                Some(contents.len() as u64),
            )
        }

        async fn wait_for_outcomes(&self, count: usize) {
            for _ in 0..400 {
                if self.outcomes.lock().unwrap().len() >= count {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!(
                "expected {count} outcomes, got {}",
                self.outcomes.lock().unwrap().len()
            );
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn identical_files_yield_one_copy_and_one_duplicate() {
        let h = harness(|_| {});
        let first = h.device_file("docs/A.pdf", b"identical payload");
        let second = h.device_file("docs/A-copy.pdf", b"identical payload");

        h.scheduler.start();
        h.scheduler.submit(first);
        h.scheduler.submit(second);
        h.wait_for_outcomes(2).await;

        let outcomes = h.outcomes.lock().unwrap();
        assert!(outcomes.iter().all(|o| o.result == CopyResult::Success));

        // Exactly one outcome actually wrote content.
        let written: Vec<_> = outcomes.iter().filter(|o| o.fingerprint.is_some()).collect();
        assert_eq!(written.len(), 1);
        assert_eq!(h.duplicates.lock().unwrap().len(), 1);
        assert_eq!(h.index.len(), 1);

        let destination = written[0].destination.clone().unwrap();
        assert_eq!(fs::read(destination).unwrap(), b"identical payload");

        h.scheduler.stop(Duration::from_secs(2)).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn offline_device_cancels_before_copy() {
        let h = harness(|_| {});
        let task = h.device_file("a.bin", b"payload");
        h.status.offline.store(true, Ordering::Release);

        h.scheduler.start();
        h.scheduler.submit(task);
        h.wait_for_outcomes(1).await;

        let outcomes = h.outcomes.lock().unwrap();
        assert_eq!(outcomes[0].result, CopyResult::Cancel);
        assert!(outcomes[0].destination.is_none());
        assert!(h.index.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn missing_source_fails_after_retry_budget() {
        let h = harness(|s| {
            s.set(&settings::RETRY_COUNT, 1);
        });
        let task = CopyTask::new(
            h.device.path().join("never-existed.bin"),
            DeviceSerial::new("SER-1").unwrap(),
            h.device.path().to_path_buf(),
            "STICK".into(),
            None,
        );

        h.scheduler.start();
        h.scheduler.submit(task);
        // Two attempts with one backoff in between.
        for _ in 0..600 {
            if !h.outcomes.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let outcomes = h.outcomes.lock().unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].result, CopyResult::Fail);
        assert!(outcomes[0].error.as_ref().unwrap().contains("2 attempts"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn higher_priority_extension_completes_first_with_one_worker() {
        let h = harness(|s| {
            s.set(&settings::WORKER_POOL_SIZE, 1);
            s.set(&settings::PRIORITY_MAP, vec!["pdf=9".to_string(), "tmp=1".to_string()]);
        });
        let low = h.device_file("noise.tmp", &vec![1u8; 64 * 1024]);
        let high = h.device_file("report.pdf", &vec![2u8; 64 * 1024]);

        // Queue both before the admitter starts so ordering is pure priority.
        h.scheduler.submit(low);
        h.scheduler.submit(high);
        h.scheduler.start();
        h.wait_for_outcomes(2).await;

        let outcomes = h.outcomes.lock().unwrap();
        assert!(outcomes[0].source.ends_with("report.pdf"));
        assert!(outcomes[1].source.ends_with("noise.tmp"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stop_cancels_pending_tasks() {
        let h = harness(|_| {});
        let task = h.device_file("pending.bin", b"data");
        // Never started: the task stays queued until stop drains it.
        h.scheduler.submit(task);
        h.scheduler.stop(Duration::from_millis(500)).await;

        let outcomes = h.outcomes.lock().unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].result, CopyResult::Cancel);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn existing_destination_with_same_size_counts_as_success() {
        let h = harness(|_| {});
        let task = h.device_file("docs/b.pdf", b"stable content");

        // Simulate a previous session's copy.
        let destination = h._work.path().join("STICK/docs/b.pdf");
        fs::create_dir_all(destination.parent().unwrap()).unwrap();
        fs::write(&destination, b"stable content").unwrap();

        h.scheduler.start();
        h.scheduler.submit(task);
        h.wait_for_outcomes(1).await;

        let outcomes = h.outcomes.lock().unwrap();
        assert_eq!(outcomes[0].result, CopyResult::Success);
        assert_eq!(outcomes[0].bytes_copied, 0);
        // The index was healed from the pre-existing file.
        assert_eq!(h.index.len(), 1);

        drop(outcomes);
        h.scheduler.stop(Duration::from_secs(1)).await;
    }
}
