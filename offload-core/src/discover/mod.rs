//! Per-device file discovery: an initial bounded walk, then a live change
//! feed, with restart arbitration tied to device and storage state.

mod walker;
mod watcher;

pub use walker::{WalkOptions, WalkStats, walk_device};
pub use watcher::{WatchEnd, watch_device};

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use offload_config::{SettingsRegistry, settings};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::device::{DeviceManager, DeviceSerial, DeviceSnapshot, DeviceState};
use crate::events::{EventBus, FileDiscovered};
use crate::filter::{FileFilter, default_chain};
use crate::recycle::StorageLevel;
use crate::schedule::{CopyTask, TaskSink};

/// Starts a discovery pass per mounted device, cancels it when the device
/// goes away, and arbitrates restarts: a completed pass re-walks after the
/// normal wait, a failed one after the error wait, and a storage-critical
/// pause suspends restarts entirely. A newly scheduled restart supersedes any
/// pending one for the same device.
pub struct DiscoveryManager {
    inner: Arc<DiscoveryInner>,
}

struct DiscoveryInner {
    bus: Arc<EventBus>,
    settings: Arc<SettingsRegistry>,
    devices: Arc<DeviceManager>,
    sink: Arc<dyn TaskSink>,
    filter: Arc<dyn FileFilter>,
    active: Mutex<HashMap<DeviceSerial, CancellationToken>>,
    pending_restarts: Mutex<HashMap<DeviceSerial, JoinHandle<()>>>,
    paused: AtomicBool,
}

impl DiscoveryManager {
    pub fn new(
        bus: Arc<EventBus>,
        settings: Arc<SettingsRegistry>,
        devices: Arc<DeviceManager>,
        sink: Arc<dyn TaskSink>,
    ) -> Self {
        let filter = default_chain(settings.clone());
        Self {
            inner: Arc::new(DiscoveryInner {
                bus,
                settings,
                devices,
                sink,
                filter,
                active: Mutex::new(HashMap::new()),
                pending_restarts: Mutex::new(HashMap::new()),
                paused: AtomicBool::new(false),
            }),
        }
    }

    /// Wire the manager into the bus: device arrivals start scans, OFFLINE
    /// transitions cancel them, storage levels gate restarts.
    pub fn attach(&self) {
        {
            let inner = self.inner.clone();
            self.inner.bus.device_joined().subscribe_fn(move |event| {
                start_scan(&inner, event.device.clone());
            });
        }
        {
            let inner = self.inner.clone();
            self.inner.bus.device_inserted().subscribe_fn(move |event| {
                start_scan(&inner, event.device.clone());
            });
        }
        {
            let inner = self.inner.clone();
            self.inner
                .bus
                .device_state_changed()
                .subscribe_fn(move |event| {
                    if event.new_state == DeviceState::Offline {
                        cancel_scan(&inner, &event.device.serial);
                    }
                });
        }
        {
            let inner = self.inner.clone();
            self.inner
                .bus
                .storage_level_changed()
                .subscribe_fn(move |event| match event.level {
                    StorageLevel::Critical => {
                        info!("storage critical, pausing discovery restarts");
                        inner.paused.store(true, Ordering::Release);
                        abort_all_restarts(&inner);
                    }
                    StorageLevel::Normal => {
                        if inner.paused.swap(false, Ordering::AcqRel) {
                            info!("storage recovered, resuming discovery");
                            resume_all(&inner);
                        }
                    }
                    StorageLevel::Warning => {}
                });
        }
    }

    /// Kick off a scan for an already-tracked device (bootstrap convenience).
    pub fn scan_device(&self, device: DeviceSnapshot) {
        start_scan(&self.inner, device);
    }

    pub fn pause(&self) {
        self.inner.paused.store(true, Ordering::Release);
        abort_all_restarts(&self.inner);
    }

    pub fn resume(&self) {
        if self.inner.paused.swap(false, Ordering::AcqRel) {
            resume_all(&self.inner);
        }
    }

    /// Cancel every scan and pending restart.
    pub fn shutdown(&self) {
        let tokens: Vec<_> = {
            let mut active = self.inner.active.lock().expect("discovery lock poisoned");
            active.drain().map(|(_, token)| token).collect()
        };
        for token in tokens {
            token.cancel();
        }
        abort_all_restarts(&self.inner);
    }

    pub fn active_scans(&self) -> usize {
        self.inner.active.lock().expect("discovery lock poisoned").len()
    }
}

impl std::fmt::Debug for DiscoveryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveryManager")
            .field("active_scans", &self.active_scans())
            .field("paused", &self.inner.paused.load(Ordering::Acquire))
            .finish()
    }
}

fn start_scan(inner: &Arc<DiscoveryInner>, device: DeviceSnapshot) {
    if inner.paused.load(Ordering::Acquire) {
        debug!(serial = %device.serial, "discovery paused, not starting scan");
        return;
    }
    let Some(root) = device.root.clone() else {
        return;
    };

    // A fresh start supersedes both a pending restart and a running scan.
    abort_restart(inner, &device.serial);
    let token = CancellationToken::new();
    {
        let mut active = inner.active.lock().expect("discovery lock poisoned");
        if let Some(previous) = active.insert(device.serial.clone(), token.clone()) {
            previous.cancel();
        }
    }

    let inner = inner.clone();
    tokio::spawn(async move {
        run_scan(inner, device, root, token).await;
    });
}

async fn run_scan(
    inner: Arc<DiscoveryInner>,
    device: DeviceSnapshot,
    root: std::path::PathBuf,
    token: CancellationToken,
) {
    let serial = device.serial.clone();
    info!(serial = %serial, root = %root.display(), "device scan starting");
    inner.devices.mark_state(&serial, DeviceState::Scanning);

    // Phase A: initial walk on the blocking pool.
    let walk = {
        let inner = inner.clone();
        let device = device.clone();
        let root = root.clone();
        let token = token.clone();
        tokio::task::spawn_blocking(move || {
            let options = WalkOptions::from_settings(&inner.settings);
            let submit = submitter(&inner, &device, &root);
            walk_device(&root, &options, inner.filter.as_ref(), &token, submit)
        })
        .await
    };

    match walk {
        Ok(stats) if stats.cancelled => {
            debug!(serial = %serial, "device scan cancelled during walk");
            clear_active(&inner, &serial, &token);
            return;
        }
        Ok(stats) => {
            info!(
                serial = %serial,
                seen = stats.files_seen,
                matched = stats.files_matched,
                errors = stats.errors,
                "initial walk finished"
            );
            inner.devices.mark_state(&serial, DeviceState::Idle);
            // Periodic re-walk while the watch phase keeps running.
            schedule_restart(&inner, device.clone(), normal_wait(&inner.settings));
        }
        Err(err) => {
            warn!(serial = %serial, "walk task failed: {err}");
            inner.devices.mark_state(&serial, DeviceState::Idle);
            clear_active(&inner, &serial, &token);
            schedule_restart(&inner, device.clone(), error_wait(&inner.settings));
            return;
        }
    }

    // Phase B: live change feed through the same filter chain.
    let watch_result = {
        let debounce =
            Duration::from_millis(inner.settings.get(&settings::WATCH_DEBOUNCE_MS).max(1) as u64);
        let mut submit = submitter(&inner, &device, &root);
        watch_device(
            &root,
            debounce,
            inner.filter.clone(),
            token.clone(),
            &mut submit,
        )
        .await
    };

    clear_active(&inner, &serial, &token);
    match watch_result {
        Ok(WatchEnd::Cancelled) => {
            debug!(serial = %serial, "watch cancelled");
        }
        Ok(WatchEnd::Lost(reason)) => {
            // Watcher loss means missed events; a full re-walk recovers them.
            warn!(serial = %serial, reason, "watcher lost, scheduling re-walk");
            schedule_restart(&inner, device, error_wait(&inner.settings));
        }
        Err(err) => {
            warn!(serial = %serial, "watch failed to start: {err}");
            schedule_restart(&inner, device, error_wait(&inner.settings));
        }
    }
}

/// Shared emit-and-submit path for both phases.
fn submitter(
    inner: &Arc<DiscoveryInner>,
    device: &DeviceSnapshot,
    root: &std::path::Path,
) -> impl FnMut(std::path::PathBuf, u64) + Send + use<> {
    let inner = inner.clone();
    let serial = device.serial.clone();
    let label = device.label.clone();
    let root = root.to_path_buf();
    move |path, size| {
        inner.bus.file_discovered().publish(&FileDiscovered::new(
            path.clone(),
            size,
            serial.as_str().to_string(),
        ));
        inner.sink.submit(CopyTask::new(
            path,
            serial.clone(),
            root.clone(),
            label.clone(),
            Some(size),
        ));
    }
}

fn schedule_restart(inner: &Arc<DiscoveryInner>, device: DeviceSnapshot, delay: Duration) {
    if inner.paused.load(Ordering::Acquire) {
        debug!(serial = %device.serial, "discovery paused, not scheduling restart");
        return;
    }

    let serial = device.serial.clone();
    let handle = {
        let inner = inner.clone();
        let serial = serial.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner
                .pending_restarts
                .lock()
                .expect("discovery lock poisoned")
                .remove(&serial);
            if inner.paused.load(Ordering::Acquire) {
                return;
            }
            // Only restart a device that is still mounted.
            match inner.devices.device(&serial) {
                Some(current) if current.state != DeviceState::Offline => {
                    start_scan(&inner, current);
                }
                _ => debug!(serial = %serial, "restart skipped, device gone"),
            }
        })
    };

    let mut pending = inner
        .pending_restarts
        .lock()
        .expect("discovery lock poisoned");
    if let Some(previous) = pending.insert(serial, handle) {
        // The newest schedule wins.
        previous.abort();
    }
}

fn abort_restart(inner: &Arc<DiscoveryInner>, serial: &DeviceSerial) {
    if let Some(handle) = inner
        .pending_restarts
        .lock()
        .expect("discovery lock poisoned")
        .remove(serial)
    {
        handle.abort();
    }
}

fn abort_all_restarts(inner: &Arc<DiscoveryInner>) {
    let handles: Vec<_> = {
        let mut pending = inner
            .pending_restarts
            .lock()
            .expect("discovery lock poisoned");
        pending.drain().map(|(_, handle)| handle).collect()
    };
    for handle in handles {
        handle.abort();
    }
}

fn resume_all(inner: &Arc<DiscoveryInner>) {
    for device in inner.devices.snapshot() {
        if device.root.is_some() && device.state != DeviceState::Offline {
            start_scan(inner, device);
        }
    }
}

fn cancel_scan(inner: &Arc<DiscoveryInner>, serial: &DeviceSerial) {
    abort_restart(inner, serial);
    let token = inner
        .active
        .lock()
        .expect("discovery lock poisoned")
        .remove(serial);
    if let Some(token) = token {
        info!(serial = %serial, "cancelling device scan");
        token.cancel();
    }
}

fn clear_active(inner: &Arc<DiscoveryInner>, serial: &DeviceSerial, token: &CancellationToken) {
    let mut active = inner.active.lock().expect("discovery lock poisoned");
    // A cancelled token means the slot was already removed (device offline)
    // or handed to a superseding scan; only an uncancelled owner unregisters.
    if !token.is_cancelled() {
        active.remove(serial);
    }
}

fn normal_wait(settings: &Arc<SettingsRegistry>) -> Duration {
    Duration::from_secs(
        settings.get(&settings::SNIFFER_WAIT_NORMAL_MINUTES).max(1) as u64 * 60,
    )
}

fn error_wait(settings: &Arc<SettingsRegistry>) -> Duration {
    Duration::from_secs(
        settings.get(&settings::SNIFFER_WAIT_ERROR_MINUTES).max(1) as u64 * 60,
    )
}
