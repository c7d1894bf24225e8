//! Uniform lifecycle for the long-running engine components.
//!
//! A [`Service`] supplies the periodic work; a [`ServiceRunner`] owns the
//! tokio task that drives it, the state machine, and pause/stop semantics.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::Result;

/// Lifecycle states of a runner.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServiceState {
    Stopped,
    Starting,
    Running,
    Paused,
    Failed,
}

/// Periodic work unit driven by a [`ServiceRunner`].
#[async_trait]
pub trait Service: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn tick_interval(&self) -> Duration;

    fn initial_delay(&self) -> Duration {
        Duration::ZERO
    }

    /// One unit of periodic work. An error is fatal for the runner: the state
    /// becomes [`ServiceState::Failed`] and no further ticks run.
    async fn tick(&self) -> Result<()>;

    /// Called once after the loop exits on an orderly stop.
    async fn cleanup(&self) {}
}

struct RunnerShared {
    state: Mutex<ServiceState>,
    paused: AtomicBool,
}

impl RunnerShared {
    fn set_state(&self, next: ServiceState) {
        *self.state.lock().expect("service state poisoned") = next;
    }

    fn state(&self) -> ServiceState {
        *self.state.lock().expect("service state poisoned")
    }
}

/// Drives one [`Service`] on its own interval task.
pub struct ServiceRunner {
    service: Arc<dyn Service>,
    shared: Arc<RunnerShared>,
    cancel: Mutex<CancellationToken>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ServiceRunner {
    pub fn new(service: Arc<dyn Service>) -> Self {
        Self {
            service,
            shared: Arc::new(RunnerShared {
                state: Mutex::new(ServiceState::Stopped),
                paused: AtomicBool::new(false),
            }),
            cancel: Mutex::new(CancellationToken::new()),
            handle: Mutex::new(None),
        }
    }

    /// Start the tick loop. Idempotent while the service is starting or
    /// running; a stopped or failed runner starts fresh.
    pub fn start(&self) {
        {
            let state = self.shared.state();
            if matches!(state, ServiceState::Starting | ServiceState::Running) {
                debug!(service = self.service.name(), "start ignored, already running");
                return;
            }
        }

        self.shared.paused.store(false, Ordering::Release);
        self.shared.set_state(ServiceState::Starting);

        let service = self.service.clone();
        let shared = self.shared.clone();
        let cancel = CancellationToken::new();
        *self.cancel.lock().expect("service cancel poisoned") = cancel.clone();
        let task = tokio::spawn(async move {
            info!(service = service.name(), "service starting");

            let initial_delay = service.initial_delay();
            if !initial_delay.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        service.cleanup().await;
                        return;
                    }
                    _ = tokio::time::sleep(initial_delay) => {}
                }
            }

            let mut ticker = interval(service.tick_interval().max(Duration::from_millis(10)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!(service = service.name(), "service stopping");
                        service.cleanup().await;
                        return;
                    }
                    _ = ticker.tick() => {
                        if shared.paused.load(Ordering::Acquire) {
                            continue;
                        }
                        match service.tick().await {
                            Ok(()) => {
                                if shared.state() == ServiceState::Starting {
                                    shared.set_state(ServiceState::Running);
                                    info!(service = service.name(), "service running");
                                }
                            }
                            Err(err) => {
                                error!(
                                    service = service.name(),
                                    "periodic task failed, stopping service: {err}"
                                );
                                shared.set_state(ServiceState::Failed);
                                return;
                            }
                        }
                    }
                }
            }
        });

        *self.handle.lock().expect("service handle poisoned") = Some(task);
    }

    /// Skip ticks until resumed. Only a running service can pause.
    pub fn pause(&self) {
        let mut state = self.shared.state.lock().expect("service state poisoned");
        if *state == ServiceState::Running {
            *state = ServiceState::Paused;
            self.shared.paused.store(true, Ordering::Release);
            info!(service = self.service.name(), "service paused");
        }
    }

    /// Resume ticking after a pause.
    pub fn resume(&self) {
        let mut state = self.shared.state.lock().expect("service state poisoned");
        if *state == ServiceState::Paused {
            *state = ServiceState::Running;
            self.shared.paused.store(false, Ordering::Release);
            info!(service = self.service.name(), "service resumed");
        }
    }

    /// Stop the loop, joining the worker for up to `timeout` before
    /// abandoning it. A failed runner keeps its `Failed` state.
    pub async fn stop(&self, timeout: Duration) {
        self.cancel
            .lock()
            .expect("service cancel poisoned")
            .cancel();
        let handle = self.handle.lock().expect("service handle poisoned").take();
        if let Some(handle) = handle {
            if tokio::time::timeout(timeout, handle).await.is_err() {
                warn!(
                    service = self.service.name(),
                    "service did not stop within grace period, abandoning"
                );
            }
        }
        let mut state = self.shared.state.lock().expect("service state poisoned");
        if *state != ServiceState::Failed {
            *state = ServiceState::Stopped;
        }
    }

    pub fn state(&self) -> ServiceState {
        self.shared.state()
    }

    pub fn is_running(&self) -> bool {
        self.state() == ServiceState::Running
    }
}

impl fmt::Debug for ServiceRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceRunner")
            .field("service", &self.service.name())
            .field("state", &self.state())
            .finish()
    }
}
