use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use offload_config::{SettingsRegistry, settings};
use tracing::{debug, info, warn};

use super::{Device, DeviceSerial, DeviceSnapshot, DeviceState, KnownSerials, VolumeProbe};
use crate::error::Result;
use crate::events::{
    DeviceInserted, DeviceJoined, DeviceRemoved, DeviceStateChanged, EventBus,
};
use crate::service::Service;

/// Read-only device presence checks for components that must not hold the
/// device monitor (copy workers deciding whether to cancel).
pub trait DeviceStatus: Send + Sync {
    /// True when the serial is untracked or currently offline.
    fn is_offline(&self, serial: &DeviceSerial) -> bool;
}

enum PendingEvent {
    Joined(DeviceSnapshot),
    Inserted(DeviceSnapshot),
    Removed(DeviceSnapshot),
    StateChanged(DeviceSnapshot, DeviceState, DeviceState),
}

/// Polls the volume probe, tracks devices by serial, recalls ghosts from the
/// known-serials file, and emits the device event stream.
///
/// All access to the device set goes through one monitor; events are emitted
/// after the monitor is released so listeners can call back in.
pub struct DeviceManager {
    bus: Arc<EventBus>,
    settings: Arc<SettingsRegistry>,
    probe: Arc<dyn VolumeProbe>,
    devices: Mutex<HashMap<DeviceSerial, Device>>,
    serials: KnownSerials,
}

impl DeviceManager {
    pub fn new(
        bus: Arc<EventBus>,
        settings: Arc<SettingsRegistry>,
        probe: Arc<dyn VolumeProbe>,
        serials: KnownSerials,
    ) -> Self {
        let blacklist = settings.device_blacklist();
        let mut devices = HashMap::new();
        for (serial, label) in serials.load() {
            let Ok(serial) = DeviceSerial::new(&serial) else {
                continue;
            };
            if blacklist.iter().any(|b| b == serial.as_str()) {
                continue;
            }
            debug!(serial = %serial, "recalled ghost device");
            devices.insert(serial.clone(), Device::ghost(serial, label));
        }
        info!(ghosts = devices.len(), "device manager initialized");

        Self {
            bus,
            settings,
            probe,
            devices: Mutex::new(devices),
            serials,
        }
    }

    /// One poll cycle: enumerate volumes, merge ghosts, create newcomers,
    /// then refresh presence of everything tracked.
    pub fn poll(&self) -> Result<()> {
        let volumes = match self.probe.volumes() {
            Ok(volumes) => volumes,
            Err(err) => {
                warn!("volume enumeration failed, skipping poll: {err}");
                return Ok(());
            }
        };
        let blacklist = self.settings.device_blacklist();

        let mut events = Vec::new();
        {
            let mut devices = self.devices.lock().expect("device monitor poisoned");
            let mut known_dirty = false;
            let mut seen = HashSet::new();
            let mut fresh = HashSet::new();

            for volume in &volumes {
                let serial = match DeviceSerial::new(&volume.serial) {
                    Ok(serial) => serial,
                    Err(_) => {
                        debug!(root = %volume.root.display(), "volume without serial, skipping");
                        continue;
                    }
                };
                if blacklist.iter().any(|b| b == serial.as_str()) {
                    debug!(serial = %serial, "blacklisted serial, skipping");
                    continue;
                }
                seen.insert(serial.clone());

                match devices.entry(serial.clone()) {
                    Entry::Occupied(mut tracked) => {
                        let device = tracked.get_mut();
                        if device.is_ghost() {
                            device.merge_mount(volume.root.clone(), volume.label.clone());
                            fresh.insert(serial);
                            events.push(PendingEvent::Inserted(device.snapshot()));
                        } else {
                            device.touch();
                        }
                    }
                    Entry::Vacant(slot) => {
                        let device = Device::sighted(
                            serial.clone(),
                            volume.root.clone(),
                            volume.label.clone(),
                        );
                        events.push(PendingEvent::Joined(device.snapshot()));
                        slot.insert(device);
                        fresh.insert(serial);
                        known_dirty = true;
                    }
                }
            }

            for (serial, device) in devices.iter_mut() {
                if seen.contains(serial) {
                    // A device stays PRESENT for the tick that mounted it and
                    // settles to IDLE on the next one.
                    if device.state() == DeviceState::Present && !fresh.contains(serial) {
                        device.set_state(DeviceState::Idle);
                    }
                } else if !device.is_ghost() {
                    device.mark_offline();
                }
                drain_state_change(device, &mut events);
            }

            if known_dirty {
                self.persist_known(&devices);
            }
        }

        self.emit(events);
        Ok(())
    }

    /// Transition a tracked device (used by discovery for SCANNING/IDLE).
    pub fn mark_state(&self, serial: &DeviceSerial, state: DeviceState) {
        let mut events = Vec::new();
        {
            let mut devices = self.devices.lock().expect("device monitor poisoned");
            if let Some(device) = devices.get_mut(serial) {
                if state == DeviceState::Offline {
                    device.mark_offline();
                } else {
                    device.set_state(state);
                }
                drain_state_change(device, &mut events);
            }
        }
        self.emit(events);
    }

    /// Explicitly drop a device from tracking and persistence.
    pub fn forget(&self, serial: &DeviceSerial) -> bool {
        let mut devices = self.devices.lock().expect("device monitor poisoned");
        let removed = devices.remove(serial).is_some();
        if removed {
            self.persist_known(&devices);
        }
        removed
    }

    pub fn snapshot(&self) -> Vec<DeviceSnapshot> {
        self.devices
            .lock()
            .expect("device monitor poisoned")
            .values()
            .map(Device::snapshot)
            .collect()
    }

    pub fn device(&self, serial: &DeviceSerial) -> Option<DeviceSnapshot> {
        self.devices
            .lock()
            .expect("device monitor poisoned")
            .get(serial)
            .map(Device::snapshot)
    }

    fn persist_known(&self, devices: &HashMap<DeviceSerial, Device>) {
        let mut records: Vec<(String, String)> = devices
            .values()
            .map(|device| (device.serial().as_str().to_string(), device.label().to_string()))
            .collect();
        records.sort();
        if let Err(err) = self.serials.save(&records) {
            warn!(
                path = %self.serials.path().display(),
                "failed to persist known serials: {err}"
            );
        }
    }

    fn emit(&self, events: Vec<PendingEvent>) {
        for event in events {
            match event {
                PendingEvent::Joined(device) => {
                    info!(serial = %device.serial, "new device joined");
                    self.bus.device_joined().publish(&DeviceJoined::new(device));
                }
                PendingEvent::Inserted(device) => {
                    info!(serial = %device.serial, "known device inserted");
                    self.bus
                        .device_inserted()
                        .publish(&DeviceInserted::new(device));
                }
                PendingEvent::Removed(device) => {
                    info!(serial = %device.serial, "device removed");
                    self.bus.device_removed().publish(&DeviceRemoved::new(device));
                }
                PendingEvent::StateChanged(device, old, new) => {
                    debug!(serial = %device.serial, ?old, ?new, "device state changed");
                    self.bus
                        .device_state_changed()
                        .publish(&DeviceStateChanged::new(device, old, new));
                }
            }
        }
    }
}

fn drain_state_change(device: &mut Device, events: &mut Vec<PendingEvent>) {
    if let Some((old, new)) = device.take_state_change() {
        events.push(PendingEvent::StateChanged(device.snapshot(), old, new));
        if new == DeviceState::Offline {
            events.push(PendingEvent::Removed(device.snapshot()));
        }
    }
}

impl DeviceStatus for DeviceManager {
    fn is_offline(&self, serial: &DeviceSerial) -> bool {
        self.devices
            .lock()
            .expect("device monitor poisoned")
            .get(serial)
            .is_none_or(|device| device.state() == DeviceState::Offline)
    }
}

impl fmt::Debug for DeviceManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tracked = self
            .devices
            .lock()
            .map(|devices| devices.len())
            .unwrap_or_default();
        f.debug_struct("DeviceManager")
            .field("tracked", &tracked)
            .field("serials", &self.serials)
            .finish()
    }
}

#[async_trait]
impl Service for DeviceManager {
    fn name(&self) -> &'static str {
        "device-manager"
    }

    fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.settings.get(&settings::DELAY_S).max(1) as u64)
    }

    fn initial_delay(&self) -> Duration {
        Duration::from_secs(self.settings.get(&settings::INITIAL_DELAY_S).max(0) as u64)
    }

    async fn tick(&self) -> Result<()> {
        self.poll()
    }
}
