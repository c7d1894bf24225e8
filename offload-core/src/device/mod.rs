//! Removable-volume tracking: device identity, state machine, ghost recall,
//! and the polling manager that keeps it all current.

mod manager;
mod probe;
mod serials;

pub use manager::{DeviceManager, DeviceStatus};
pub use probe::{VolumeInfo, VolumeProbe};
pub use serials::KnownSerials;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::error::{OffloadError, Result};

/// Hardware serial of a volume: trimmed and never empty.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct DeviceSerial(String);

impl DeviceSerial {
    pub fn new(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(OffloadError::InvalidDevice("empty serial".into()));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DeviceSerial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where a tracked device currently is in its lifecycle. Devices oscillate
/// forever; there is no terminal state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum DeviceState {
    /// Mounted and seen this tick; not yet picked up by discovery.
    Present,
    /// A discovery pass is running against the device root.
    Scanning,
    /// Mounted with no discovery activity.
    Idle,
    /// No mount point; the device is remembered as a ghost.
    Offline,
}

/// A tracked volume. Created on first sighting or recalled from the
/// known-serials file as a ghost (no root, offline).
#[derive(Debug)]
pub struct Device {
    serial: DeviceSerial,
    root: Option<PathBuf>,
    label: String,
    state: DeviceState,
    last_seen: DateTime<Utc>,
    pending_change: Option<(DeviceState, DeviceState)>,
}

impl Device {
    /// A device seen live for the first time.
    pub fn sighted(serial: DeviceSerial, root: PathBuf, label: String) -> Self {
        Self {
            serial,
            root: Some(root),
            label,
            state: DeviceState::Present,
            last_seen: Utc::now(),
            pending_change: None,
        }
    }

    /// A device recalled from persistence, awaiting its mount point.
    pub fn ghost(serial: DeviceSerial, label: String) -> Self {
        Self {
            serial,
            root: None,
            label,
            state: DeviceState::Offline,
            last_seen: Utc::now(),
            pending_change: None,
        }
    }

    pub fn serial(&self) -> &DeviceSerial {
        &self.serial
    }

    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn last_seen(&self) -> DateTime<Utc> {
        self.last_seen
    }

    pub fn is_ghost(&self) -> bool {
        self.root.is_none()
    }

    /// Move to `next`, folding repeated transitions into one pending change
    /// so observers see each settled transition exactly once.
    pub fn set_state(&mut self, next: DeviceState) {
        if next == self.state {
            return;
        }
        let old = self.state;
        self.state = next;
        self.pending_change = match self.pending_change.take() {
            Some((first_old, _)) => Some((first_old, next)),
            None => Some((old, next)),
        };
    }

    /// Change-and-reset flag: the pending transition, observable once.
    pub fn take_state_change(&mut self) -> Option<(DeviceState, DeviceState)> {
        self.pending_change.take()
    }

    /// A ghost absorbs a newly seen mount point.
    pub fn merge_mount(&mut self, root: PathBuf, label: String) {
        self.root = Some(root);
        if !label.trim().is_empty() {
            self.label = label;
        }
        self.last_seen = Utc::now();
        self.set_state(DeviceState::Present);
    }

    /// The mount point disappeared.
    pub fn mark_offline(&mut self) {
        self.root = None;
        self.set_state(DeviceState::Offline);
    }

    pub fn touch(&mut self) {
        self.last_seen = Utc::now();
    }

    pub fn snapshot(&self) -> DeviceSnapshot {
        DeviceSnapshot {
            serial: self.serial.clone(),
            root: self.root.clone(),
            label: self.label.clone(),
            state: self.state,
            last_seen: self.last_seen,
        }
    }
}

/// Immutable copy of a device's attributes, carried by events.
#[derive(Clone, Debug, Serialize)]
pub struct DeviceSnapshot {
    pub serial: DeviceSerial,
    pub root: Option<PathBuf>,
    pub label: String,
    pub state: DeviceState,
    pub last_seen: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serial_requires_non_empty_trimmed_text() {
        assert!(DeviceSerial::new("  ").is_err());
        assert_eq!(DeviceSerial::new(" ABC-1 ").unwrap().as_str(), "ABC-1");
    }

    #[test]
    fn state_change_is_observable_exactly_once() {
        let serial = DeviceSerial::new("S1").unwrap();
        let mut device = Device::ghost(serial, "STICK".into());

        device.merge_mount(PathBuf::from("/mnt/stick"), "STICK".into());
        assert_eq!(
            device.take_state_change(),
            Some((DeviceState::Offline, DeviceState::Present))
        );
        assert_eq!(device.take_state_change(), None);
    }

    #[test]
    fn repeated_transitions_fold_into_one_change() {
        let serial = DeviceSerial::new("S1").unwrap();
        let mut device = Device::sighted(serial, PathBuf::from("/mnt/s1"), "S1".into());

        device.set_state(DeviceState::Idle);
        device.set_state(DeviceState::Scanning);
        assert_eq!(
            device.take_state_change(),
            Some((DeviceState::Present, DeviceState::Scanning))
        );
    }

    #[test]
    fn setting_the_same_state_raises_no_change() {
        let serial = DeviceSerial::new("S1").unwrap();
        let mut device = Device::sighted(serial, PathBuf::from("/mnt/s1"), "S1".into());
        device.set_state(DeviceState::Present);
        assert_eq!(device.take_state_change(), None);
    }

    #[test]
    fn mark_offline_drops_the_root() {
        let serial = DeviceSerial::new("S1").unwrap();
        let mut device = Device::sighted(serial, PathBuf::from("/mnt/s1"), "S1".into());
        device.mark_offline();
        assert!(device.is_ghost());
        assert_eq!(device.state(), DeviceState::Offline);
    }

    #[test]
    fn merge_keeps_old_label_when_new_one_is_blank() {
        let serial = DeviceSerial::new("S1").unwrap();
        let mut device = Device::ghost(serial, "KEEP".into());
        device.merge_mount(PathBuf::from("/mnt/s1"), "  ".into());
        assert_eq!(device.label(), "KEEP");
    }
}
