use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use tracing::warn;

use crate::entry::{ConfigEntry, ConfigKind, ConfigValue};
use crate::settings;

/// In-memory settings store with typed access and default fallback.
///
/// All reads go through a declared [`ConfigEntry`]; a missing key or a stored
/// value of the wrong kind yields the entry's default (the mismatch is logged
/// once per read, never escalated).
pub struct SettingsRegistry {
    values: RwLock<HashMap<String, ConfigValue>>,
}

impl SettingsRegistry {
    pub fn new() -> Self {
        Self {
            values: RwLock::new(HashMap::new()),
        }
    }

    /// Typed read. Unknown keys and kind mismatches fall back to the default.
    pub fn get<T: ConfigKind>(&self, entry: &ConfigEntry<T>) -> T {
        let values = self.values.read().expect("settings lock poisoned");
        match values.get(entry.key()) {
            Some(stored) => match T::unwrap(stored) {
                Some(value) => value,
                None => {
                    warn!(
                        key = entry.key(),
                        "stored settings value has unexpected type, using default"
                    );
                    entry.default_value()
                }
            },
            None => entry.default_value(),
        }
    }

    /// Typed write.
    pub fn set<T: ConfigKind>(&self, entry: &ConfigEntry<T>, value: T) {
        self.set_raw(entry.key(), value.wrap());
    }

    /// Remove any stored value for `entry`, reverting reads to the default.
    pub fn clear<T: ConfigKind>(&self, entry: &ConfigEntry<T>) {
        self.values
            .write()
            .expect("settings lock poisoned")
            .remove(entry.key());
    }

    /// Drop every stored value.
    pub fn reset_all(&self) {
        self.values
            .write()
            .expect("settings lock poisoned")
            .clear();
    }

    pub(crate) fn set_raw(&self, key: &str, value: ConfigValue) {
        self.values
            .write()
            .expect("settings lock poisoned")
            .insert(key.to_string(), value);
    }

    pub(crate) fn get_raw(&self, key: &str) -> Option<ConfigValue> {
        self.values
            .read()
            .expect("settings lock poisoned")
            .get(key)
            .cloned()
    }

    /// Serials the device manager must ignore.
    pub fn device_blacklist(&self) -> Vec<String> {
        self.get(&settings::DEVICE_BLACKLIST_BY_SERIAL)
    }

    /// Add a serial to the device blacklist; duplicates are dropped.
    pub fn blacklist_serial(&self, serial: &str) {
        let mut list = self.device_blacklist();
        if !list.iter().any(|s| s == serial) {
            list.push(serial.to_string());
            self.set(&settings::DEVICE_BLACKLIST_BY_SERIAL, list);
        }
    }

    /// Remove a serial from the device blacklist; returns whether it was there.
    pub fn unblacklist_serial(&self, serial: &str) -> bool {
        let mut list = self.device_blacklist();
        let before = list.len();
        list.retain(|s| s != serial);
        let removed = list.len() != before;
        if removed {
            self.set(&settings::DEVICE_BLACKLIST_BY_SERIAL, list);
        }
        removed
    }
}

impl Default for SettingsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SettingsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stored = self
            .values
            .read()
            .map(|values| values.len())
            .unwrap_or_default();
        f.debug_struct("SettingsRegistry")
            .field("stored_keys", &stored)
            .finish()
    }
}

static GLOBAL: OnceLock<Arc<SettingsRegistry>> = OnceLock::new();

/// Process-wide registry for the top-level bootstrap. Components should take
/// an `Arc<SettingsRegistry>` instead of calling this directly.
pub fn global() -> Arc<SettingsRegistry> {
    GLOBAL
        .get_or_init(|| Arc::new(SettingsRegistry::new()))
        .clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings;

    #[test]
    fn unknown_key_returns_default() {
        let registry = SettingsRegistry::new();
        assert_eq!(registry.get(&settings::RETRY_COUNT), 3);
    }

    #[test]
    fn set_then_get_round_trips() {
        let registry = SettingsRegistry::new();
        registry.set(&settings::RETRY_COUNT, 7);
        assert_eq!(registry.get(&settings::RETRY_COUNT), 7);
        registry.clear(&settings::RETRY_COUNT);
        assert_eq!(registry.get(&settings::RETRY_COUNT), 3);
    }

    #[test]
    fn mismatched_kind_falls_back_to_default() {
        let registry = SettingsRegistry::new();
        registry.set_raw(settings::RETRY_COUNT.key(), ConfigValue::Str("oops".into()));
        assert_eq!(registry.get(&settings::RETRY_COUNT), 3);
    }

    #[test]
    fn reset_all_clears_everything() {
        let registry = SettingsRegistry::new();
        registry.set(&settings::PRIORITY_DEFAULT, 9);
        registry.set(&settings::FILE_FILTER_INCLUDE_HIDDEN, true);
        registry.reset_all();
        assert_eq!(registry.get(&settings::PRIORITY_DEFAULT), 5);
        assert!(!registry.get(&settings::FILE_FILTER_INCLUDE_HIDDEN));
    }

    #[test]
    fn blacklist_helpers_deduplicate() {
        let registry = SettingsRegistry::new();
        registry.blacklist_serial("ABC-1");
        registry.blacklist_serial("ABC-1");
        registry.blacklist_serial("DEF-2");
        assert_eq!(registry.device_blacklist(), vec!["ABC-1", "DEF-2"]);
        assert!(registry.unblacklist_serial("ABC-1"));
        assert!(!registry.unblacklist_serial("ABC-1"));
        assert_eq!(registry.device_blacklist(), vec!["DEF-2"]);
    }
}
