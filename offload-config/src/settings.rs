//! The full settings catalog: every tunable the engine recognizes, declared
//! with its category, description, and default in one place so the
//! import/export layer can walk the catalog without per-component knowledge.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::entry::{ConfigEntry, EntryDescriptor};

pub const CAT_INDEX: &str = "index";
pub const CAT_FILTER: &str = "filter";
pub const CAT_SCHEDULER: &str = "scheduler";
pub const CAT_STORAGE: &str = "storage";
pub const CAT_RECYCLER: &str = "recycler";
pub const CAT_DISCOVERY: &str = "discovery";
pub const CAT_DEVICE: &str = "device";

// --- index / hashing ---

pub static HASH_BUFFER_SIZE: ConfigEntry<i32> = ConfigEntry::new(
    "hash_buffer_size",
    CAT_INDEX,
    "Buffer size in bytes for streaming content digests",
    || 65_536,
);

pub static SAVE_INITIAL_DELAY_S: ConfigEntry<i32> = ConfigEntry::new(
    "save_initial_delay_s",
    CAT_INDEX,
    "Seconds before the first fingerprint index persistence tick",
    || 30,
);

pub static SAVE_DELAY_S: ConfigEntry<i32> = ConfigEntry::new(
    "save_delay_s",
    CAT_INDEX,
    "Seconds between fingerprint index persistence ticks",
    || 60,
);

// --- file filter ---

pub static FILE_FILTER_MAX_SIZE: ConfigEntry<i64> = ConfigEntry::new(
    "file_filter_max_size",
    CAT_FILTER,
    "Reject files larger than this many bytes (0 disables the cap)",
    || 0,
);

pub static FILE_FILTER_TIME_ENABLED: ConfigEntry<bool> = ConfigEntry::new(
    "file_filter_time_enabled",
    CAT_FILTER,
    "Reject files last modified before the configured window",
    || false,
);

pub static FILE_FILTER_TIME_VALUE: ConfigEntry<i32> = ConfigEntry::new(
    "file_filter_time_value",
    CAT_FILTER,
    "Length of the modification window, in time-unit steps",
    || 365,
);

pub static FILE_FILTER_TIME_UNIT: ConfigEntry<String> = ConfigEntry::new(
    "file_filter_time_unit",
    CAT_FILTER,
    "Unit for the modification window: HOURS, DAYS, WEEKS, MONTHS or YEARS",
    || "DAYS".to_string(),
);

pub static FILE_FILTER_INCLUDE_HIDDEN: ConfigEntry<bool> = ConfigEntry::new(
    "file_filter_include_hidden",
    CAT_FILTER,
    "Accept hidden files and files inside hidden directories",
    || false,
);

pub static FILE_FILTER_SKIP_SYMLINKS: ConfigEntry<bool> = ConfigEntry::new(
    "file_filter_skip_symlinks",
    CAT_FILTER,
    "Reject symbolic links instead of following them",
    || true,
);

pub static FILE_FILTER_ALLOW_NO_EXT: ConfigEntry<bool> = ConfigEntry::new(
    "file_filter_allow_no_ext",
    CAT_FILTER,
    "Accept files without an extension when suffix filtering is active",
    || false,
);

pub static SUFFIX_FILTER_MODE: ConfigEntry<String> = ConfigEntry::new(
    "suffix_filter_mode",
    CAT_FILTER,
    "Suffix filter mode: NONE, WHITELIST or BLACKLIST",
    || "NONE".to_string(),
);

pub static SUFFIX_FILTER_WHITELIST: ConfigEntry<Vec<String>> = ConfigEntry::new(
    "suffix_filter_whitelist",
    CAT_FILTER,
    "Extensions accepted in WHITELIST mode (without dots)",
    || {
        ["pdf", "doc", "docx", "xls", "xlsx", "ppt", "pptx", "txt"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    },
);

pub static SUFFIX_FILTER_BLACKLIST: ConfigEntry<Vec<String>> = ConfigEntry::new(
    "suffix_filter_blacklist",
    CAT_FILTER,
    "Extensions rejected in BLACKLIST mode (without dots)",
    || {
        ["tmp", "swp", "bak", "part", "crdownload", "lnk"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    },
);

pub static SUFFIX_FILTER_PRESET: ConfigEntry<String> = ConfigEntry::new(
    "suffix_filter_preset",
    CAT_FILTER,
    "Built-in extension catalog overriding the configured lists \
     (DOCUMENTS, IMAGES, VIDEO, AUDIO, ARCHIVES, ALL; empty for none)",
    String::new,
);

// --- scheduler ---

pub static PRIORITY_DEFAULT: ConfigEntry<i32> = ConfigEntry::new(
    "priority_default",
    CAT_SCHEDULER,
    "Base priority for copy tasks whose extension has no mapping",
    || 5,
);

pub static PRIORITY_MAP: ConfigEntry<Vec<String>> = ConfigEntry::new(
    "priority_map",
    CAT_SCHEDULER,
    "Extension priority overrides as ext=0..10 pairs",
    || {
        ["pdf=8", "docx=8", "xlsx=8", "jpg=4", "mp4=2"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    },
);

pub static RETRY_COUNT: ConfigEntry<i32> = ConfigEntry::new(
    "retry_count",
    CAT_SCHEDULER,
    "Retry budget for transient read errors during a copy",
    || 3,
);

pub static WORKER_POOL_SIZE: ConfigEntry<i32> = ConfigEntry::new(
    "worker_pool_size",
    CAT_SCHEDULER,
    "Copy worker pool size (0 sizes from the CPU count)",
    || 0,
);

pub static QUEUE_CAPACITY: ConfigEntry<i32> = ConfigEntry::new(
    "queue_capacity",
    CAT_SCHEDULER,
    "Bound on queued copy tasks before submission degrades to inline runs",
    || 10_000,
);

pub static COPY_SPEED_TARGET_BYTES: ConfigEntry<i64> = ConfigEntry::new(
    "copy_speed_target_bytes",
    CAT_SCHEDULER,
    "Aggregate copy throughput (bytes/s) considered full load",
    || 64 * 1024 * 1024,
);

pub static RATE_BASE_PER_MINUTE: ConfigEntry<i32> = ConfigEntry::new(
    "rate_base_per_minute",
    CAT_SCHEDULER,
    "Task admissions per minute at low load; scaled down with load level",
    || 120,
);

// --- storage ---

pub static WORK_PATH: ConfigEntry<String> = ConfigEntry::new(
    "work_path",
    CAT_STORAGE,
    "Local work area that receives unique copies",
    default_work_path,
);

pub static STORAGE_RESERVED_BYTES: ConfigEntry<i64> = ConfigEntry::new(
    "storage_reserved_bytes",
    CAT_STORAGE,
    "Headroom the recycler keeps free below the storage cap",
    || 1024 * 1024 * 1024,
);

pub static STORAGE_MAX_BYTES: ConfigEntry<i64> = ConfigEntry::new(
    "storage_max_bytes",
    CAT_STORAGE,
    "Upper bound on work-area usage before reclamation starts",
    || 64 * 1024 * 1024 * 1024,
);

pub static STORAGE_WARNING_ENABLED: ConfigEntry<bool> = ConfigEntry::new(
    "storage_warning_enabled",
    CAT_STORAGE,
    "Emit storage level events when usage crosses a band",
    || true,
);

// --- recycler ---

pub static RECYCLER_STRATEGY: ConfigEntry<String> = ConfigEntry::new(
    "recycler_strategy",
    CAT_RECYCLER,
    "Reclamation order: TIME_FIRST (oldest) or SIZE_FIRST (largest)",
    || "TIME_FIRST".to_string(),
);

pub static RECYCLER_PROTECTED_AGE_HOURS: ConfigEntry<i32> = ConfigEntry::new(
    "recycler_protected_age_hours",
    CAT_RECYCLER,
    "Files younger than this are never reclaimed",
    || 24,
);

// --- discovery ---

pub static SNIFFER_WAIT_NORMAL_MINUTES: ConfigEntry<i32> = ConfigEntry::new(
    "sniffer_wait_normal_minutes",
    CAT_DISCOVERY,
    "Minutes before a completed device scan is restarted",
    || 30,
);

pub static SNIFFER_WAIT_ERROR_MINUTES: ConfigEntry<i32> = ConfigEntry::new(
    "sniffer_wait_error_minutes",
    CAT_DISCOVERY,
    "Minutes before a failed device scan is restarted",
    || 5,
);

pub static WALK_MAX_DEPTH: ConfigEntry<i32> = ConfigEntry::new(
    "walk_max_depth",
    CAT_DISCOVERY,
    "Directory depth bound for the initial device walk",
    || 32,
);

pub static WATCH_DEBOUNCE_MS: ConfigEntry<i32> = ConfigEntry::new(
    "watch_debounce_ms",
    CAT_DISCOVERY,
    "Window for coalescing duplicate filesystem change notifications",
    || 500,
);

// --- device manager ---

pub static DEVICE_BLACKLIST_BY_SERIAL: ConfigEntry<Vec<String>> = ConfigEntry::new(
    "device_blacklist_by_serial",
    CAT_DEVICE,
    "Hardware serials the device manager must ignore",
    Vec::new,
);

pub static INITIAL_DELAY_S: ConfigEntry<i32> = ConfigEntry::new(
    "initial_delay_s",
    CAT_DEVICE,
    "Seconds before the first device poll",
    || 2,
);

pub static DELAY_S: ConfigEntry<i32> = ConfigEntry::new(
    "delay_s",
    CAT_DEVICE,
    "Seconds between device polls",
    || 5,
);

fn default_work_path() -> String {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("offload")
        .to_string_lossy()
        .to_string()
}

/// Every declared entry, in stable catalog order.
pub fn descriptors() -> Vec<&'static dyn EntryDescriptor> {
    vec![
        &HASH_BUFFER_SIZE,
        &SAVE_INITIAL_DELAY_S,
        &SAVE_DELAY_S,
        &FILE_FILTER_MAX_SIZE,
        &FILE_FILTER_TIME_ENABLED,
        &FILE_FILTER_TIME_VALUE,
        &FILE_FILTER_TIME_UNIT,
        &FILE_FILTER_INCLUDE_HIDDEN,
        &FILE_FILTER_SKIP_SYMLINKS,
        &FILE_FILTER_ALLOW_NO_EXT,
        &SUFFIX_FILTER_MODE,
        &SUFFIX_FILTER_WHITELIST,
        &SUFFIX_FILTER_BLACKLIST,
        &SUFFIX_FILTER_PRESET,
        &PRIORITY_DEFAULT,
        &PRIORITY_MAP,
        &RETRY_COUNT,
        &WORKER_POOL_SIZE,
        &QUEUE_CAPACITY,
        &COPY_SPEED_TARGET_BYTES,
        &RATE_BASE_PER_MINUTE,
        &WORK_PATH,
        &STORAGE_RESERVED_BYTES,
        &STORAGE_MAX_BYTES,
        &STORAGE_WARNING_ENABLED,
        &RECYCLER_STRATEGY,
        &RECYCLER_PROTECTED_AGE_HOURS,
        &SNIFFER_WAIT_NORMAL_MINUTES,
        &SNIFFER_WAIT_ERROR_MINUTES,
        &WALK_MAX_DEPTH,
        &WATCH_DEBOUNCE_MS,
        &DEVICE_BLACKLIST_BY_SERIAL,
        &INITIAL_DELAY_S,
        &DELAY_S,
    ]
}

/// Unit for the modification-time filter window.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeUnit {
    Hours,
    Days,
    Weeks,
    Months,
    Years,
}

impl TimeUnit {
    /// Parse the stored form; unknown text falls back to days with a warning.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "HOURS" => Self::Hours,
            "DAYS" => Self::Days,
            "WEEKS" => Self::Weeks,
            "MONTHS" => Self::Months,
            "YEARS" => Self::Years,
            other => {
                warn!(unit = other, "unknown time unit, assuming DAYS");
                Self::Days
            }
        }
    }

    /// Window length for `value` steps of this unit. Months and years use
    /// calendar-free approximations (30 and 365 days).
    pub fn window(self, value: i64) -> chrono::Duration {
        match self {
            Self::Hours => chrono::Duration::hours(value),
            Self::Days => chrono::Duration::days(value),
            Self::Weeks => chrono::Duration::weeks(value),
            Self::Months => chrono::Duration::days(value * 30),
            Self::Years => chrono::Duration::days(value * 365),
        }
    }
}

/// Suffix filter mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SuffixFilterMode {
    None,
    Whitelist,
    Blacklist,
}

impl SuffixFilterMode {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "NONE" | "" => Self::None,
            "WHITELIST" => Self::Whitelist,
            "BLACKLIST" => Self::Blacklist,
            other => {
                warn!(mode = other, "unknown suffix filter mode, assuming NONE");
                Self::None
            }
        }
    }
}

/// Built-in extension catalogs selectable by name.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SuffixPreset {
    Documents,
    Images,
    Video,
    Audio,
    Archives,
    All,
}

impl SuffixPreset {
    /// `None` for the empty string; unknown names also return `None` so the
    /// caller can fall back to the configured list (with its own warning).
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "" => None,
            "DOCUMENTS" => Some(Self::Documents),
            "IMAGES" => Some(Self::Images),
            "VIDEO" => Some(Self::Video),
            "AUDIO" => Some(Self::Audio),
            "ARCHIVES" => Some(Self::Archives),
            "ALL" => Some(Self::All),
            _ => None,
        }
    }
}

/// Order in which the recycler reclaims aged files.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecyclerStrategy {
    TimeFirst,
    SizeFirst,
}

impl RecyclerStrategy {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "TIME_FIRST" => Self::TimeFirst,
            "SIZE_FIRST" => Self::SizeFirst,
            other => {
                warn!(
                    strategy = other,
                    "unknown recycler strategy, assuming TIME_FIRST"
                );
                Self::TimeFirst
            }
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::TimeFirst => "TIME_FIRST",
            Self::SizeFirst => "SIZE_FIRST",
        }
    }
}

/// Parse the `priority_map` list (`ext=0..10` pairs) into a lookup table.
/// Malformed pairs and out-of-range priorities are skipped with a warning.
pub fn parse_priority_map(items: &[String]) -> HashMap<String, u8> {
    let mut map = HashMap::new();
    for item in items {
        let Some((ext, priority)) = item.split_once('=') else {
            warn!(entry = item.as_str(), "malformed priority_map entry");
            continue;
        };
        match priority.trim().parse::<u8>() {
            Ok(priority) if priority <= 10 => {
                map.insert(ext.trim().to_ascii_lowercase(), priority);
            }
            _ => {
                warn!(entry = item.as_str(), "priority outside 0..=10, skipping");
            }
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptors_have_unique_keys() {
        let mut keys: Vec<_> = descriptors().iter().map(|d| d.key()).collect();
        keys.sort_unstable();
        let before = keys.len();
        keys.dedup();
        assert_eq!(keys.len(), before);
    }

    #[test]
    fn time_unit_parse_is_case_insensitive() {
        assert_eq!(TimeUnit::parse("weeks"), TimeUnit::Weeks);
        assert_eq!(TimeUnit::parse("bogus"), TimeUnit::Days);
    }

    #[test]
    fn preset_parse_distinguishes_empty_from_unknown() {
        assert_eq!(SuffixPreset::parse(""), None);
        assert_eq!(SuffixPreset::parse("IMAGES"), Some(SuffixPreset::Images));
        assert_eq!(SuffixPreset::parse("NOT_A_PRESET"), None);
    }

    #[test]
    fn priority_map_skips_malformed_pairs() {
        let items = vec![
            "pdf=9".to_string(),
            "broken".to_string(),
            "mp4=99".to_string(),
            "JPG=3".to_string(),
        ];
        let map = parse_priority_map(&items);
        assert_eq!(map.get("pdf"), Some(&9));
        assert_eq!(map.get("jpg"), Some(&3));
        assert_eq!(map.len(), 2);
    }
}
