use std::fs::Metadata;
use std::path::Path;
use std::sync::Arc;

use offload_config::settings::{SuffixFilterMode, SuffixPreset};
use offload_config::{SettingsRegistry, settings};
use tracing::warn;

use super::FileFilter;

const DOCUMENT_EXTENSIONS: &[&str] = &[
    "pdf", "doc", "docx", "xls", "xlsx", "ppt", "pptx", "odt", "ods", "odp", "rtf", "txt", "md",
    "csv",
];

const IMAGE_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "gif", "bmp", "webp", "tif", "tiff", "svg", "heic", "raw",
];

const VIDEO_EXTENSIONS: &[&str] = &[
    "mp4", "mkv", "avi", "mov", "webm", "flv", "wmv", "m4v", "mpg", "mpeg",
];

const AUDIO_EXTENSIONS: &[&str] = &[
    "mp3", "flac", "wav", "aac", "ogg", "m4a", "wma", "opus", "aiff",
];

const ARCHIVE_EXTENSIONS: &[&str] = &["zip", "rar", "7z", "tar", "gz", "bz2", "xz", "zst", "iso"];

/// Extensions belonging to a built-in preset catalog.
pub fn preset_extensions(preset: SuffixPreset) -> Vec<&'static str> {
    match preset {
        SuffixPreset::Documents => DOCUMENT_EXTENSIONS.to_vec(),
        SuffixPreset::Images => IMAGE_EXTENSIONS.to_vec(),
        SuffixPreset::Video => VIDEO_EXTENSIONS.to_vec(),
        SuffixPreset::Audio => AUDIO_EXTENSIONS.to_vec(),
        SuffixPreset::Archives => ARCHIVE_EXTENSIONS.to_vec(),
        SuffixPreset::All => [
            DOCUMENT_EXTENSIONS,
            IMAGE_EXTENSIONS,
            VIDEO_EXTENSIONS,
            AUDIO_EXTENSIONS,
            ARCHIVE_EXTENSIONS,
        ]
        .concat(),
    }
}

/// Routes files by their (lowercased) extension according to the configured
/// mode: pass everything, require membership in the effective whitelist, or
/// require absence from the effective blacklist.
pub struct SuffixFilter {
    settings: Arc<SettingsRegistry>,
}

impl SuffixFilter {
    pub fn new(settings: Arc<SettingsRegistry>) -> Self {
        Self { settings }
    }

    /// The list the active mode compares against: a preset catalog when one
    /// is configured, else the mode's own list. An unrecognized preset name
    /// falls back to the configured list.
    fn effective_set(&self, mode: SuffixFilterMode) -> Vec<String> {
        let preset_raw = self.settings.get(&settings::SUFFIX_FILTER_PRESET);
        if !preset_raw.trim().is_empty() {
            match SuffixPreset::parse(&preset_raw) {
                Some(preset) => {
                    return preset_extensions(preset)
                        .into_iter()
                        .map(str::to_string)
                        .collect();
                }
                None => {
                    warn!(
                        preset = preset_raw.as_str(),
                        "unknown suffix preset, using configured list"
                    );
                }
            }
        }
        match mode {
            SuffixFilterMode::Whitelist => self.settings.get(&settings::SUFFIX_FILTER_WHITELIST),
            SuffixFilterMode::Blacklist => self.settings.get(&settings::SUFFIX_FILTER_BLACKLIST),
            SuffixFilterMode::None => Vec::new(),
        }
    }
}

impl FileFilter for SuffixFilter {
    fn matches(&self, path: &Path, _meta: &Metadata) -> bool {
        let mode = SuffixFilterMode::parse(&self.settings.get(&settings::SUFFIX_FILTER_MODE));
        if mode == SuffixFilterMode::None {
            return true;
        }

        let Some(extension) = extension_of(path) else {
            return self.settings.get(&settings::FILE_FILTER_ALLOW_NO_EXT);
        };

        let set = self.effective_set(mode);
        let listed = set.iter().any(|s| s.eq_ignore_ascii_case(&extension));
        match mode {
            SuffixFilterMode::Whitelist => listed,
            SuffixFilterMode::Blacklist => !listed,
            SuffixFilterMode::None => true,
        }
    }
}

impl std::fmt::Debug for SuffixFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SuffixFilter").finish_non_exhaustive()
    }
}

/// The substring after the last `.` in the file name, lowercased, when that
/// dot is neither leading nor trailing. `.profile` and `trailing.` have no
/// extension.
pub fn extension_of(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    let dot = name.rfind('.')?;
    if dot == 0 || dot == name.len() - 1 {
        return None;
    }
    Some(name[dot + 1..].to_ascii_lowercase())
}
