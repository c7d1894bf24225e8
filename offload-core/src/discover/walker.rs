use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use offload_config::{SettingsRegistry, settings};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::filter::FileFilter;

/// Bounds and toggles for the initial device walk.
#[derive(Clone, Debug)]
pub struct WalkOptions {
    pub max_depth: usize,
    pub include_hidden: bool,
    pub skip_symlinks: bool,
}

impl WalkOptions {
    pub fn from_settings(settings: &Arc<SettingsRegistry>) -> Self {
        Self {
            max_depth: settings.get(&settings::WALK_MAX_DEPTH).max(1) as usize,
            include_hidden: settings.get(&settings::FILE_FILTER_INCLUDE_HIDDEN),
            skip_symlinks: settings.get(&settings::FILE_FILTER_SKIP_SYMLINKS),
        }
    }
}

/// Counters for one walk pass.
#[derive(Clone, Copy, Debug, Default)]
pub struct WalkStats {
    pub files_seen: u64,
    pub files_matched: u64,
    pub errors: u64,
    pub cancelled: bool,
}

/// Depth-bounded traversal of a device root. Every regular file goes through
/// the filter chain; survivors are handed to `on_match` with their size.
/// Unreadable entries are counted and skipped, never fatal.
pub fn walk_device(
    root: &Path,
    options: &WalkOptions,
    filter: &dyn FileFilter,
    cancel: &CancellationToken,
    mut on_match: impl FnMut(PathBuf, u64),
) -> WalkStats {
    let mut stats = WalkStats::default();
    let mut stack: Vec<(PathBuf, usize)> = vec![(root.to_path_buf(), 0)];

    while let Some((dir, depth)) = stack.pop() {
        if cancel.is_cancelled() {
            stats.cancelled = true;
            break;
        }

        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) => {
                debug!(dir = %dir.display(), "cannot read directory: {err}");
                stats.errors += 1;
                continue;
            }
        };

        for entry in entries {
            if cancel.is_cancelled() {
                stats.cancelled = true;
                return stats;
            }
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    trace!(dir = %dir.display(), "bad directory entry: {err}");
                    stats.errors += 1;
                    continue;
                }
            };
            let path = entry.path();
            let mut meta = match fs::symlink_metadata(&path) {
                Ok(meta) => meta,
                Err(err) => {
                    trace!(path = %path.display(), "cannot stat: {err}");
                    stats.errors += 1;
                    continue;
                }
            };

            if meta.file_type().is_symlink() {
                if options.skip_symlinks {
                    continue;
                }
                meta = match fs::metadata(&path) {
                    Ok(resolved) => resolved,
                    Err(err) => {
                        trace!(path = %path.display(), "dangling symlink: {err}");
                        stats.errors += 1;
                        continue;
                    }
                };
            }

            if meta.is_dir() {
                if !options.include_hidden && hidden_name(&path) {
                    continue;
                }
                if depth + 1 < options.max_depth {
                    stack.push((path, depth + 1));
                }
                continue;
            }

            stats.files_seen += 1;
            if filter.matches(&path, &meta) {
                stats.files_matched += 1;
                on_match(path, meta.len());
            }
        }
    }

    stats
}

fn hidden_name(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.starts_with('.'))
}
