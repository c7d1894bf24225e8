//! Work-area reclamation: the empty-folder sweep, usage banding, and
//! strategy-ordered file recycling.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use offload_config::settings::RecyclerStrategy;
use offload_config::{SettingsRegistry, settings};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{OffloadError, Result};
use crate::events::{EmptyFoldersDeleted, EventBus, FilesRecycled, StorageLevelChanged};
use crate::service::Service;

/// Work-area usage band.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum StorageLevel {
    Normal,
    Warning,
    Critical,
}

/// An aged work-area file considered for reclamation.
#[derive(Clone, Debug)]
struct AgedFile {
    path: PathBuf,
    size: u64,
    modified: SystemTime,
}

/// Periodically sweeps empty folders out of the work area and, when usage
/// exceeds the configured cap minus reserve, deletes aged files in strategy
/// order until headroom returns. Files younger than the protection window
/// are never touched.
pub struct Recycler {
    bus: Arc<EventBus>,
    settings: Arc<SettingsRegistry>,
    last_level: Arc<Mutex<Option<StorageLevel>>>,
}

impl Recycler {
    pub fn new(bus: Arc<EventBus>, settings: Arc<SettingsRegistry>) -> Self {
        Self {
            bus,
            settings,
            last_level: Arc::new(Mutex::new(None)),
        }
    }

    /// One full pass: sweep, band, reclaim. Also the service tick body.
    pub fn run_once(&self) {
        let work_root = PathBuf::from(self.settings.get(&settings::WORK_PATH));
        if !work_root.is_dir() {
            return;
        }

        // (a) Empty-folder sweep.
        let mut deleted = Vec::new();
        sweep_children(&work_root, &mut deleted);
        if !deleted.is_empty() {
            info!(count = deleted.len(), "deleted empty work-area folders");
            self.bus
                .empty_folders_deleted()
                .publish(&EmptyFoldersDeleted::new(deleted));
        }

        // (b) Usage accounting and banding.
        let (mut used, mut files) = scan_usage(&work_root);
        let max_bytes = self.settings.get(&settings::STORAGE_MAX_BYTES).max(0) as u64;
        let reserved = self.settings.get(&settings::STORAGE_RESERVED_BYTES).max(0) as u64;
        if max_bytes == 0 {
            return;
        }
        let critical_at = max_bytes.saturating_sub(reserved);
        let warning_at = max_bytes.saturating_sub(reserved.saturating_mul(2));

        self.publish_level(if used > critical_at {
            StorageLevel::Critical
        } else if used > warning_at {
            StorageLevel::Warning
        } else {
            StorageLevel::Normal
        });

        // (c) Reclamation once usage crosses the cap minus reserve.
        if used <= critical_at {
            return;
        }
        let shortfall = used - critical_at;
        let protected_for = Duration::from_secs(
            self.settings
                .get(&settings::RECYCLER_PROTECTED_AGE_HOURS)
                .max(0) as u64
                * 3600,
        );
        let now = SystemTime::now();
        files.retain(|file| {
            now.duration_since(file.modified)
                .map(|age| age >= protected_for)
                .unwrap_or(false)
        });

        let strategy =
            RecyclerStrategy::parse(&self.settings.get(&settings::RECYCLER_STRATEGY));
        order_for(strategy, &mut files);

        let mut reclaimed = Vec::new();
        let mut bytes_reclaimed = 0u64;
        for file in files {
            if bytes_reclaimed >= shortfall {
                break;
            }
            match fs::remove_file(&file.path) {
                Ok(()) => {
                    bytes_reclaimed += file.size;
                    reclaimed.push(file.path);
                }
                // Workers hold no directory locks; losing a race is fine.
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => {
                    warn!(path = %file.path.display(), "could not recycle file: {err}");
                }
            }
        }

        if !reclaimed.is_empty() {
            used = used.saturating_sub(bytes_reclaimed);
            info!(
                count = reclaimed.len(),
                bytes = bytes_reclaimed,
                remaining_used = used,
                strategy = strategy.as_str(),
                "reclaimed work-area files"
            );
            self.bus.files_recycled().publish(&FilesRecycled::new(
                reclaimed,
                strategy,
                bytes_reclaimed,
            ));
        }
    }

    fn publish_level(&self, level: StorageLevel) {
        if !self.settings.get(&settings::STORAGE_WARNING_ENABLED) {
            return;
        }
        let mut last = self.last_level.lock().expect("recycler lock poisoned");
        if *last != Some(level) {
            debug!(?level, "storage level changed");
            *last = Some(level);
            self.bus
                .storage_level_changed()
                .publish(&StorageLevelChanged::new(level));
        }
    }
}

impl std::fmt::Debug for Recycler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Recycler").finish_non_exhaustive()
    }
}

#[async_trait]
impl Service for Recycler {
    fn name(&self) -> &'static str {
        "recycler"
    }

    fn tick_interval(&self) -> Duration {
        Duration::from_secs(60)
    }

    async fn tick(&self) -> Result<()> {
        // The whole pass is blocking filesystem work.
        let pass = Recycler {
            bus: self.bus.clone(),
            settings: self.settings.clone(),
            last_level: self.last_level.clone(),
        };
        tokio::task::spawn_blocking(move || pass.run_once())
            .await
            .map_err(|err| OffloadError::Internal(err.to_string()))?;
        Ok(())
    }
}

/// Depth-first pass over `root`'s children deleting directories that were
/// empty at inspection time, bottom-up. A directory holding only
/// subdirectories when inspected survives this pass even if those children
/// are deleted beneath it; a later pass collects it.
fn sweep_children(root: &Path, deleted: &mut Vec<PathBuf>) {
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(_) => return,
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            sweep_directory(&path, deleted);
        }
    }
}

fn sweep_directory(dir: &Path, deleted: &mut Vec<PathBuf>) {
    let children: Vec<PathBuf> = match fs::read_dir(dir) {
        Ok(entries) => entries.flatten().map(|entry| entry.path()).collect(),
        Err(err) if err.kind() == io::ErrorKind::NotFound => return,
        Err(_) => return,
    };
    let was_empty = children.is_empty();

    for child in &children {
        if child.is_dir() {
            sweep_directory(child, deleted);
        }
    }

    if was_empty {
        match fs::remove_dir(dir) {
            Ok(()) => deleted.push(dir.to_path_buf()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => debug!(dir = %dir.display(), "could not remove empty dir: {err}"),
        }
    }
}

/// Total bytes under `root` plus the per-file inventory.
fn scan_usage(root: &Path) -> (u64, Vec<AgedFile>) {
    let mut used = 0u64;
    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(_) => continue,
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let Ok(meta) = fs::symlink_metadata(&path) else {
                continue;
            };
            if meta.is_dir() {
                stack.push(path);
            } else if meta.is_file() {
                used += meta.len();
                files.push(AgedFile {
                    path,
                    size: meta.len(),
                    modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                });
            }
        }
    }
    (used, files)
}

fn order_for(strategy: RecyclerStrategy, files: &mut [AgedFile]) {
    match strategy {
        // Oldest first; bigger files break ties.
        RecyclerStrategy::TimeFirst => files.sort_by(|a, b| {
            a.modified
                .cmp(&b.modified)
                .then_with(|| b.size.cmp(&a.size))
        }),
        // Largest first; older files break ties.
        RecyclerStrategy::SizeFirst => files.sort_by(|a, b| {
            b.size
                .cmp(&a.size)
                .then_with(|| a.modified.cmp(&b.modified))
        }),
    }
}
