use std::fs::Metadata;
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use offload_config::{SettingsRegistry, settings};
use tracing::trace;

use super::FileFilter;

/// Attribute gate applied to every discovered path: regular files only,
/// symlink and hidden handling, the size cap, and the modification window.
pub struct BasicFilter {
    settings: Arc<SettingsRegistry>,
}

impl BasicFilter {
    pub fn new(settings: Arc<SettingsRegistry>) -> Self {
        Self { settings }
    }
}

impl FileFilter for BasicFilter {
    fn matches(&self, path: &Path, meta: &Metadata) -> bool {
        if meta.file_type().is_symlink() {
            // Callers resolve links up front when following is configured, so
            // a link here is either skipped or unresolvable.
            if self.settings.get(&settings::FILE_FILTER_SKIP_SYMLINKS) {
                trace!(path = %path.display(), "rejected: symlink");
                return false;
            }
            return false;
        }

        if !meta.is_file() {
            trace!(path = %path.display(), "rejected: not a regular file");
            return false;
        }

        if !self.settings.get(&settings::FILE_FILTER_INCLUDE_HIDDEN) && is_hidden(path, meta) {
            trace!(path = %path.display(), "rejected: hidden");
            return false;
        }

        let max_size = self.settings.get(&settings::FILE_FILTER_MAX_SIZE);
        if max_size > 0 && meta.len() > max_size as u64 {
            trace!(path = %path.display(), size = meta.len(), "rejected: over size cap");
            return false;
        }

        if self.settings.get(&settings::FILE_FILTER_TIME_ENABLED) {
            let unit =
                settings::TimeUnit::parse(&self.settings.get(&settings::FILE_FILTER_TIME_UNIT));
            let value = i64::from(self.settings.get(&settings::FILE_FILTER_TIME_VALUE));
            let cutoff = Utc::now() - unit.window(value.max(0));

            match meta.modified() {
                Ok(modified) => {
                    if to_utc(modified) < cutoff {
                        trace!(path = %path.display(), "rejected: older than window");
                        return false;
                    }
                }
                Err(err) => {
                    trace!(path = %path.display(), "rejected: unreadable mtime: {err}");
                    return false;
                }
            }
        }

        true
    }
}

impl std::fmt::Debug for BasicFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BasicFilter").finish_non_exhaustive()
    }
}

fn to_utc(time: SystemTime) -> DateTime<Utc> {
    DateTime::<Utc>::from(time)
}

#[cfg(unix)]
fn is_hidden(path: &Path, _meta: &Metadata) -> bool {
    leading_dot(path)
}

#[cfg(windows)]
fn is_hidden(path: &Path, meta: &Metadata) -> bool {
    use std::os::windows::fs::MetadataExt;
    const FILE_ATTRIBUTE_HIDDEN: u32 = 0x2;
    leading_dot(path) || meta.file_attributes() & FILE_ATTRIBUTE_HIDDEN != 0
}

#[cfg(not(any(unix, windows)))]
fn is_hidden(path: &Path, _meta: &Metadata) -> bool {
    leading_dot(path)
}

fn leading_dot(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.starts_with('.'))
}

#[cfg(test)]
mod tests {
    use std::fs::{self, File};
    use std::io::Write;

    use super::*;

    fn filter_with(settings: Arc<SettingsRegistry>) -> BasicFilter {
        BasicFilter::new(settings)
    }

    fn write_file(dir: &Path, name: &str, len: usize) -> std::path::PathBuf {
        let path = dir.join(name);
        File::create(&path)
            .unwrap()
            .write_all(&vec![0u8; len])
            .unwrap();
        path
    }

    #[test]
    fn accepts_plain_regular_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "report.pdf", 128);
        let meta = fs::symlink_metadata(&path).unwrap();

        let filter = filter_with(Arc::new(SettingsRegistry::new()));
        assert!(filter.matches(&path, &meta));
    }

    #[test]
    fn rejects_directories() {
        let dir = tempfile::tempdir().unwrap();
        let meta = fs::symlink_metadata(dir.path()).unwrap();

        let filter = filter_with(Arc::new(SettingsRegistry::new()));
        assert!(!filter.matches(dir.path(), &meta));
    }

    #[test]
    fn hidden_files_follow_the_toggle() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), ".secret", 16);
        let meta = fs::symlink_metadata(&path).unwrap();

        let settings = Arc::new(SettingsRegistry::new());
        let filter = filter_with(settings.clone());
        assert!(!filter.matches(&path, &meta));

        settings.set(&settings::FILE_FILTER_INCLUDE_HIDDEN, true);
        assert!(filter.matches(&path, &meta));
    }

    #[test]
    fn size_cap_rejects_oversize() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "big.bin", 2048);
        let meta = fs::symlink_metadata(&path).unwrap();

        let settings = Arc::new(SettingsRegistry::new());
        settings.set(&settings::FILE_FILTER_MAX_SIZE, 1024i64);
        let filter = filter_with(settings.clone());
        assert!(!filter.matches(&path, &meta));

        settings.set(&settings::FILE_FILTER_MAX_SIZE, 4096i64);
        assert!(filter.matches(&path, &meta));
    }

    #[test]
    fn zero_cap_means_unlimited() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "any.bin", 4096);
        let meta = fs::symlink_metadata(&path).unwrap();

        let filter = filter_with(Arc::new(SettingsRegistry::new()));
        assert!(filter.matches(&path, &meta));
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_are_rejected_when_skipping() {
        let dir = tempfile::tempdir().unwrap();
        let target = write_file(dir.path(), "target.txt", 8);
        let link = dir.path().join("link.txt");
        std::os::unix::fs::symlink(&target, &link).unwrap();
        let meta = fs::symlink_metadata(&link).unwrap();

        let filter = filter_with(Arc::new(SettingsRegistry::new()));
        assert!(!filter.matches(&link, &meta));
    }

    #[test]
    fn fresh_files_pass_the_time_window() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "fresh.txt", 8);
        let meta = fs::symlink_metadata(&path).unwrap();

        let settings = Arc::new(SettingsRegistry::new());
        settings.set(&settings::FILE_FILTER_TIME_ENABLED, true);
        settings.set(&settings::FILE_FILTER_TIME_VALUE, 1);
        settings.set(&settings::FILE_FILTER_TIME_UNIT, "HOURS".to_string());

        let filter = filter_with(settings);
        assert!(filter.matches(&path, &meta));
    }
}
