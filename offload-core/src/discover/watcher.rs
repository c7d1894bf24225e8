use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::{OffloadError, Result};
use crate::filter::FileFilter;

/// Why the watch phase ended.
#[derive(Debug)]
pub enum WatchEnd {
    /// The device went away or the engine is stopping.
    Cancelled,
    /// The underlying watcher died; the caller should re-walk the device.
    Lost(String),
}

/// Live change feed for a device root.
///
/// Create/modify notifications are debounced per path within `debounce`,
/// stat'ed, pushed through the same filter chain as the initial walk, and
/// handed to `on_candidate`.
pub async fn watch_device(
    root: &Path,
    debounce: Duration,
    filter: Arc<dyn FileFilter>,
    cancel: CancellationToken,
    mut on_candidate: impl FnMut(PathBuf, u64),
) -> Result<WatchEnd> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut watcher = RecommendedWatcher::new(
        move |result: std::result::Result<Event, notify::Error>| {
            let _ = tx.send(result);
        },
        Config::default(),
    )
    .map_err(|err| OffloadError::Watch(err.to_string()))?;
    watcher
        .watch(root, RecursiveMode::Recursive)
        .map_err(|err| OffloadError::Watch(err.to_string()))?;
    debug!(root = %root.display(), "watching device root");

    let mut recent: HashMap<PathBuf, Instant> = HashMap::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(WatchEnd::Cancelled),
            received = rx.recv() => {
                let event = match received {
                    None => return Ok(WatchEnd::Lost("watch channel closed".into())),
                    Some(Err(err)) => return Ok(WatchEnd::Lost(err.to_string())),
                    Some(Ok(event)) => event,
                };
                if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                    continue;
                }

                let now = Instant::now();
                recent.retain(|_, last| now.duration_since(*last) < debounce);

                for path in event.paths {
                    if recent
                        .get(&path)
                        .is_some_and(|last| now.duration_since(*last) < debounce)
                    {
                        trace!(path = %path.display(), "debounced duplicate notification");
                        continue;
                    }
                    recent.insert(path.clone(), now);

                    let Ok(meta) = fs::symlink_metadata(&path) else {
                        continue;
                    };
                    if meta.is_file() && filter.matches(&path, &meta) {
                        on_candidate(path, meta.len());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs::File;
    use std::io::Write;
    use std::sync::Mutex;

    use super::*;
    use crate::filter::default_chain;
    use offload_config::SettingsRegistry;

    #[tokio::test(flavor = "multi_thread")]
    async fn sees_files_created_after_watch_starts() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let cancel = CancellationToken::new();

        let watch = {
            let seen = seen.clone();
            let cancel = cancel.clone();
            let filter = default_chain(Arc::new(SettingsRegistry::new()));
            let root = root.clone();
            tokio::spawn(async move {
                watch_device(&root, Duration::from_millis(50), filter, cancel, {
                    let seen = seen.clone();
                    move |path, size| seen.lock().unwrap().push((path, size))
                })
                .await
            })
        };

        // Give the watcher a moment to register before writing.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let path = root.join("fresh.txt");
        File::create(&path).unwrap().write_all(b"payload").unwrap();

        for _ in 0..100 {
            if !seen.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        cancel.cancel();
        let end = watch.await.unwrap().unwrap();
        assert!(matches!(end, WatchEnd::Cancelled));

        let seen = seen.lock().unwrap();
        assert!(
            seen.iter().any(|(p, size)| p.ends_with("fresh.txt") && *size == 7),
            "expected fresh.txt in {seen:?}"
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cancel_ends_the_watch() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let filter = default_chain(Arc::new(SettingsRegistry::new()));
        let end = watch_device(
            dir.path(),
            Duration::from_millis(50),
            filter,
            cancel,
            |_, _| {},
        )
        .await
        .unwrap();
        assert!(matches!(end, WatchEnd::Cancelled));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn missing_root_reports_a_watch_error() {
        let dir = tempfile::tempdir().unwrap();
        let gone = dir.path().join("not-there");
        let filter = default_chain(Arc::new(SettingsRegistry::new()));
        let result = watch_device(
            &gone,
            Duration::from_millis(50),
            filter,
            CancellationToken::new(),
            |_, _| {},
        )
        .await;
        assert!(result.is_err());
    }
}
