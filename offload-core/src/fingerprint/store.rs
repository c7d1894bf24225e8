use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use offload_config::{SettingsRegistry, settings};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use super::{Fingerprint, FingerprintIndex};
use crate::error::Result;
use crate::events::{IndexLoaded, IndexSaved};
use crate::service::Service;

/// On-disk form of the fingerprint set: length-prefixed digests followed by a
/// zero-length terminator. The reader stops silently at a truncated tail, so
/// a crash mid-write never poisons the next startup.
#[derive(Clone, Debug)]
pub struct IndexStore {
    path: PathBuf,
}

impl IndexStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read persisted fingerprints into `index` and emit [`IndexLoaded`].
    ///
    /// A record with an unexpected width is treated as corruption: the
    /// in-memory set is cleared and the remaining records are abandoned; the
    /// next save rewrites the file.
    pub fn load_into(&self, index: &FingerprintIndex) -> io::Result<usize> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no fingerprint index file yet");
                index.bus().index_loaded().publish(&IndexLoaded::new(0));
                return Ok(0);
            }
            Err(err) => return Err(err),
        };

        let mut reader = BufReader::new(file);
        let mut loaded = 0usize;
        loop {
            let mut len_buf = [0u8; 4];
            match reader.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(err) => return Err(err),
            }
            let len = u32::from_be_bytes(len_buf) as usize;
            if len == 0 {
                // Trailing terminator.
                break;
            }
            if len != Fingerprint::LEN {
                warn!(
                    path = %self.path.display(),
                    record_len = len,
                    "corrupt fingerprint record, discarding loaded entries"
                );
                index.clear_loaded();
                loaded = 0;
                break;
            }
            let mut digest = [0u8; Fingerprint::LEN];
            match reader.read_exact(&mut digest) {
                Ok(()) => {
                    index.insert_loaded(Fingerprint::from_bytes(digest));
                    loaded += 1;
                }
                Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(err) => return Err(err),
            }
        }

        info!(entries = loaded, path = %self.path.display(), "fingerprint index loaded");
        index.bus().index_loaded().publish(&IndexLoaded::new(loaded));
        Ok(loaded)
    }

    /// Whole-file replace: write to a temp file in the same directory, then
    /// rename over the target.
    pub fn save(&self, fingerprints: &[Fingerprint]) -> io::Result<()> {
        let parent = self.path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent)?;

        let mut temp = NamedTempFile::new_in(parent)?;
        for fingerprint in fingerprints {
            temp.write_all(&(Fingerprint::LEN as u32).to_be_bytes())?;
            temp.write_all(fingerprint.as_bytes())?;
        }
        temp.write_all(&0u32.to_be_bytes())?;
        temp.flush()?;
        temp.persist(&self.path).map_err(|err| err.error)?;
        Ok(())
    }
}

/// Periodic persistence for the fingerprint index: saves when dirty, leaves
/// the dirty flag set when a save fails so the next tick retries.
pub struct IndexPersistence {
    index: Arc<FingerprintIndex>,
    store: IndexStore,
    settings: Arc<SettingsRegistry>,
}

impl IndexPersistence {
    pub fn new(
        index: Arc<FingerprintIndex>,
        store: IndexStore,
        settings: Arc<SettingsRegistry>,
    ) -> Self {
        Self {
            index,
            store,
            settings,
        }
    }

    /// One save attempt; returns whether anything was written.
    pub fn save_now(&self) -> bool {
        persist(&self.index, &self.store)
    }
}

fn persist(index: &FingerprintIndex, store: &IndexStore) -> bool {
    if !index.begin_save() {
        return false;
    }
    let snapshot = index.snapshot();
    match store.save(&snapshot) {
        Ok(()) => {
            debug!(entries = snapshot.len(), "fingerprint index saved");
            index
                .bus()
                .index_saved()
                .publish(&IndexSaved::new(snapshot.len()));
            true
        }
        Err(err) => {
            warn!(
                path = %store.path().display(),
                "failed to save fingerprint index, will retry: {err}"
            );
            index.mark_dirty();
            false
        }
    }
}

impl std::fmt::Debug for IndexPersistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexPersistence")
            .field("store", &self.store)
            .field("index", &self.index)
            .finish()
    }
}

#[async_trait]
impl Service for IndexPersistence {
    fn name(&self) -> &'static str {
        "index-persistence"
    }

    fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.settings.get(&settings::SAVE_DELAY_S).max(1) as u64)
    }

    fn initial_delay(&self) -> Duration {
        Duration::from_secs(self.settings.get(&settings::SAVE_INITIAL_DELAY_S).max(0) as u64)
    }

    async fn tick(&self) -> Result<()> {
        let index = self.index.clone();
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || persist(&index, &store))
            .await
            .map_err(|err| crate::error::OffloadError::Internal(err.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Mutex;

    use super::*;
    use crate::events::EventBus;

    fn new_index() -> Arc<FingerprintIndex> {
        Arc::new(FingerprintIndex::new(Arc::new(EventBus::new())))
    }

    #[test]
    fn save_then_load_round_trips_the_set() {
        let dir = tempfile::tempdir().unwrap();
        let store = IndexStore::new(dir.path().join("index.bin"));

        let source = new_index();
        for i in 0u32..50 {
            source.insert(Fingerprint::of_bytes(&i.to_be_bytes()));
        }
        store.save(&source.snapshot()).unwrap();

        let target = new_index();
        let loaded = store.load_into(&target).unwrap();
        assert_eq!(loaded, 50);

        let source_set: HashSet<_> = source.snapshot().into_iter().collect();
        let target_set: HashSet<_> = target.snapshot().into_iter().collect();
        assert_eq!(source_set, target_set);
    }

    #[test]
    fn load_tolerates_truncated_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.bin");
        let store = IndexStore::new(&path);

        let source = new_index();
        source.insert(Fingerprint::of_bytes(b"one"));
        source.insert(Fingerprint::of_bytes(b"two"));
        store.save(&source.snapshot()).unwrap();

        // Chop the file mid-record, as a crashed writer would leave it.
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 20]).unwrap();

        let target = new_index();
        let loaded = store.load_into(&target).unwrap();
        assert_eq!(loaded, 1);
        assert!(!target.is_dirty());

        // Dirty flag flips on the first add after a tolerant load.
        target.insert(Fingerprint::of_bytes(b"three"));
        assert!(target.is_dirty());
    }

    #[test]
    fn load_clears_set_on_corrupt_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.bin");

        let mut payload = Vec::new();
        payload.extend_from_slice(&(Fingerprint::LEN as u32).to_be_bytes());
        payload.extend_from_slice(Fingerprint::of_bytes(b"ok").as_bytes());
        // Record with a nonsense width.
        payload.extend_from_slice(&7u32.to_be_bytes());
        payload.extend_from_slice(&[1, 2, 3, 4, 5, 6, 7]);
        std::fs::write(&path, payload).unwrap();

        let target = new_index();
        let loaded = IndexStore::new(&path).load_into(&target).unwrap();
        assert_eq!(loaded, 0);
        assert!(target.is_empty());
    }

    #[test]
    fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let target = new_index();
        let loaded = IndexStore::new(dir.path().join("absent.bin"))
            .load_into(&target)
            .unwrap();
        assert_eq!(loaded, 0);
    }

    #[test]
    fn failed_save_keeps_dirty_for_retry() {
        let dir = tempfile::tempdir().unwrap();
        // A directory at the target path makes the rename fail.
        let path = dir.path().join("index.bin");
        std::fs::create_dir_all(&path).unwrap();

        let index = new_index();
        index.insert(Fingerprint::of_bytes(b"x"));
        let store = IndexStore::new(&path);

        assert!(!persist(&index, &store));
        assert!(index.is_dirty());
    }

    #[test]
    fn save_emits_index_saved_event() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(EventBus::new());
        let saved = Arc::new(Mutex::new(Vec::new()));
        {
            let saved = saved.clone();
            bus.index_saved()
                .subscribe_fn(move |event| saved.lock().unwrap().push(event.entries));
        }

        let index = Arc::new(FingerprintIndex::new(bus));
        index.insert(Fingerprint::of_bytes(b"x"));
        let store = IndexStore::new(dir.path().join("index.bin"));

        assert!(persist(&index, &store));
        assert!(!persist(&index, &store));
        assert_eq!(*saved.lock().unwrap(), vec![1]);
    }
}
