//! End-to-end engine wiring: a fake volume probe, the real device manager,
//! discovery, scheduler, index, and statistics all talking over one bus.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use offload_config::{SettingsRegistry, settings};
use offload_core::device::{KnownSerials, VolumeInfo, VolumeProbe};
use offload_core::discover::DiscoveryManager;
use offload_core::schedule::TaskSink;
use offload_core::{
    CopyStatistics, DeviceManager, DeviceSerial, EventBus, FingerprintIndex, IndexStore,
    SystemClock, TaskScheduler,
};

struct FakeProbe {
    volumes: Mutex<Vec<VolumeInfo>>,
}

impl FakeProbe {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            volumes: Mutex::new(Vec::new()),
        })
    }

    fn set(&self, volumes: Vec<VolumeInfo>) {
        *self.volumes.lock().unwrap() = volumes;
    }
}

impl VolumeProbe for FakeProbe {
    fn volumes(&self) -> io::Result<Vec<VolumeInfo>> {
        Ok(self.volumes.lock().unwrap().clone())
    }
}

struct Engine {
    settings: Arc<SettingsRegistry>,
    probe: Arc<FakeProbe>,
    manager: Arc<DeviceManager>,
    scheduler: Arc<TaskScheduler>,
    discovery: DiscoveryManager,
    index: Arc<FingerprintIndex>,
    stats: CopyStatistics,
    work: tempfile::TempDir,
    state: tempfile::TempDir,
}

fn engine() -> Engine {
    let work = tempfile::tempdir().unwrap();
    let state = tempfile::tempdir().unwrap();

    let settings = Arc::new(SettingsRegistry::new());
    settings.set(
        &settings::WORK_PATH,
        work.path().to_string_lossy().to_string(),
    );
    settings.set(&settings::WORKER_POOL_SIZE, 2);
    settings.set(&settings::WATCH_DEBOUNCE_MS, 50);
    settings.set(&settings::RATE_BASE_PER_MINUTE, 60_000);

    let bus = Arc::new(EventBus::new());
    let stats = CopyStatistics::attach(&bus);
    let index = Arc::new(FingerprintIndex::new(bus.clone()));
    let probe = FakeProbe::new();
    let manager = Arc::new(DeviceManager::new(
        bus.clone(),
        settings.clone(),
        probe.clone(),
        KnownSerials::new(state.path().join("serials.txt")),
    ));
    let scheduler = Arc::new(
        TaskScheduler::new(
            bus.clone(),
            settings.clone(),
            index.clone(),
            manager.clone(),
            Arc::new(SystemClock),
        )
        .unwrap(),
    );
    let discovery = DiscoveryManager::new(
        bus.clone(),
        settings.clone(),
        manager.clone(),
        scheduler.clone() as Arc<dyn TaskSink>,
    );
    discovery.attach();
    scheduler.start();

    Engine {
        settings,
        probe,
        manager,
        scheduler,
        discovery,
        index,
        stats,
        work,
        state,
    }
}

fn write(root: &Path, rel: &str, bytes: &[u8]) -> PathBuf {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(&path, bytes).unwrap();
    path
}

fn stick(root: &Path) -> VolumeInfo {
    VolumeInfo {
        root: root.to_path_buf(),
        label: "STICK".to_string(),
        serial: "SER-1".to_string(),
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool, what: &str) {
    for _ in 0..600 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test(flavor = "multi_thread")]
async fn insertion_discovery_dedupe_and_watch() {
    let engine = engine();
    let device = tempfile::tempdir().unwrap();

    write(device.path(), "docs/A.pdf", b"shared contract text");
    write(device.path(), "docs/A-copy.pdf", b"shared contract text");
    write(device.path(), "notes/B.txt", b"unique note");
    write(device.path(), ".trash/ignored.txt", b"hidden");

    engine.probe.set(vec![stick(device.path())]);
    engine.manager.poll().unwrap();

    // Three visible files discovered; the hidden directory is pruned.
    wait_until(
        || engine.stats.snapshot().files_discovered >= 3,
        "initial discovery",
    )
    .await;
    wait_until(
        || engine.stats.snapshot().copies_succeeded >= 3,
        "initial copies",
    )
    .await;

    let snapshot = engine.stats.snapshot();
    assert_eq!(snapshot.files_discovered, 3);
    assert_eq!(snapshot.copies_succeeded, 3);
    assert_eq!(snapshot.copies_failed, 0);
    // Two identical payloads collapse to one indexed fingerprint.
    assert_eq!(snapshot.duplicates, 1);
    assert_eq!(engine.index.len(), 2);

    // The work area mirrors device-relative paths under the label.
    let copied_b = engine.work.path().join("STICK/notes/B.txt");
    assert_eq!(fs::read(&copied_b).unwrap(), b"unique note");
    let pdf_copies = ["docs/A.pdf", "docs/A-copy.pdf"]
        .iter()
        .filter(|rel| engine.work.path().join("STICK").join(rel).exists())
        .count();
    assert_eq!(pdf_copies, 1, "only one of the identical files is written");

    // Phase B: a file appearing after the walk flows through the watcher.
    write(device.path(), "notes/C.txt", b"late arrival");
    wait_until(
        || engine.stats.snapshot().copies_succeeded >= 4,
        "watched file copy",
    )
    .await;
    assert_eq!(
        fs::read(engine.work.path().join("STICK/notes/C.txt")).unwrap(),
        b"late arrival"
    );

    engine.discovery.shutdown();
    engine.scheduler.stop(Duration::from_secs(2)).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn index_survives_sessions_and_recalls_ghosts() {
    let engine = engine();
    let device = tempfile::tempdir().unwrap();
    write(device.path(), "report.pdf", b"first session payload");

    engine.probe.set(vec![stick(device.path())]);
    engine.manager.poll().unwrap();
    wait_until(
        || engine.stats.snapshot().copies_succeeded >= 1,
        "first session copy",
    )
    .await;

    // Persist and reload into a "second session" index.
    let store = IndexStore::new(engine.state.path().join("index.bin"));
    store.save(&engine.index.snapshot()).unwrap();

    let second_bus = Arc::new(EventBus::new());
    let second_index = Arc::new(FingerprintIndex::new(second_bus));
    let loaded = store.load_into(&second_index).unwrap();
    assert_eq!(loaded, 1);
    assert_eq!(second_index.len(), engine.index.len());

    // The serial file from session one recalls the device as a ghost.
    let second_manager = Arc::new(DeviceManager::new(
        Arc::new(EventBus::new()),
        engine.settings.clone(),
        FakeProbe::new(),
        KnownSerials::new(engine.state.path().join("serials.txt")),
    ));
    let ghosts = second_manager.snapshot();
    assert_eq!(ghosts.len(), 1);
    assert_eq!(ghosts[0].serial.as_str(), "SER-1");
    assert!(ghosts[0].root.is_none());

    engine.discovery.shutdown();
    engine.scheduler.stop(Duration::from_secs(2)).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn device_removal_cancels_discovery_and_future_tasks() {
    let engine = engine();
    let device = tempfile::tempdir().unwrap();
    write(device.path(), "a.txt", b"payload a");

    engine.probe.set(vec![stick(device.path())]);
    engine.manager.poll().unwrap();
    wait_until(
        || engine.stats.snapshot().copies_succeeded >= 1,
        "initial copy",
    )
    .await;
    wait_until(|| engine.discovery.active_scans() == 1, "scan active").await;

    // Pull the stick: discovery is cancelled and the device goes offline.
    engine.probe.set(vec![]);
    engine.manager.poll().unwrap();
    wait_until(|| engine.discovery.active_scans() == 0, "scan cancelled").await;

    let serial = DeviceSerial::new("SER-1").unwrap();
    let snapshot = engine.manager.device(&serial).unwrap();
    assert!(snapshot.root.is_none());

    // A straggler task for the gone device is cancelled, not copied.
    engine.scheduler.submit(offload_core::CopyTask::new(
        device.path().join("a.txt"),
        serial,
        device.path().to_path_buf(),
        "STICK".into(),
        None,
    ));
    wait_until(
        || engine.stats.snapshot().copies_cancelled >= 1,
        "straggler cancelled",
    )
    .await;
    assert_eq!(engine.stats.snapshot().copies_failed, 0);

    engine.discovery.shutdown();
    engine.scheduler.stop(Duration::from_secs(2)).await;

    // Terminal results stay exclusive: every task ended exactly once.
    let finished = engine.stats.snapshot();
    assert_eq!(finished.copies_succeeded, 1);
    assert_eq!(finished.copies_cancelled, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn empty_probe_is_quiet() {
    let engine = engine();
    engine.manager.poll().unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(engine.stats.snapshot(), Default::default());
    assert!(engine.manager.snapshot().is_empty());
    assert_eq!(engine.scheduler.queue_len(), 0);

    engine.scheduler.stop(Duration::from_secs(1)).await;
}
