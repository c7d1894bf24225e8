use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tokio::task::JoinHandle;
use tracing::error;

use super::{
    CopyCompleted, DeviceInserted, DeviceJoined, DeviceRemoved, DeviceStateChanged,
    DuplicateDetected, EmptyFoldersDeleted, FileDiscovered, FileIndexed, FilesRecycled,
    IndexLoaded, IndexSaved, StorageLevelChanged,
};

/// Handle returned by [`Topic::subscribe`]; identifies a registration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

/// Shared listener callback for events of type `E`.
pub type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Registration<E> {
    id: SubscriberId,
    callback: Listener<E>,
}

/// The listener registry for one concrete event type.
///
/// Fan-out runs in registration order; a panicking listener is logged and the
/// remaining listeners still run. Registering the same callback handle twice
/// is a no-op (identity is the `Arc` pointer).
pub struct Topic<E> {
    name: &'static str,
    next_id: AtomicU64,
    listeners: RwLock<Vec<Registration<E>>>,
}

impl<E> fmt::Debug for Topic<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Topic")
            .field("name", &self.name)
            .field(
                "subscribers",
                &self
                    .listeners
                    .read()
                    .map(|listeners| listeners.len())
                    .unwrap_or_default(),
            )
            .finish()
    }
}

impl<E: Clone + Send + Sync + 'static> Topic<E> {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            next_id: AtomicU64::new(1),
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Register a listener; returns its id. Duplicate handles are no-ops and
    /// return the existing id.
    pub fn subscribe(&self, callback: Listener<E>) -> SubscriberId {
        let mut listeners = self.listeners.write().expect("topic lock poisoned");
        if let Some(existing) = listeners
            .iter()
            .find(|reg| Arc::ptr_eq(&reg.callback, &callback))
        {
            return existing.id;
        }
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        listeners.push(Registration { id, callback });
        id
    }

    /// Convenience wrapper for plain closures.
    pub fn subscribe_fn(&self, callback: impl Fn(&E) + Send + Sync + 'static) -> SubscriberId {
        self.subscribe(Arc::new(callback))
    }

    /// Drop a registration; returns whether it existed.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let mut listeners = self.listeners.write().expect("topic lock poisoned");
        let before = listeners.len();
        listeners.retain(|reg| reg.id != id);
        listeners.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.listeners
            .read()
            .map(|listeners| listeners.len())
            .unwrap_or_default()
    }

    fn snapshot(&self) -> Vec<Listener<E>> {
        self.listeners
            .read()
            .expect("topic lock poisoned")
            .iter()
            .map(|reg| reg.callback.clone())
            .collect()
    }

    /// Synchronous fan-out on the calling thread, in registration order.
    pub fn publish(&self, event: &E) {
        for callback in self.snapshot() {
            if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                error!(topic = self.name, "event listener panicked");
            }
        }
    }

    /// Fan-out on the shared worker pool. The returned future completes once
    /// every listener has run, whether or not it panicked.
    pub fn publish_async(&self, event: E) -> impl Future<Output = ()> + Send + 'static + use<E> {
        let name = self.name;
        let handles: Vec<JoinHandle<()>> = self
            .snapshot()
            .into_iter()
            .map(|callback| {
                let event = event.clone();
                tokio::spawn(async move {
                    if catch_unwind(AssertUnwindSafe(|| callback(&event))).is_err() {
                        error!(topic = name, "event listener panicked");
                    }
                })
            })
            .collect();
        async move {
            futures::future::join_all(handles).await;
        }
    }
}

/// Typed handle for result-returning dispatch: responders map an event to an
/// `R` and dispatch gathers every answer.
pub struct RequestTopic<E, R> {
    name: &'static str,
    next_id: AtomicU64,
    responders: RwLock<Vec<(SubscriberId, Arc<dyn Fn(&E) -> R + Send + Sync>)>>,
}

impl<E, R> fmt::Debug for RequestTopic<E, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let responders = self
            .responders
            .read()
            .map(|responders| responders.len())
            .unwrap_or_default();
        f.debug_struct("RequestTopic")
            .field("name", &self.name)
            .field("responders", &responders)
            .finish()
    }
}

impl<E, R> RequestTopic<E, R>
where
    E: Clone + Send + Sync + 'static,
    R: Send + 'static,
{
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            next_id: AtomicU64::new(1),
            responders: RwLock::new(Vec::new()),
        }
    }

    pub fn respond(&self, f: impl Fn(&E) -> R + Send + Sync + 'static) -> SubscriberId {
        let mut responders = self.responders.write().expect("topic lock poisoned");
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        responders.push((id, Arc::new(f)));
        id
    }

    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let mut responders = self.responders.write().expect("topic lock poisoned");
        let before = responders.len();
        responders.retain(|(existing, _)| *existing != id);
        responders.len() != before
    }

    /// Run every responder on the shared pool and collect the answers in
    /// registration order. Panicked responders are logged and skipped.
    pub fn dispatch(&self, event: E) -> impl Future<Output = Vec<R>> + Send + 'static + use<E, R> {
        let name = self.name;
        let handles: Vec<JoinHandle<Option<R>>> = self
            .responders
            .read()
            .expect("topic lock poisoned")
            .iter()
            .map(|(_, responder)| {
                let responder = responder.clone();
                let event = event.clone();
                tokio::spawn(async move {
                    match catch_unwind(AssertUnwindSafe(|| responder(&event))) {
                        Ok(result) => Some(result),
                        Err(_) => {
                            error!(topic = name, "event responder panicked");
                            None
                        }
                    }
                })
            })
            .collect();
        async move {
            futures::future::join_all(handles)
                .await
                .into_iter()
                .filter_map(|joined| joined.ok().flatten())
                .collect()
        }
    }
}

/// One topic per event class; listeners never see events outside the class
/// they registered for, and no dynamic type lookup is involved.
pub struct EventBus {
    device_joined: Topic<DeviceJoined>,
    device_inserted: Topic<DeviceInserted>,
    device_removed: Topic<DeviceRemoved>,
    device_state_changed: Topic<DeviceStateChanged>,
    file_discovered: Topic<FileDiscovered>,
    file_indexed: Topic<FileIndexed>,
    duplicate_detected: Topic<DuplicateDetected>,
    copy_completed: Topic<CopyCompleted>,
    index_loaded: Topic<IndexLoaded>,
    index_saved: Topic<IndexSaved>,
    empty_folders_deleted: Topic<EmptyFoldersDeleted>,
    files_recycled: Topic<FilesRecycled>,
    storage_level_changed: Topic<StorageLevelChanged>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            device_joined: Topic::new("device_joined"),
            device_inserted: Topic::new("device_inserted"),
            device_removed: Topic::new("device_removed"),
            device_state_changed: Topic::new("device_state_changed"),
            file_discovered: Topic::new("file_discovered"),
            file_indexed: Topic::new("file_indexed"),
            duplicate_detected: Topic::new("duplicate_detected"),
            copy_completed: Topic::new("copy_completed"),
            index_loaded: Topic::new("index_loaded"),
            index_saved: Topic::new("index_saved"),
            empty_folders_deleted: Topic::new("empty_folders_deleted"),
            files_recycled: Topic::new("files_recycled"),
            storage_level_changed: Topic::new("storage_level_changed"),
        }
    }

    pub fn device_joined(&self) -> &Topic<DeviceJoined> {
        &self.device_joined
    }

    pub fn device_inserted(&self) -> &Topic<DeviceInserted> {
        &self.device_inserted
    }

    pub fn device_removed(&self) -> &Topic<DeviceRemoved> {
        &self.device_removed
    }

    pub fn device_state_changed(&self) -> &Topic<DeviceStateChanged> {
        &self.device_state_changed
    }

    pub fn file_discovered(&self) -> &Topic<FileDiscovered> {
        &self.file_discovered
    }

    pub fn file_indexed(&self) -> &Topic<FileIndexed> {
        &self.file_indexed
    }

    pub fn duplicate_detected(&self) -> &Topic<DuplicateDetected> {
        &self.duplicate_detected
    }

    pub fn copy_completed(&self) -> &Topic<CopyCompleted> {
        &self.copy_completed
    }

    pub fn index_loaded(&self) -> &Topic<IndexLoaded> {
        &self.index_loaded
    }

    pub fn index_saved(&self) -> &Topic<IndexSaved> {
        &self.index_saved
    }

    pub fn empty_folders_deleted(&self) -> &Topic<EmptyFoldersDeleted> {
        &self.empty_folders_deleted
    }

    pub fn files_recycled(&self) -> &Topic<FilesRecycled> {
        &self.files_recycled
    }

    pub fn storage_level_changed(&self) -> &Topic<StorageLevelChanged> {
        &self.storage_level_changed
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("device_joined", &self.device_joined.subscriber_count())
            .field("device_inserted", &self.device_inserted.subscriber_count())
            .field("copy_completed", &self.copy_completed.subscriber_count())
            .field("file_discovered", &self.file_discovered.subscriber_count())
            .finish_non_exhaustive()
    }
}
