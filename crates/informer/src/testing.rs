//! In-memory `ObjectSource` and a recording listener, for tests and demos.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::StreamExt;
use kache_core::{ListPage, ObjectKey, ObjectSource, Resource, ResourceVersion, SourceError, WatchEvent, WatchStream};
use tokio::sync::{mpsc, Notify};

use crate::handler::ResourceEventHandler;

type EventTx = mpsc::UnboundedSender<Result<WatchEvent, SourceError>>;

#[derive(Default)]
struct FakeState {
    objects: BTreeMap<ObjectKey, Resource>,
    version: u64,
    history: Vec<(u64, WatchEvent)>,
    /// Watches starting before this version fail with `Expired`.
    compacted: u64,
    watchers: Vec<EventTx>,
    list_failures: VecDeque<SourceError>,
    watch_failures: VecDeque<SourceError>,
    list_calls: usize,
    watch_calls: usize,
}

impl FakeState {
    fn emit(&mut self, version: u64, event: WatchEvent) {
        self.history.push((version, event.clone()));
        self.watchers.retain(|tx| tx.send(Ok(event.clone())).is_ok());
    }
}

/// Scripted object source. Clones share state, so a test keeps one handle while the informer
/// owns another.
#[derive(Clone, Default)]
pub struct FakeSource {
    state: Arc<Mutex<FakeState>>,
}

impl FakeSource {
    pub fn new() -> Self { Self::default() }

    fn lock(&self) -> MutexGuard<'_, FakeState> { self.state.lock().unwrap_or_else(PoisonError::into_inner) }

    /// Create or modify an object, emitting Added/Modified to open watches.
    pub fn apply(&self, key: ObjectKey, payload: serde_json::Value) -> Resource {
        let mut st = self.lock();
        st.version += 1;
        let version = st.version;
        let obj = Resource::new(key.clone(), ResourceVersion(version), payload);
        let existed = st.objects.insert(key, obj.clone()).is_some();
        let event = if existed { WatchEvent::Modified(obj.clone()) } else { WatchEvent::Added(obj.clone()) };
        st.emit(version, event);
        obj
    }

    pub fn delete(&self, key: &ObjectKey) -> Option<Resource> {
        let mut st = self.lock();
        let mut obj = st.objects.remove(key)?;
        st.version += 1;
        let version = st.version;
        obj.version = ResourceVersion(version);
        st.emit(version, WatchEvent::Deleted(obj.clone()));
        Some(obj)
    }

    /// Change content without telling any watcher; only a relist reveals it.
    pub fn apply_silently(&self, key: ObjectKey, payload: serde_json::Value) -> Resource {
        let mut st = self.lock();
        st.version += 1;
        let obj = Resource::new(key.clone(), ResourceVersion(st.version), payload);
        st.objects.insert(key, obj.clone());
        obj
    }

    /// Push a raw item (bookmark, error, malformed marker) to open watches.
    pub fn inject(&self, item: Result<WatchEvent, SourceError>) {
        self.lock().watchers.retain(|tx| tx.send(item.clone()).is_ok());
    }

    pub fn bookmark(&self) {
        let mut st = self.lock();
        st.version += 1;
        let version = st.version;
        st.emit(version, WatchEvent::Bookmark(ResourceVersion(version)));
    }

    /// End every open watch stream.
    pub fn close_watches(&self) { self.lock().watchers.clear(); }

    /// Forget history so any watch from an older cursor reports `Expired`.
    pub fn compact(&self) {
        let mut st = self.lock();
        st.compacted = st.version;
        st.history.clear();
    }

    pub fn fail_next_list(&self, e: SourceError) { self.lock().list_failures.push_back(e); }

    pub fn fail_next_watch(&self, e: SourceError) { self.lock().watch_failures.push_back(e); }

    pub fn list_calls(&self) -> usize { self.lock().list_calls }

    pub fn watch_calls(&self) -> usize { self.lock().watch_calls }

    pub fn open_watches(&self) -> usize { self.lock().watchers.iter().filter(|tx| !tx.is_closed()).count() }

    /// Poll until `open_watches() >= n` or the timeout passes.
    pub async fn wait_for_watches(&self, n: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.open_watches() < n {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        true
    }

    pub fn objects(&self) -> Vec<Resource> { self.lock().objects.values().cloned().collect() }
}

#[async_trait::async_trait]
impl ObjectSource for FakeSource {
    async fn list(&self) -> Result<ListPage, SourceError> {
        let mut st = self.lock();
        st.list_calls += 1;
        if let Some(e) = st.list_failures.pop_front() {
            return Err(e);
        }
        Ok(ListPage { items: st.objects.values().cloned().collect(), version: ResourceVersion(st.version) })
    }

    async fn watch(&self, from: ResourceVersion) -> Result<WatchStream, SourceError> {
        let mut st = self.lock();
        st.watch_calls += 1;
        if let Some(e) = st.watch_failures.pop_front() {
            return Err(e);
        }
        if from.0 < st.compacted {
            return Err(SourceError::Expired(format!("{} is older than {}", from, st.compacted)));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        for (version, event) in &st.history {
            if *version > from.0 {
                let _ = tx.send(Ok(event.clone()));
            }
        }
        st.watchers.push(tx);
        let stream = futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) });
        Ok(stream.boxed())
    }
}

/// What a `Recorder` observed, by key name and version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recorded {
    Add { key: String, version: u64 },
    Update { key: String, old: u64, new: u64 },
    Delete { key: String, version: u64 },
}

/// Listener that records every callback.
#[derive(Clone, Default)]
pub struct Recorder {
    events: Arc<Mutex<Vec<Recorded>>>,
    notify: Arc<Notify>,
}

impl Recorder {
    pub fn new() -> Self { Self::default() }

    pub fn events(&self) -> Vec<Recorded> { self.events.lock().unwrap_or_else(PoisonError::into_inner).clone() }

    fn record(&self, r: Recorded) {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).push(r);
        self.notify.notify_waiters();
    }

    /// Wait until at least `n` events were recorded.
    pub async fn wait_for(&self, n: usize, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.events().len() >= n {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }
}

#[async_trait::async_trait]
impl ResourceEventHandler for Recorder {
    async fn on_add(&self, obj: &Resource) -> anyhow::Result<()> {
        self.record(Recorded::Add { key: obj.key.to_string(), version: obj.version.0 });
        Ok(())
    }

    async fn on_update(&self, old: &Resource, new: &Resource) -> anyhow::Result<()> {
        self.record(Recorded::Update { key: new.key.to_string(), old: old.version.0, new: new.version.0 });
        Ok(())
    }

    async fn on_delete(&self, obj: &Resource) -> anyhow::Result<()> {
        self.record(Recorded::Delete { key: obj.key.to_string(), version: obj.version.0 });
        Ok(())
    }
}
