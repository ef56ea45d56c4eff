//! kache store: keyed cache of the latest known state plus the coalescing delta queue.
//!
//! The store has exactly one writer (`StoreWriter`, held by the controller's dispatch loop)
//! and any number of readers (`Store`). Readers either look up single keys under a read lock
//! or load a frozen `StoreSnapshot`, which is rebuilt lazily after each mutation.

#![forbid(unsafe_code)]

pub mod queue;

pub use queue::{DeltaQueue, Popped};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use arc_swap::ArcSwapOption;
use kache_core::{ObjectKey, Resource, ResourceVersion};
use rustc_hash::FxHashMap;
use tokio::sync::watch;
use tracing::debug;

/// Immutable view of the whole store at one epoch.
#[derive(Debug, Clone, Default)]
pub struct StoreSnapshot {
    pub epoch: u64,
    pub version: ResourceVersion,
    pub items: Vec<Arc<Resource>>,
}

#[derive(Default)]
struct Items {
    map: FxHashMap<ObjectKey, Arc<Resource>>,
    version: ResourceVersion,
}

struct Inner {
    items: RwLock<Items>,
    epoch: AtomicU64,
    frozen: ArcSwapOption<StoreSnapshot>,
    epoch_tx: watch::Sender<u64>,
}

impl Inner {
    fn read(&self) -> RwLockReadGuard<'_, Items> { self.items.read().unwrap_or_else(PoisonError::into_inner) }
    fn write(&self) -> RwLockWriteGuard<'_, Items> { self.items.write().unwrap_or_else(PoisonError::into_inner) }

    /// Must be called with the write lock held.
    fn bump(&self) {
        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        self.frozen.store(None);
        self.epoch_tx.send_replace(epoch);
    }
}

/// Read handle. Cheap to clone and safe to share with any number of tasks.
#[derive(Clone)]
pub struct Store {
    inner: Arc<Inner>,
}

impl Store {
    pub fn get(&self, key: &ObjectKey) -> Option<Arc<Resource>> { self.inner.read().map.get(key).cloned() }

    pub fn contains(&self, key: &ObjectKey) -> bool { self.inner.read().map.contains_key(key) }

    /// All objects, in no particular order.
    pub fn list(&self) -> Vec<Arc<Resource>> { self.snapshot().items.clone() }

    pub fn keys(&self) -> Vec<ObjectKey> { self.inner.read().map.keys().cloned().collect() }

    pub fn len(&self) -> usize { self.inner.read().map.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Version passed to the most recent `replace`.
    pub fn version(&self) -> ResourceVersion { self.inner.read().version }

    pub fn epoch(&self) -> u64 { self.inner.epoch.load(Ordering::Acquire) }

    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> { self.inner.epoch_tx.subscribe() }

    /// Consistent view of every object. Reuses the last frozen view while no mutation happened.
    pub fn snapshot(&self) -> Arc<StoreSnapshot> {
        if let Some(frozen) = self.inner.frozen.load_full() {
            if frozen.epoch == self.epoch() {
                return frozen;
            }
        }
        let guard = self.inner.read();
        let snap = Arc::new(StoreSnapshot {
            epoch: self.inner.epoch.load(Ordering::Acquire),
            version: guard.version,
            items: guard.map.values().cloned().collect(),
        });
        drop(guard);
        // A stale store here is harmless: the epoch check above rejects it.
        self.inner.frozen.store(Some(Arc::clone(&snap)));
        snap
    }
}

/// The single mutation handle.
pub struct StoreWriter {
    inner: Arc<Inner>,
}

impl StoreWriter {
    pub fn new() -> Self {
        let (epoch_tx, _) = watch::channel(0u64);
        Self {
            inner: Arc::new(Inner {
                items: RwLock::new(Items::default()),
                epoch: AtomicU64::new(0),
                frozen: ArcSwapOption::empty(),
                epoch_tx,
            }),
        }
    }

    pub fn reader(&self) -> Store { Store { inner: Arc::clone(&self.inner) } }

    /// Swap the whole content at once; readers see either the old or the new set.
    pub fn replace(&self, items: Vec<Resource>, version: ResourceVersion) {
        let map: FxHashMap<ObjectKey, Arc<Resource>> = items.into_iter().map(|r| (r.key.clone(), Arc::new(r))).collect();
        let mut guard = self.inner.write();
        debug!(count = map.len(), %version, "store replace");
        guard.map = map;
        guard.version = version;
        self.inner.bump();
    }

    /// Insert or overwrite; returns the previous state.
    pub fn update(&self, resource: Resource) -> Option<Arc<Resource>> {
        self.update_shared(Arc::new(resource))
    }

    pub fn update_shared(&self, resource: Arc<Resource>) -> Option<Arc<Resource>> {
        let mut guard = self.inner.write();
        let prev = guard.map.insert(resource.key.clone(), resource);
        self.inner.bump();
        prev
    }

    /// Remove; returns the last stored state, if any.
    pub fn delete(&self, key: &ObjectKey) -> Option<Arc<Resource>> {
        let mut guard = self.inner.write();
        let prev = guard.map.remove(key);
        if prev.is_some() {
            self.inner.bump();
        }
        prev
    }
}

impl Default for StoreWriter {
    fn default() -> Self { Self::new() }
}
