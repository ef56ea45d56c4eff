//! Coalescing delta queue keyed by object, FIFO across keys.
//!
//! Holds at most one pending delta per key. A new event for a pending key is folded into the
//! pending delta so consumers only ever see the net change:
//!
//! | pending  | incoming          | result                         |
//! |----------|-------------------|--------------------------------|
//! | Added    | Added/Updated/Sync| Added, latest payload          |
//! | Added    | Deleted           | entry removed                  |
//! | Updated  | Added/Updated/Sync| Updated, latest payload        |
//! | Sync     | Sync              | Sync, latest payload           |
//! | Sync     | Added/Updated     | Updated, latest payload        |
//! | Updated/Sync | Deleted       | Deleted                        |
//! | Deleted  | anything          | not queued until the delete pops |
//!
//! A re-creation (Added/Sync) arriving behind a pending delete is parked and enqueued once the
//! delete has been popped; Updated/Deleted arriving behind it are dropped.
//!
//! The queue also remembers what it has handed to the consumer (the store contents once every
//! popped delta is applied). `replace` diffs a listing against that record under its own lock, so
//! an item popped but not yet applied still gets its Deleted when the listing drops it.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use kache_core::{Delta, DeltaKind, ObjectKey, Resource};
use metrics::{counter, gauge};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::{watch, Notify};
use tracing::{debug, trace};

struct Entry {
    delta: Delta,
    /// Counts toward the initial population.
    initial: bool,
}

#[derive(Default)]
struct State {
    entries: FxHashMap<ObjectKey, Entry>,
    order: VecDeque<ObjectKey>,
    /// Re-creations waiting behind a pending delete.
    parked: FxHashMap<ObjectKey, Delta>,
    /// Latest non-deleted object handed out per key.
    handed: FxHashMap<ObjectKey, Arc<Resource>>,
    closed: bool,
    populated: bool,
    initial_remaining: usize,
}

enum Merge {
    Enqueued,
    Merged,
    Removed { initial: bool },
    Parked,
    Dropped,
}

impl State {
    fn merge(&mut self, delta: Delta) -> Merge {
        let key = delta.object.key.clone();
        let Some(entry) = self.entries.get_mut(&key) else {
            self.order.push_back(key.clone());
            self.entries.insert(key, Entry { delta, initial: false });
            return Merge::Enqueued;
        };
        use DeltaKind::*;
        match (entry.delta.kind, delta.kind) {
            (Deleted, Deleted) => {
                self.parked.remove(&key);
                Merge::Dropped
            }
            (Deleted, Added | Sync) => {
                self.parked.insert(key, delta);
                Merge::Parked
            }
            (Deleted, Updated) => match self.parked.get_mut(&key) {
                Some(parked) => {
                    parked.object = delta.object;
                    Merge::Parked
                }
                None => Merge::Dropped,
            },
            (Added, Deleted) => {
                let initial = entry.initial;
                self.entries.remove(&key);
                self.order.retain(|k| k != &key);
                Merge::Removed { initial }
            }
            (_, Deleted) => {
                entry.delta = delta;
                Merge::Merged
            }
            (Added, _) | (Updated, _) | (Sync, Sync) => {
                entry.delta.object = delta.object;
                Merge::Merged
            }
            (Sync, Added | Updated) => {
                entry.delta = Delta::new(Updated, delta.object);
                Merge::Merged
            }
        }
    }

    fn take_front(&mut self) -> Option<Popped> {
        while let Some(key) = self.order.pop_front() {
            if let Some(entry) = self.entries.remove(&key) {
                let object = Arc::new(entry.delta.object.clone());
                if entry.delta.kind == DeltaKind::Deleted {
                    self.handed.remove(&key);
                    if let Some(parked) = self.parked.remove(&key) {
                        self.order.push_back(key.clone());
                        self.entries.insert(key.clone(), Entry { delta: parked, initial: false });
                    }
                } else {
                    self.handed.insert(key.clone(), Arc::clone(&object));
                }
                return Some(Popped { key, delta: entry.delta, object, initial: entry.initial });
            }
        }
        None
    }

    fn synced(&self) -> bool { self.populated && self.initial_remaining == 0 }
}

/// One dequeued key with its net delta.
#[derive(Debug, Clone)]
pub struct Popped {
    pub key: ObjectKey,
    pub delta: Delta,
    object: Arc<Resource>,
    initial: bool,
}

impl Popped {
    /// Whether this item belongs to the first listing.
    pub fn is_initial(&self) -> bool { self.initial }

    /// The delta's object, shared with the queue's record of handed-out state.
    pub fn object(&self) -> Arc<Resource> { Arc::clone(&self.object) }
}

pub struct DeltaQueue {
    state: Mutex<State>,
    notify: Notify,
    synced_tx: watch::Sender<bool>,
}

impl DeltaQueue {
    pub fn new() -> Self {
        let (synced_tx, _) = watch::channel(false);
        Self { state: Mutex::new(State::default()), notify: Notify::new(), synced_tx }
    }

    fn lock(&self) -> MutexGuard<'_, State> { self.state.lock().unwrap_or_else(PoisonError::into_inner) }

    pub fn len(&self) -> usize { self.lock().entries.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn is_closed(&self) -> bool { self.lock().closed }

    /// True once every delta of the first `replace` has been popped and completed.
    pub fn has_synced(&self) -> bool { *self.synced_tx.borrow() }

    pub fn subscribe_synced(&self) -> watch::Receiver<bool> { self.synced_tx.subscribe() }

    /// Queue one change, folding it into any pending delta for the same key.
    pub fn push(&self, delta: Delta) {
        let mut st = self.lock();
        if st.closed {
            return;
        }
        let key = delta.object.key.clone();
        let kind = delta.kind;
        let outcome = st.merge(delta);
        self.after_merge(&mut st, outcome, &key, kind);
        let depth = st.entries.len();
        drop(st);
        gauge!("kache_queue_depth", depth as f64);
        self.notify.notify_one();
    }

    fn after_merge(&self, st: &mut State, outcome: Merge, key: &ObjectKey, kind: DeltaKind) {
        match outcome {
            Merge::Enqueued => trace!(%key, ?kind, "delta enqueued"),
            Merge::Merged => counter!("kache_queue_compressed_total", 1),
            Merge::Parked => debug!(%key, ?kind, "re-creation parked behind pending delete"),
            Merge::Dropped => {
                counter!("kache_queue_dropped_total", 1);
                debug!(%key, ?kind, "event dropped behind pending delete");
            }
            Merge::Removed { initial } => {
                counter!("kache_queue_compressed_total", 1);
                debug!(%key, "added then deleted before delivery; entry removed");
                if initial {
                    self.release_initial(st);
                }
            }
        }
    }

    fn release_initial(&self, st: &mut State) {
        st.initial_remaining = st.initial_remaining.saturating_sub(1);
        if st.synced() {
            self.synced_tx.send_replace(true);
        }
    }

    /// Fold a full listing into the queue: a Sync per listed object, a Deleted for every pending,
    /// handed-out or `known` key the listing no longer contains.
    pub fn replace(&self, items: Vec<Resource>, known: impl IntoIterator<Item = Arc<Resource>>) {
        let mut st = self.lock();
        if st.closed {
            return;
        }
        let listed: FxHashSet<ObjectKey> = items.iter().map(|r| r.key.clone()).collect();
        let listed_count = listed.len();
        for item in items {
            let key = item.key.clone();
            let outcome = st.merge(Delta::new(DeltaKind::Sync, item));
            self.after_merge(&mut st, outcome, &key, DeltaKind::Sync);
        }

        let vanished_pending: Vec<Resource> = st
            .entries
            .iter()
            .filter(|(k, _)| !listed.contains(*k))
            .map(|(_, e)| e.delta.object.clone())
            .collect();
        let mut deleted = 0usize;
        for obj in vanished_pending {
            let key = obj.key.clone();
            let outcome = st.merge(Delta::new(DeltaKind::Deleted, obj));
            self.after_merge(&mut st, outcome, &key, DeltaKind::Deleted);
            deleted += 1;
        }
        let handed: Vec<Arc<Resource>> = st.handed.values().cloned().collect();
        for obj in handed.into_iter().chain(known) {
            if listed.contains(&obj.key) || st.entries.contains_key(&obj.key) {
                continue;
            }
            let key = obj.key.clone();
            let outcome = st.merge(Delta::new(DeltaKind::Deleted, Resource::clone(&obj)));
            self.after_merge(&mut st, outcome, &key, DeltaKind::Deleted);
            deleted += 1;
        }

        if !st.populated {
            st.populated = true;
            let mut n = 0usize;
            for entry in st.entries.values_mut() {
                entry.initial = true;
                n += 1;
            }
            st.initial_remaining = n;
            debug!(initial = n, "queue populated by first listing");
            if st.synced() {
                self.synced_tx.send_replace(true);
            }
        }
        let depth = st.entries.len();
        drop(st);
        debug!(listed = listed_count, deleted, depth, "queue replace");
        gauge!("kache_queue_depth", depth as f64);
        self.notify.notify_one();
    }

    /// Wait for the oldest pending key. Returns `None` once the queue is closed.
    pub async fn pop(&self) -> Option<Popped> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut st = self.lock();
                if st.closed {
                    return None;
                }
                if let Some(p) = st.take_front() {
                    let depth = st.entries.len();
                    drop(st);
                    gauge!("kache_queue_depth", depth as f64);
                    return Some(p);
                }
            }
            notified.await;
        }
    }

    /// Mark a popped item as fully processed.
    pub fn complete(&self, popped: &Popped) {
        if popped.initial {
            let mut st = self.lock();
            self.release_initial(&mut st);
        }
    }

    /// Wake every waiter; later pops return `None` and pushes are ignored.
    pub fn close(&self) {
        let mut st = self.lock();
        if st.closed {
            return;
        }
        st.closed = true;
        drop(st);
        debug!("delta queue closed");
        self.notify.notify_waiters();
    }
}

impl Default for DeltaQueue {
    fn default() -> Self { Self::new() }
}
