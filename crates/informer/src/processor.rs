//! Fan-out of notifications to independently running listeners.
//!
//! Every listener owns a queue and a worker task. The dispatcher only appends to queues, so a
//! slow or stuck listener never holds up the store or its siblings. Queues have a soft
//! capacity: past it they keep growing (and say so) instead of blocking the dispatcher.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use futures::FutureExt;
use kache_store::Store;
use metrics::counter;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::handler::{Notification, ResourceEventHandler};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "h{}", self.0) }
}

#[derive(Default)]
struct Buffer {
    items: VecDeque<Notification>,
    closed: bool,
    /// Closed without draining.
    discard: bool,
    over_capacity: bool,
}

struct ListenerQueue {
    id: HandlerId,
    buf: Mutex<Buffer>,
    notify: Notify,
    soft_cap: usize,
}

impl ListenerQueue {
    fn new(id: HandlerId, soft_cap: usize) -> Self {
        Self { id, buf: Mutex::new(Buffer::default()), notify: Notify::new(), soft_cap: soft_cap.max(1) }
    }

    fn lock(&self) -> MutexGuard<'_, Buffer> { self.buf.lock().unwrap_or_else(PoisonError::into_inner) }

    fn push(&self, n: Notification) {
        let mut buf = self.lock();
        if buf.closed {
            return;
        }
        buf.items.push_back(n);
        if buf.items.len() > self.soft_cap {
            counter!("kache_listener_overflow_total", 1);
            if !buf.over_capacity {
                buf.over_capacity = true;
                warn!(handler = %self.id, backlog = buf.items.len(), cap = self.soft_cap, "listener falling behind; buffer grows past capacity");
            }
        }
        drop(buf);
        self.notify.notify_one();
    }

    async fn next(&self) -> Option<Notification> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut buf = self.lock();
                if buf.discard {
                    return None;
                }
                if let Some(n) = buf.items.pop_front() {
                    if buf.over_capacity && buf.items.len() <= self.soft_cap / 2 {
                        buf.over_capacity = false;
                        debug!(handler = %self.id, "listener caught up");
                    }
                    return Some(n);
                }
                if buf.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    fn close(&self, discard: bool) {
        let mut buf = self.lock();
        buf.closed = true;
        if discard {
            buf.discard = true;
            buf.items.clear();
        }
        drop(buf);
        self.notify.notify_waiters();
    }

    fn backlog(&self) -> usize { self.lock().items.len() }
}

struct Listener {
    queue: Arc<ListenerQueue>,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct Listeners {
    map: BTreeMap<HandlerId, Listener>,
    closed: bool,
}

pub struct Processor {
    listeners: RwLock<Listeners>,
    next_id: AtomicU64,
    store: Store,
    buffer: usize,
    shutdown_lock: tokio::sync::Mutex<()>,
}

impl Processor {
    pub fn new(store: Store, buffer: usize) -> Self {
        Self {
            listeners: RwLock::new(Listeners::default()),
            next_id: AtomicU64::new(1),
            store,
            buffer,
            shutdown_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Listeners> { self.listeners.read().unwrap_or_else(PoisonError::into_inner) }
    fn write(&self) -> RwLockWriteGuard<'_, Listeners> { self.listeners.write().unwrap_or_else(PoisonError::into_inner) }

    /// Register a listener and spawn its worker. The listener first receives an `on_add` for
    /// every object already in the store. Must be called within a Tokio runtime.
    pub fn add_listener<H: ResourceEventHandler>(&self, handler: H) -> HandlerId {
        self.add_shared(Arc::new(handler))
    }

    pub fn add_shared(&self, handler: Arc<dyn ResourceEventHandler>) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        // Holding the write lock keeps the dispatch loop from mutating the store while the
        // catch-up snapshot is taken.
        let mut guard = self.write();
        if guard.closed {
            warn!(handler = %id, "processor shut down; listener not started");
            return id;
        }
        let queue = Arc::new(ListenerQueue::new(id, self.buffer));
        let existing = self.store.list();
        let catch_up = existing.len();
        for obj in existing {
            queue.push(Notification::Add(obj));
        }
        let task = tokio::spawn(run_listener(Arc::clone(&queue), handler));
        guard.map.insert(id, Listener { queue, task });
        info!(handler = %id, catch_up, "listener registered");
        id
    }

    /// Stop delivering to a listener. Pending notifications are discarded.
    pub fn remove_listener(&self, id: HandlerId) -> bool {
        let removed = self.write().map.remove(&id);
        match removed {
            Some(listener) => {
                listener.queue.close(true);
                info!(handler = %id, "listener removed");
                true
            }
            None => false,
        }
    }

    pub fn listener_count(&self) -> usize { self.read().map.len() }

    /// Undelivered notifications per listener.
    pub fn backlog(&self) -> Vec<(HandlerId, usize)> {
        self.read().map.iter().map(|(id, l)| (*id, l.queue.backlog())).collect()
    }

    /// Append one notification to every listener queue.
    pub fn distribute(&self, n: Notification) {
        let guard = self.read();
        Self::fan_out(&guard, n);
    }

    /// Run `apply` (a store mutation) and distribute what it yields, atomically with respect
    /// to listener registration.
    pub fn dispatch<F>(&self, apply: F)
    where
        F: FnOnce() -> Option<Notification>,
    {
        let guard = self.read();
        if let Some(n) = apply() {
            Self::fan_out(&guard, n);
        }
    }

    fn fan_out(listeners: &Listeners, n: Notification) {
        counter!("kache_notifications_total", 1, "type" => n.label());
        for listener in listeners.map.values() {
            listener.queue.push(n.clone());
        }
    }

    /// Close every listener, let each drain what it already has, and wait up to `drain_timeout`
    /// before aborting stragglers. Idempotent.
    pub async fn shutdown(&self, drain_timeout: Duration) {
        let _serial = self.shutdown_lock.lock().await;
        let listeners: Vec<(HandlerId, Listener)> = {
            let mut guard = self.write();
            guard.closed = true;
            std::mem::take(&mut guard.map).into_iter().collect()
        };
        if listeners.is_empty() {
            return;
        }
        for (_, l) in &listeners {
            l.queue.close(false);
        }
        let deadline = tokio::time::Instant::now() + drain_timeout;
        for (id, mut l) in listeners {
            if tokio::time::timeout_at(deadline, &mut l.task).await.is_err() {
                warn!(handler = %id, backlog = l.queue.backlog(), "listener did not drain in time; aborting");
                l.queue.close(true);
                l.task.abort();
                let _ = l.task.await;
            }
        }
        debug!("all listeners stopped");
    }
}

async fn run_listener(queue: Arc<ListenerQueue>, handler: Arc<dyn ResourceEventHandler>) {
    let id = queue.id;
    while let Some(n) = queue.next().await {
        let outcome = AssertUnwindSafe(n.deliver(handler.as_ref())).catch_unwind().await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                counter!("kache_listener_callback_failures_total", 1, "reason" => "error");
                warn!(handler = %id, key = %n.key(), kind = n.label(), error = %e, "listener callback failed");
            }
            Err(panic) => {
                counter!("kache_listener_callback_failures_total", 1, "reason" => "panic");
                error!(handler = %id, key = %n.key(), kind = n.label(), panic = %panic_message(panic.as_ref()), "listener callback panicked");
            }
        }
    }
    debug!(handler = %id, "listener worker exited");
}

fn panic_message(p: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = p.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = p.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
