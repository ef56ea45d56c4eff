//! Run loop tying reflector, queue, store and processor together.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use kache_core::{DeltaKind, InformerConfig, ObjectSource};
use kache_store::{DeltaQueue, Popped, Store, StoreWriter};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::handler::{Notification, ResourceEventHandler};
use crate::processor::{HandlerId, Processor};
use crate::reflector::Reflector;
use crate::InformerError;

pub struct Controller {
    source: Arc<dyn ObjectSource>,
    config: InformerConfig,
    queue: Arc<DeltaQueue>,
    writer: Mutex<Option<StoreWriter>>,
    store: Store,
    processor: Arc<Processor>,
    shutdown: CancellationToken,
    started: AtomicBool,
    stopped_tx: watch::Sender<bool>,
}

impl Controller {
    pub fn new<S: ObjectSource + 'static>(source: S, config: InformerConfig) -> Self {
        Self::with_shared_source(Arc::new(source), config)
    }

    pub fn with_shared_source(source: Arc<dyn ObjectSource>, config: InformerConfig) -> Self {
        let writer = StoreWriter::new();
        let store = writer.reader();
        let processor = Arc::new(Processor::new(store.clone(), config.listener_buffer));
        let (stopped_tx, _) = watch::channel(false);
        Self {
            source,
            config,
            queue: Arc::new(DeltaQueue::new()),
            writer: Mutex::new(Some(writer)),
            store,
            processor,
            shutdown: CancellationToken::new(),
            started: AtomicBool::new(false),
            stopped_tx,
        }
    }

    /// Read handle for the cached objects.
    pub fn store(&self) -> Store { self.store.clone() }

    pub fn config(&self) -> &InformerConfig { &self.config }

    pub fn add_listener<H: ResourceEventHandler>(&self, handler: H) -> HandlerId { self.processor.add_listener(handler) }

    pub fn add_shared_listener(&self, handler: Arc<dyn ResourceEventHandler>) -> HandlerId {
        self.processor.add_shared(handler)
    }

    pub fn remove_listener(&self, id: HandlerId) -> bool { self.processor.remove_listener(id) }

    pub fn listener_count(&self) -> usize { self.processor.listener_count() }

    /// True once the first listing has been fully dispatched.
    pub fn has_synced(&self) -> bool { self.queue.has_synced() }

    /// Block until synced (`true`), or until `cancel` fires or the informer stops first (`false`
    /// unless it had synced by then).
    pub async fn wait_for_cache_sync(&self, cancel: &CancellationToken) -> bool {
        let mut rx = self.queue.subscribe_synced();
        loop {
            if *rx.borrow_and_update() {
                return true;
            }
            tokio::select! {
                _ = cancel.cancelled() => return self.has_synced(),
                _ = self.shutdown.cancelled() => return self.has_synced(),
                changed = rx.changed() => {
                    if changed.is_err() {
                        return self.has_synced();
                    }
                }
            }
        }
    }

    /// Run until `cancel` fires, `stop` is called, or the source fails fatally. Tears everything
    /// down before returning.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), InformerError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(InformerError::AlreadyRunning);
        }
        let writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(writer) = writer else {
            return Err(InformerError::AlreadyRunning);
        };
        if self.shutdown.is_cancelled() {
            self.teardown().await;
            return Ok(());
        }

        let token = self.shutdown.clone();
        let reflector = Reflector::new(Arc::clone(&self.source), Arc::clone(&self.queue), self.store.clone(), &self.config);
        let mut reflector_task = tokio::spawn(reflector.run(token.child_token()));
        let dispatch_task = tokio::spawn(dispatch_loop(
            Arc::clone(&self.queue),
            writer,
            Arc::clone(&self.processor),
            self.config.skip_unchanged_sync,
        ));
        info!(listeners = self.listener_count(), "informer started");

        let (outcome, reflector_done) = tokio::select! {
            _ = cancel.cancelled() => {
                info!("informer cancelled by caller");
                (Ok(()), false)
            }
            _ = token.cancelled() => (Ok(()), false),
            joined = &mut reflector_task => {
                let outcome = match joined {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => {
                        error!(error = %e, "reflector stopped on a fatal error");
                        Err(InformerError::Fatal(e))
                    }
                    Err(e) => Err(InformerError::Internal(format!("reflector task: {}", e))),
                };
                (outcome, true)
            }
        };

        self.shutdown.cancel();
        if !reflector_done {
            if let Err(e) = reflector_task.await {
                warn!(error = %e, "reflector task ended abnormally");
            }
        }
        self.queue.close();
        if let Err(e) = dispatch_task.await {
            warn!(error = %e, "dispatch task ended abnormally");
        }
        self.teardown().await;
        outcome
    }

    async fn teardown(&self) {
        self.queue.close();
        self.processor.shutdown(self.config.drain_timeout).await;
        self.stopped_tx.send_replace(true);
        info!("informer stopped");
    }

    /// Stop the informer. When this returns the store is no longer mutated and no listener
    /// callback runs. Idempotent.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        if self.started.load(Ordering::Acquire) {
            let mut rx = self.stopped_tx.subscribe();
            let _ = rx.wait_for(|stopped| *stopped).await;
        } else {
            self.teardown().await;
        }
    }
}

async fn dispatch_loop(queue: Arc<DeltaQueue>, writer: StoreWriter, processor: Arc<Processor>, skip_unchanged_sync: bool) {
    let mut was_synced = queue.has_synced();
    while let Some(popped) = queue.pop().await {
        processor.dispatch(|| apply(&writer, &popped, skip_unchanged_sync));
        queue.complete(&popped);
        if !was_synced && queue.has_synced() {
            was_synced = true;
            info!(objects = writer.reader().len(), "cache synced");
        }
    }
    debug!("dispatch loop exited");
}

/// Apply one delta to the store, yielding the notification listeners should see.
fn apply(writer: &StoreWriter, popped: &Popped, skip_unchanged_sync: bool) -> Option<Notification> {
    match popped.delta.kind {
        // The delta carries the final state; the stored copy may be older.
        DeltaKind::Deleted => writer.delete(&popped.key).map(|_| Notification::Delete(popped.object())),
        kind => {
            let new = popped.object();
            match writer.update_shared(Arc::clone(&new)) {
                None => Some(Notification::Add(new)),
                Some(old) if kind == DeltaKind::Sync && skip_unchanged_sync && *old == *new => None,
                Some(old) => Some(Notification::Update { old, new }),
            }
        }
    }
}
