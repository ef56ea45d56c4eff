//! List+watch loop mirroring an `ObjectSource` into the delta queue.
//!
//! `Idle → Listing → Watching → (failure) Backoff → Listing`. An expired cursor skips the
//! backoff and relists straight away. The backoff resets once a watch delivers an event, so a
//! source whose lists succeed while every watch fails still backs off exponentially.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kache_core::{Delta, DeltaKind, InformerConfig, ObjectKey, ObjectSource, ResourceVersion, SourceError, WatchEvent};
use kache_store::{DeltaQueue, Store};
use metrics::counter;
use rustc_hash::FxHashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::backoff::Backoff;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReflectorState {
    Idle,
    Listing,
    Watching,
    Backoff,
}

/// What to do after a source failure.
enum Recovery {
    /// Skip the item and keep consuming the stream.
    Continue,
    Goto(ReflectorState),
}

pub struct Reflector {
    source: Arc<dyn ObjectSource>,
    queue: Arc<DeltaQueue>,
    store: Store,
    backoff: Backoff,
    resync_period: Option<Duration>,
    cursor: Option<ResourceVersion>,
    /// Last version pushed per key since the latest listing.
    versions: FxHashMap<ObjectKey, ResourceVersion>,
    state: ReflectorState,
}

impl Reflector {
    pub fn new(source: Arc<dyn ObjectSource>, queue: Arc<DeltaQueue>, store: Store, config: &InformerConfig) -> Self {
        Self {
            source,
            queue,
            store,
            backoff: Backoff::new(config.backoff_initial, config.backoff_max),
            resync_period: config.resync_period,
            cursor: None,
            versions: FxHashMap::default(),
            state: ReflectorState::Idle,
        }
    }

    pub fn state(&self) -> ReflectorState { self.state }

    pub fn cursor(&self) -> Option<ResourceVersion> { self.cursor }

    /// Runs until cancelled (`Ok`) or until the source reports a configuration-class error.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), SourceError> {
        self.transition(ReflectorState::Listing);
        loop {
            let next = match self.state {
                ReflectorState::Idle | ReflectorState::Listing => self.list(&cancel).await?,
                ReflectorState::Watching => self.watch(&cancel).await?,
                ReflectorState::Backoff => self.wait_backoff(&cancel).await,
            };
            match next {
                Some(state) => self.transition(state),
                None => {
                    info!(cursor = ?self.cursor, "reflector stopped");
                    return Ok(());
                }
            }
        }
    }

    fn transition(&mut self, next: ReflectorState) {
        if self.state != next {
            debug!(from = ?self.state, to = ?next, "reflector state");
        }
        self.state = next;
    }

    async fn list(&mut self, cancel: &CancellationToken) -> Result<Option<ReflectorState>, SourceError> {
        let listed = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(None),
            res = self.source.list() => res,
        };
        match listed {
            Ok(page) => {
                counter!("kache_relists_total", 1);
                info!(count = page.items.len(), version = %page.version, "list complete");
                self.versions = page.items.iter().map(|r| (r.key.clone(), r.version)).collect();
                self.queue.replace(page.items, self.store.list());
                self.cursor = Some(page.version);
                Ok(Some(ReflectorState::Watching))
            }
            Err(e) if e.is_fatal() => {
                error!(error = %e, "list failed with a fatal error");
                Err(e)
            }
            Err(e) => {
                counter!("kache_list_failures_total", 1);
                warn!(error = %e, attempts = self.backoff.attempts(), "list failed");
                Ok(Some(ReflectorState::Backoff))
            }
        }
    }

    async fn watch(&mut self, cancel: &CancellationToken) -> Result<Option<ReflectorState>, SourceError> {
        let Some(from) = self.cursor else {
            return Ok(Some(ReflectorState::Listing));
        };
        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(None),
            res = self.source.watch(from) => res,
        };
        let mut stream = match opened {
            Ok(stream) => stream,
            Err(e) => {
                return match self.recover(e)? {
                    Recovery::Continue => Ok(Some(ReflectorState::Backoff)),
                    Recovery::Goto(state) => Ok(Some(state)),
                };
            }
        };
        counter!("kache_watch_starts_total", 1);
        info!(from = %from, "watch started");

        let resync_period = self.resync_period;
        let resync = async move {
            match resync_period {
                Some(period) => tokio::time::sleep(period).await,
                None => futures::future::pending::<()>().await,
            }
        };
        tokio::pin!(resync);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(None),
                _ = &mut resync => {
                    counter!("kache_resyncs_total", 1);
                    info!(cursor = ?self.cursor, "periodic resync; relisting");
                    return Ok(Some(ReflectorState::Listing));
                }
                item = stream.next() => match item {
                    None => {
                        counter!("kache_watch_restarts_total", 1);
                        warn!(cursor = ?self.cursor, "watch stream closed");
                        return Ok(Some(ReflectorState::Backoff));
                    }
                    Some(Ok(WatchEvent::Error(e))) | Some(Err(e)) => {
                        if let Recovery::Goto(state) = self.recover(e)? {
                            return Ok(Some(state));
                        }
                    }
                    Some(Ok(event)) => {
                        // Only a watch that delivers something counts as recovered.
                        self.backoff.reset();
                        self.handle_event(event);
                    }
                },
            }
        }
    }

    fn recover(&mut self, e: SourceError) -> Result<Recovery, SourceError> {
        match e {
            e if e.is_fatal() => {
                error!(error = %e, "watch failed with a fatal error");
                Err(e)
            }
            SourceError::Expired(msg) => {
                counter!("kache_expired_cursor_total", 1);
                info!(cursor = ?self.cursor, reason = %msg, "watch cursor expired; discarding it and relisting");
                self.cursor = None;
                Ok(Recovery::Goto(ReflectorState::Listing))
            }
            SourceError::Malformed(msg) => {
                counter!("kache_malformed_events_total", 1);
                warn!(reason = %msg, "skipping malformed watch event");
                Ok(Recovery::Continue)
            }
            e => {
                counter!("kache_watch_restarts_total", 1);
                warn!(error = %e, cursor = ?self.cursor, "watch failed");
                Ok(Recovery::Goto(ReflectorState::Backoff))
            }
        }
    }

    fn advance(&mut self, version: ResourceVersion) {
        if self.cursor.map_or(true, |c| version > c) {
            self.cursor = Some(version);
        }
    }

    fn handle_event(&mut self, event: WatchEvent) {
        counter!("kache_watch_events_total", 1, "type" => event.label());
        match event {
            WatchEvent::Bookmark(version) => {
                trace!(%version, "bookmark");
                self.advance(version);
            }
            WatchEvent::Added(obj) | WatchEvent::Modified(obj) => {
                self.advance(obj.version);
                let kind = match self.versions.get(&obj.key).copied() {
                    Some(seen) if obj.version <= seen => {
                        counter!("kache_stale_events_total", 1);
                        debug!(key = %obj.key, version = %obj.version, %seen, "stale or duplicate event skipped");
                        return;
                    }
                    Some(_) => DeltaKind::Updated,
                    None => DeltaKind::Added,
                };
                self.versions.insert(obj.key.clone(), obj.version);
                self.queue.push(Delta::new(kind, obj));
            }
            WatchEvent::Deleted(obj) => {
                self.advance(obj.version);
                match self.versions.get(&obj.key).copied() {
                    None => {
                        debug!(key = %obj.key, "delete for unknown key skipped");
                        return;
                    }
                    Some(seen) if obj.version < seen => {
                        counter!("kache_stale_events_total", 1);
                        debug!(key = %obj.key, version = %obj.version, %seen, "stale delete skipped");
                        return;
                    }
                    Some(_) => {}
                }
                self.versions.remove(&obj.key);
                self.queue.push(Delta::new(DeltaKind::Deleted, obj));
            }
            WatchEvent::Error(e) => debug!(error = %e, "error event reached handle_event"),
        }
    }

    async fn wait_backoff(&mut self, cancel: &CancellationToken) -> Option<ReflectorState> {
        let delay = self.backoff.next_delay();
        info!(delay_ms = delay.as_millis() as u64, attempt = self.backoff.attempts(), "backing off before relist");
        tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            _ = tokio::time::sleep(delay) => Some(ReflectorState::Listing),
        }
    }
}
