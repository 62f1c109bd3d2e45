//! One long-lived watch per kind, feeding the object queue.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use konform_core::{can_manage, ActualResource, DynamicObject, Gvk, ObjectExt, ReconcileError, Scope, StoreError};
use konform_kubehub::{StoreClient, WatchEvent, WatchStream};
use konform_store::{DeclaredResourceCache, ObjectQueue};
use metrics::counter;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::{watch_timeout, Backoff};

#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Server-side timeout for one connection is drawn from `[timeout_min, timeout_max)`.
    pub timeout_min: Duration,
    pub timeout_max: Duration,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            timeout_min: Duration::from_secs(240),
            timeout_max: Duration::from_secs(290),
            reconnect_base: Duration::from_millis(500),
            reconnect_max: Duration::from_secs(30),
        }
    }
}

#[derive(Default)]
struct State {
    cursor: String,
    stopped: bool,
}

pub struct FilteredWatcher {
    gvk: Gvk,
    scope: Scope,
    store: Arc<dyn StoreClient>,
    cache: Arc<DeclaredResourceCache>,
    queue: ObjectQueue,
    config: WatcherConfig,
    state: Mutex<State>,
    cancel: CancellationToken,
}

/// Why a connection ended.
enum Closed {
    /// Timeout, server-side close or a failed stream; resume from the cursor.
    Ended { delivered: bool, failed: bool },
    /// The cursor is gone; relist.
    Expired,
    Cancelled,
}

impl FilteredWatcher {
    pub fn new(
        gvk: Gvk,
        scope: Scope,
        store: Arc<dyn StoreClient>,
        cache: Arc<DeclaredResourceCache>,
        queue: ObjectQueue,
        config: WatcherConfig,
    ) -> Self {
        Self {
            gvk,
            scope,
            store,
            cache,
            queue,
            config,
            state: Mutex::new(State::default()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn gvk(&self) -> &Gvk {
        &self.gvk
    }

    /// Current resume cursor; empty before the first event.
    pub async fn cursor(&self) -> String {
        self.state.lock().await.cursor.clone()
    }

    /// Stop watching. Safe to call repeatedly and while a reconnect is in flight.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let mut st = self.state.lock().await;
        if !st.stopped {
            st.stopped = true;
            info!(gvk = %self.gvk, "watcher stopped");
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Whether an observed object belongs to this reconciler.
    pub fn should_process(&self, obj: &DynamicObject) -> bool {
        if !can_manage(&self.scope, obj) {
            return false;
        }
        let Ok(key) = obj.key() else { return false };
        match self.cache.get(&key) {
            Some(declared) => match (declared.gvk(), obj.gvk()) {
                (Ok(d), Ok(o)) => d.version == o.version,
                _ => false,
            },
            None => obj.management().is_enabled(),
        }
    }

    /// Watch until stopped. Returns an error only when the kind disappears
    /// from the store; every other failure is retried.
    ///
    /// The reconnect backoff is reset only by a connection that delivered an
    /// object or bookmark. A connection that failed, or closed early without
    /// delivering anything, waits out the next delay before reconnecting.
    pub async fn run(&self) -> Result<(), ReconcileError> {
        let mut backoff = Backoff::new(self.config.reconnect_base, self.config.reconnect_max);
        loop {
            let timeout = watch_timeout(self.config.timeout_min, self.config.timeout_max);
            let opened = Instant::now();
            let stream = match self.connect(timeout).await {
                Ok(Some(s)) => s,
                Ok(None) => return Ok(()),
                Err(StoreError::UnknownKind(_)) => {
                    warn!(gvk = %self.gvk, "kind no longer served; watcher exiting");
                    return Err(ReconcileError::UnknownKind { gvk: self.gvk.clone() });
                }
                Err(StoreError::Expired(msg)) => {
                    info!(gvk = %self.gvk, %msg, "watch cursor expired; relisting");
                    self.state.lock().await.cursor.clear();
                    continue;
                }
                Err(e) => {
                    warn!(gvk = %self.gvk, error = %e, "watch connect failed");
                    counter!("watch_connect_errors_total", 1u64);
                    if !self.pause(&mut backoff).await {
                        return Ok(());
                    }
                    continue;
                }
            };
            match self.consume(stream).await {
                Closed::Cancelled => return Ok(()),
                Closed::Expired => self.state.lock().await.cursor.clear(),
                Closed::Ended { delivered, failed } => {
                    if delivered {
                        backoff.reset();
                    }
                    let early = !delivered && opened.elapsed() < timeout;
                    if failed || early {
                        if !self.pause(&mut backoff).await {
                            return Ok(());
                        }
                    } else {
                        debug!(gvk = %self.gvk, "watch closed; reconnecting");
                    }
                }
            }
        }
    }

    /// Sleep for the next backoff delay. `false` if cancelled meanwhile.
    async fn pause(&self, backoff: &mut Backoff) -> bool {
        let delay = backoff.next_delay();
        debug!(gvk = %self.gvk, delay_ms = delay.as_millis() as u64, "watch reconnect delayed");
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    /// Open a connection from the current cursor. `None` once stopped.
    async fn connect(&self, timeout: Duration) -> Result<Option<WatchStream>, StoreError> {
        let st = self.state.lock().await;
        if st.stopped || self.cancel.is_cancelled() {
            return Ok(None);
        }
        debug!(gvk = %self.gvk, cursor = %st.cursor, timeout_secs = timeout.as_secs(), "connecting watch");
        tokio::select! {
            _ = self.cancel.cancelled() => Ok(None),
            r = self.store.watch(&self.gvk, self.scope.namespace(), &st.cursor, timeout) => r.map(Some),
        }
    }

    async fn consume(&self, mut stream: WatchStream) -> Closed {
        let mut delivered = false;
        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => return Closed::Cancelled,
                n = stream.next() => n,
            };
            let ev = match next {
                None => return Closed::Ended { delivered, failed: false },
                Some(Err(StoreError::Expired(_))) => return Closed::Expired,
                Some(Err(e)) => {
                    warn!(gvk = %self.gvk, error = %e, "watch stream failed");
                    return Closed::Ended { delivered, failed: true };
                }
                Some(Ok(ev)) => ev,
            };
            if !matches!(ev, WatchEvent::Error(_)) {
                delivered = true;
            }
            if let Some(rv) = ev.resource_version() {
                self.state.lock().await.cursor = rv.to_string();
            }
            match ev {
                WatchEvent::Added(o) | WatchEvent::Modified(o) => self.forward(ActualResource::live(o), "upsert"),
                WatchEvent::Deleted(o) => self.forward(ActualResource::tombstone(o), "delete"),
                WatchEvent::Bookmark(_) => counter!("watch_events_total", 1u64, "event" => "bookmark"),
                WatchEvent::Error(StoreError::Expired(msg)) => {
                    info!(gvk = %self.gvk, %msg, "watch cursor expired; relisting");
                    return Closed::Expired;
                }
                WatchEvent::Error(e) => {
                    warn!(gvk = %self.gvk, error = %e, "watch error event");
                    return Closed::Ended { delivered, failed: true };
                }
            }
        }
    }

    fn forward(&self, obs: ActualResource, event: &'static str) {
        counter!("watch_events_total", 1u64, "event" => event);
        if !self.should_process(&obs.object) {
            return;
        }
        debug!(gvk = %self.gvk, name = ?obs.object.metadata.name, deleted = obs.deleted, "enqueue");
        self.queue.add(obs);
    }
}
