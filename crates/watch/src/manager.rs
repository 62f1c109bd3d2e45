//! Keeps one FilteredWatcher running per declared kind.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use konform_core::{Gvk, MultiError, ReconcileError, Scope, StoreError};
use konform_kubehub::StoreClient;
use konform_store::{DeclaredResourceCache, ObjectQueue};
use metrics::gauge;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::filtered::{FilteredWatcher, WatcherConfig};

struct Running {
    watcher: Arc<FilteredWatcher>,
    task: JoinHandle<()>,
}

type Watchers = Arc<Mutex<HashMap<Gvk, Running>>>;

pub struct WatchManager {
    scope: Scope,
    store: Arc<dyn StoreClient>,
    cache: Arc<DeclaredResourceCache>,
    queue: ObjectQueue,
    config: WatcherConfig,
    watchers: Watchers,
    needs_update: Arc<AtomicBool>,
    /// Serializes `update` calls.
    updating: tokio::sync::Mutex<()>,
}

fn lock(w: &Watchers) -> MutexGuard<'_, HashMap<Gvk, Running>> {
    w.lock().unwrap_or_else(PoisonError::into_inner)
}

impl WatchManager {
    pub fn new(
        scope: Scope,
        store: Arc<dyn StoreClient>,
        cache: Arc<DeclaredResourceCache>,
        queue: ObjectQueue,
        config: WatcherConfig,
    ) -> Self {
        Self {
            scope,
            store,
            cache,
            queue,
            config,
            watchers: Arc::default(),
            needs_update: Arc::new(AtomicBool::new(false)),
            updating: tokio::sync::Mutex::new(()),
        }
    }

    /// Kinds with a running watcher.
    pub fn watched(&self) -> BTreeSet<Gvk> {
        lock(&self.watchers).keys().cloned().collect()
    }

    /// Set when a watcher failed to start or died; the next `update` retries.
    pub fn needs_update(&self) -> bool {
        self.needs_update.load(Ordering::SeqCst)
    }

    /// Converge the running watchers onto `kinds`.
    ///
    /// Returns the kinds watched afterwards plus every start failure. Kinds
    /// that failed are left unwatched and `needs_update` is raised.
    pub async fn update(&self, kinds: &BTreeSet<Gvk>) -> (BTreeSet<Gvk>, Result<(), MultiError>) {
        let _serial = self.updating.lock().await;
        let current = self.watched();
        let mut errs = MultiError::new();

        for gvk in current.difference(kinds) {
            let running = lock(&self.watchers).remove(gvk);
            if let Some(r) = running {
                r.watcher.stop().await;
                info!(gvk = %gvk, "stopped watching kind");
            }
        }

        for gvk in kinds.difference(&current) {
            match self.store.resolve(gvk).await {
                Ok(_) => self.start(gvk.clone()),
                Err(StoreError::UnknownKind(_)) => errs.push(ReconcileError::UnknownKind { gvk: gvk.clone() }),
                Err(source) => errs.push(ReconcileError::Kind { gvk: gvk.clone(), source }),
            }
        }

        self.needs_update.store(!errs.is_empty(), Ordering::SeqCst);
        let watched = self.watched();
        gauge!("watched_kinds", watched.len() as f64);
        (watched, errs.into_result())
    }

    fn start(&self, gvk: Gvk) {
        let watcher = Arc::new(FilteredWatcher::new(
            gvk.clone(),
            self.scope.clone(),
            Arc::clone(&self.store),
            Arc::clone(&self.cache),
            self.queue.clone(),
            self.config.clone(),
        ));
        // Held across spawn: a failing task removes its own entry.
        let mut map = lock(&self.watchers);
        let task = {
            let watcher = Arc::clone(&watcher);
            let watchers = Arc::clone(&self.watchers);
            let needs_update = Arc::clone(&self.needs_update);
            tokio::spawn(async move {
                if let Err(e) = watcher.run().await {
                    error!(gvk = %watcher.gvk(), error = %e, "watcher exited");
                    needs_update.store(true, Ordering::SeqCst);
                    let mut map = lock(&watchers);
                    if map.get(watcher.gvk()).is_some_and(|r| Arc::ptr_eq(&r.watcher, &watcher)) {
                        map.remove(watcher.gvk());
                    }
                }
            })
        };
        info!(gvk = %gvk, scope = %self.scope, "watching kind");
        map.insert(gvk, Running { watcher, task });
    }

    /// Stop every watcher and wait for their tasks to finish.
    pub async fn stop_all(&self) {
        let all: Vec<(Gvk, Running)> = lock(&self.watchers).drain().collect();
        for (_, r) in &all {
            r.watcher.stop().await;
        }
        for (gvk, r) in all {
            if let Err(e) = r.task.await {
                error!(gvk = %gvk, error = %e, "watcher task panicked");
            }
        }
    }
}
