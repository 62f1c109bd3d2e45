use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use konform_apply::{management_conflict, Applier, ApplierConfig, BulkApplier};
use konform_core::metadata::SOURCE_COMMIT_ANNOTATION;
use konform_core::{DynamicObject, Gvk, MultiError, ObjectExt, ObjectKey, ReconcileError, ResourceId, Scope};
use konform_diff::{drift, operation, Diff, DiffSummary, Operation};
use konform_kubehub::StoreClient;
use konform_store::{DeclaredResourceCache, ObjectQueue};
use konform_watch::{Backoff, WatchManager};
use metrics::{counter, gauge};
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::EngineError;

/// The operation a pass would perform on one identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanEntry {
    pub id: ResourceId,
    pub op: Operation,
    /// Field-level changes, for updates only.
    pub drift: Option<DiffSummary>,
}

/// One reconciler: declared cache, watches, work queue and appliers for a scope.
pub struct Engine {
    config: EngineConfig,
    store: Arc<dyn StoreClient>,
    cache: Arc<DeclaredResourceCache>,
    queue: ObjectQueue,
    watches: WatchManager,
    applier: Arc<Applier>,
    bulk: BulkApplier,
    /// Declared kinds the last pass could not resolve.
    pending: Mutex<BTreeSet<Gvk>>,
    /// Serializes full passes.
    passes: tokio::sync::Mutex<()>,
    recovery: Notify,
    cancel: CancellationToken,
}

impl Engine {
    pub fn new(store: Arc<dyn StoreClient>, config: EngineConfig) -> Self {
        let cache = Arc::new(DeclaredResourceCache::new());
        let queue = ObjectQueue::new();
        let watches = WatchManager::new(
            config.scope.clone(),
            Arc::clone(&store),
            Arc::clone(&cache),
            queue.clone(),
            config.watch.clone(),
        );
        let applier = Arc::new(Applier::new(
            Arc::clone(&store),
            config.scope.clone(),
            ApplierConfig {
                field_manager: config.field_manager.clone(),
                max_conflict_retries: config.max_conflict_retries,
            },
        ));
        let bulk = BulkApplier::new(Arc::clone(&applier));
        Self {
            config,
            store,
            cache,
            queue,
            watches,
            applier,
            bulk,
            pending: Mutex::new(BTreeSet::new()),
            passes: tokio::sync::Mutex::new(()),
            recovery: Notify::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn scope(&self) -> &Scope {
        &self.config.scope
    }

    pub fn cache(&self) -> &Arc<DeclaredResourceCache> {
        &self.cache
    }

    pub fn queue(&self) -> &ObjectQueue {
        &self.queue
    }

    pub fn watches(&self) -> &WatchManager {
        &self.watches
    }

    /// Declared kinds the store did not serve during the last pass.
    pub fn pending_kinds(&self) -> BTreeSet<Gvk> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Whether a pass must be retried: a declared kind was not served, or a
    /// watcher failed to start or died.
    pub fn needs_recovery(&self) -> bool {
        !self.pending_kinds().is_empty() || self.watches.needs_update()
    }

    /// Bring one identity in line with its declaration.
    ///
    /// `actual` is the latest observation, `None` once the object is gone.
    /// The declaration is read from the cache at call time.
    pub async fn remediate(&self, key: &ObjectKey, actual: Option<&DynamicObject>) -> Result<Operation, ReconcileError> {
        let declared = self.cache.get(key);
        let declared = declared.as_deref();
        if declared.is_none() && actual.is_none() {
            debug!(key = %key, "nothing declared or observed");
            return Ok(Operation::NoOp);
        }
        let scope = self.scope();
        let op = Diff::new(declared, actual).operation(scope);
        counter!("remediate_total", 1u64, "op" => op.as_str());
        match (op, declared, actual) {
            (Operation::NoOp, _, _) => {}
            (Operation::Create, Some(d), _) => {
                self.applier.create(d).await?;
            }
            (Operation::Update, Some(d), Some(a)) => {
                self.applier.update(d, a).await?;
            }
            (Operation::Delete, _, Some(a)) => self.applier.delete(a).await?,
            (Operation::Unmanage | Operation::UnmanageProtected, _, Some(a)) => self.applier.unmanage(a).await?,
            (Operation::Error, Some(d), _) => {
                return Err(ReconcileError::InvalidManagement {
                    id: d.resource_id()?,
                    value: d.management().to_string(),
                });
            }
            (Operation::ManagementConflict, _, Some(a)) => {
                return Err(management_conflict(&a.resource_id()?, a, scope));
            }
            (op, d, a) => {
                return Err(ReconcileError::Internal(format!(
                    "{key}: {op} with declared={} actual={}",
                    d.is_some(),
                    a.is_some()
                )));
            }
        }
        if op != Operation::NoOp {
            info!(key = %key, op = %op, "remediated");
        }
        Ok(op)
    }

    /// Full apply-and-prune pass over `declared`.
    pub async fn apply(&self, declared: &[DynamicObject]) -> (BTreeSet<Gvk>, Result<(), MultiError>) {
        self.bulk.apply(declared).await
    }

    pub async fn update_watches(&self, kinds: &BTreeSet<Gvk>) -> (BTreeSet<Gvk>, Result<(), MultiError>) {
        self.watches.update(kinds).await
    }

    /// Publish a new declared state, apply it and watch the accepted kinds.
    ///
    /// A non-empty `commit` is stamped on every declaration. A declaration
    /// that cannot be normalized rejects the whole set and nothing is applied.
    pub async fn sync(&self, resources: Vec<DynamicObject>, commit: &str) -> Result<(), EngineError> {
        let t0 = Instant::now();
        info!(resources = resources.len(), commit, "api: sync start");
        let resources = resources.into_iter().map(|mut obj| {
            if !commit.is_empty() {
                obj.metadata
                    .annotations
                    .get_or_insert_with(Default::default)
                    .insert(SOURCE_COMMIT_ANNOTATION.to_string(), commit.to_string());
            }
            obj
        });
        self.cache.update(resources, commit)?;
        let res = self.resync().await;
        info!(took_ms = %t0.elapsed().as_millis(), ok = res.is_ok(), "api: sync done");
        res
    }

    /// Re-apply the current declared state and refresh the watch set.
    ///
    /// Declared kinds the store does not serve yet are recorded, and the
    /// workers' recovery task retries the pass with backoff until they are.
    pub async fn resync(&self) -> Result<(), EngineError> {
        let _pass = self.passes.lock().await;
        let declared: Vec<DynamicObject> = self.cache.all().iter().map(|o| DynamicObject::clone(o)).collect();
        let (kinds, applied) = self.apply(&declared).await;
        let mut errors = MultiError::new();
        if let Err(e) = applied {
            errors.extend(e);
        }
        let missing: BTreeSet<Gvk> =
            declared.iter().filter_map(|o| o.gvk().ok()).filter(|gvk| !kinds.contains(gvk)).collect();
        if !missing.is_empty() {
            warn!(kinds = ?missing, "declared kinds not served; will retry");
        }
        gauge!("pending_kinds", missing.len() as f64);
        *self.pending.lock().unwrap_or_else(PoisonError::into_inner) = missing;

        let (watched, res) = self.update_watches(&kinds).await;
        debug!(watched = watched.len(), "watch set refreshed");
        if let Err(e) = res {
            errors.extend(e);
        }
        if self.needs_recovery() {
            self.recovery.notify_one();
        }
        errors.into_result().map_err(EngineError::from)
    }

    /// Retry passes while `needs_recovery` holds, with capped exponential
    /// backoff; otherwise wait for the next pass that leaves work behind.
    async fn recover(self: Arc<Self>) {
        let mut backoff = Backoff::new(self.config.retry_base, self.config.retry_max);
        loop {
            if !self.needs_recovery() {
                backoff.reset();
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = self.recovery.notified() => continue,
                }
            }
            let delay = backoff.next_delay();
            debug!(delay_ms = delay.as_millis() as u64, "recovery pass scheduled");
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
            match self.resync().await {
                Ok(()) => info!("recovery pass converged"),
                Err(e) => warn!(error = %e, pending = ?self.pending_kinds(), "recovery pass incomplete"),
            }
        }
        debug!("recovery stopped");
    }

    /// What a pass would do right now, without writing anything.
    ///
    /// Covers every declaration plus inventory entries that are no longer
    /// declared. Identities whose live state cannot be read are reported as
    /// errors and left out of the plan.
    pub async fn plan(&self) -> (Vec<PlanEntry>, Result<(), MultiError>) {
        let mut entries = Vec::new();
        let mut errors = MultiError::new();
        let mut declared_keys = HashSet::new();
        for d in self.cache.all() {
            let id = match d.resource_id() {
                Ok(id) => id,
                Err(e) => {
                    errors.push(e.into());
                    continue;
                }
            };
            declared_keys.insert(id.key());
            match self.store.get(&id).await {
                Ok(live) => {
                    let op = operation(Some(d.as_ref()), live.as_ref(), self.scope());
                    let drift = match (&live, op) {
                        (Some(live), Operation::Update) => Some(drift(&d, live)),
                        _ => None,
                    };
                    entries.push(PlanEntry { id, op, drift });
                }
                Err(e) => errors.push(ReconcileError::store(&id, e)),
            }
        }
        match self.bulk.inventory().load().await {
            Ok(inventory) => {
                for id in inventory.into_iter().filter(|id| !declared_keys.contains(&id.key())) {
                    match self.store.get(&id).await {
                        Ok(Some(live)) => {
                            let op = operation(None, Some(&live), self.scope());
                            entries.push(PlanEntry { id, op, drift: None });
                        }
                        Ok(None) => {}
                        Err(e) => errors.push(ReconcileError::store(&id, e)),
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "inventory unavailable; stale entries not planned");
                errors.push(e);
            }
        }
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        (entries, errors.into_result())
    }

    /// Spawn `n` workers draining the queue, plus the task retrying passes
    /// that left kinds unresolved. All of them exit after `shutdown`.
    pub fn run_workers(self: &Arc<Self>, n: usize) -> Vec<JoinHandle<()>> {
        let mut tasks: Vec<_> = (0..n.max(1)).map(|i| tokio::spawn(crate::worker::run(Arc::clone(self), i))).collect();
        tasks.push(tokio::spawn(Arc::clone(self).recover()));
        tasks
    }

    /// Stop every watcher and release the workers.
    pub async fn shutdown(&self) {
        info!("api: shutdown");
        self.cancel.cancel();
        self.watches.stop_all().await;
        self.queue.shut_down();
    }
}
