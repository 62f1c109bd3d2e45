//! Full apply-and-prune passes over the whole declared set.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use konform_core::metadata::{self, ManagementFlag};
use konform_core::{
    can_manage, DynamicObject, Gvk, MultiError, ObjectExt, ObjectKey, ReconcileError, ResourceId, StoreError,
};
use konform_diff::{operation, Operation};
use metrics::{counter, histogram};
use tracing::{debug, info, warn};

use crate::applier::{management_conflict, Applier};
use crate::inventory::Inventory;

pub struct BulkApplier {
    applier: Arc<Applier>,
    inventory: Inventory,
}

/// Per-pass bookkeeping.
struct Pass {
    kinds: BTreeSet<Gvk>,
    errors: MultiError,
    /// Previous inventory by version-less identity.
    previous: HashMap<ObjectKey, ResourceId>,
    next: BTreeSet<ResourceId>,
}

impl Pass {
    /// Carry an entry over from the previous inventory, if it was there.
    fn keep_previous(&mut self, key: &ObjectKey) {
        if let Some(id) = self.previous.get(key) {
            self.next.insert(id.clone());
        }
    }

    fn fail(&mut self, key: &ObjectKey, err: ReconcileError) {
        if let ReconcileError::UnknownKind { gvk } = &err {
            self.kinds.remove(gvk);
        }
        warn!(error = %err, "apply failed");
        counter!("apply_err", 1u64);
        self.keep_previous(key);
        self.errors.push(err);
    }
}

impl BulkApplier {
    pub fn new(applier: Arc<Applier>) -> Self {
        let inventory = Inventory::new(Arc::clone(applier.store()), applier.scope());
        Self { applier, inventory }
    }

    pub fn inventory(&self) -> &Inventory {
        &self.inventory
    }

    /// Apply every enabled declaration, unmanage disabled ones and prune what
    /// left the declared set. Never stops at the first failure.
    ///
    /// Returns the declared kinds the store accepted and every per-object error.
    pub async fn apply(&self, declared: &[DynamicObject]) -> (BTreeSet<Gvk>, Result<(), MultiError>) {
        let t0 = Instant::now();
        let mut pass = Pass {
            kinds: BTreeSet::new(),
            errors: MultiError::new(),
            previous: HashMap::new(),
            next: BTreeSet::new(),
        };

        // Without the previous inventory pruning is unsafe; apply only.
        let prune = match self.inventory.load().await {
            Ok(ids) => {
                pass.previous = ids.into_iter().map(|id| (id.key(), id)).collect();
                true
            }
            Err(e) => {
                warn!(error = %e, "inventory unavailable; skipping prune");
                pass.errors.push(e);
                false
            }
        };

        let mut enabled = Vec::new();
        let mut declared_keys = HashSet::new();
        for obj in declared {
            let id = match obj.resource_id() {
                Ok(id) => id,
                Err(e) => {
                    pass.errors.push(e.into());
                    continue;
                }
            };
            pass.kinds.insert(id.gvk());
            declared_keys.insert(id.key());
            match obj.management() {
                ManagementFlag::Enabled => enabled.push((id, obj)),
                ManagementFlag::Disabled => self.release(&mut pass, &id).await,
                flag => {
                    pass.keep_previous(&id.key());
                    pass.errors.push(ReconcileError::InvalidManagement { id, value: flag.to_string() });
                }
            }
        }

        // Namespaces and CRDs first so dependents can land in the same pass.
        enabled.sort_by_key(|(id, _)| !id.gvk().is_prerequisite());
        for (id, obj) in enabled {
            self.apply_one(&mut pass, &id, obj).await;
        }

        if prune {
            let mut stale: Vec<ResourceId> =
                pass.previous.iter().filter(|(k, _)| !declared_keys.contains(*k)).map(|(_, id)| id.clone()).collect();
            stale.sort_by_key(|id| (id.gvk().is_prerequisite(), id.clone()));
            for id in stale {
                self.prune_one(&mut pass, &id).await;
            }
            if let Err(e) = self.inventory.store(&pass.next, &self.applier.config().field_manager).await {
                pass.errors.push(e);
            }
        }

        histogram!("bulk_apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        info!(
            declared = declared.len(),
            inventory = pass.next.len(),
            errors = pass.errors.len(),
            "apply pass finished"
        );
        (pass.kinds, pass.errors.into_result())
    }

    /// Management disabled in the source: strip our bookkeeping, keep the object.
    async fn release(&self, pass: &mut Pass, id: &ResourceId) {
        let live = match self.applier.store().get(id).await {
            Ok(live) => live,
            Err(e) => return pass.fail(&id.key(), ReconcileError::store(id, e)),
        };
        let Some(live) = live else { return };
        if !live.has_bookkeeping() || !can_manage(self.applier.scope(), &live) {
            return;
        }
        if let Err(e) = self.applier.unmanage(&live).await {
            pass.fail(&id.key(), e);
        }
    }

    async fn apply_one(&self, pass: &mut Pass, id: &ResourceId, declared: &DynamicObject) {
        let key = id.key();
        let live = match self.applier.store().get(id).await {
            Ok(live) => live,
            Err(e) => return pass.fail(&key, ReconcileError::store(id, e)),
        };
        let scope = self.applier.scope();
        let result = match &live {
            Some(live) if !can_manage(scope, live) => {
                counter!("apply_conflicts_total", 1u64);
                pass.errors.push(management_conflict(id, live, scope));
                return;
            }
            Some(live) if operation(Some(declared), Some(live), scope) == Operation::NoOp => {
                debug!(id = %id, "already converged");
                Ok(())
            }
            Some(live) => self.applier.update(declared, live).await.map(drop),
            None => self.applier.create(declared).await.map(drop),
        };
        match result {
            Ok(()) => {
                counter!("apply_ok", 1u64);
                pass.next.insert(id.clone());
            }
            Err(e) => pass.fail(&key, e),
        }
    }

    async fn prune_one(&self, pass: &mut Pass, id: &ResourceId) {
        let live = match self.applier.store().get(id).await {
            Ok(Some(live)) => live,
            Ok(None) | Err(StoreError::UnknownKind(_)) => {
                debug!(id = %id, "pruned object already gone");
                return;
            }
            Err(e) => return self.prune_failed(pass, id, ReconcileError::store(id, e)),
        };
        let scope = self.applier.scope();
        if live.manager().as_ref() != Some(scope) || !can_manage(scope, &live) {
            info!(id = %id, manager = ?live.manager(), "no longer ours; dropping from inventory");
            return;
        }
        if !live.owner_references().is_empty() {
            debug!(id = %id, "owned by another object; leaving deletion to its owner");
            return;
        }
        let result = if metadata::prevents_deletion(&live.metadata) || metadata::is_protected(id) {
            self.applier.unmanage(&live).await
        } else {
            self.applier.delete(&live).await
        };
        match result {
            Ok(()) => counter!("prune_ok", 1u64),
            Err(e) => self.prune_failed(pass, id, e),
        }
    }

    fn prune_failed(&self, pass: &mut Pass, id: &ResourceId, err: ReconcileError) {
        warn!(id = %id, error = %err, "prune failed");
        counter!("prune_err", 1u64);
        pass.next.insert(id.clone());
        pass.errors.push(err);
    }
}
