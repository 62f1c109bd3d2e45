//! Single-object writes: create, update, delete and unmanage.

use std::sync::Arc;

use konform_core::metadata::{
    self, MANAGED_BY_LABEL, MANAGED_BY_VALUE, MANAGER_ANNOTATION, OWNING_INVENTORY_ANNOTATION,
};
use konform_core::{can_manage, DynamicObject, ObjectExt, ReconcileError, ResourceId, Scope, StoreError};
use konform_kubehub::StoreClient;
use metrics::counter;
use tracing::{debug, info};

use crate::inventory::inventory_id;

pub const DEFAULT_FIELD_MANAGER: &str = "konform";
pub const DEFAULT_MAX_CONFLICT_RETRIES: u32 = 5;

#[derive(Debug, Clone)]
pub struct ApplierConfig {
    pub field_manager: String,
    /// Refetch-and-retry rounds after a resource-version conflict.
    pub max_conflict_retries: u32,
}

impl Default for ApplierConfig {
    fn default() -> Self {
        Self {
            field_manager: DEFAULT_FIELD_MANAGER.to_string(),
            max_conflict_retries: DEFAULT_MAX_CONFLICT_RETRIES,
        }
    }
}

pub struct Applier {
    store: Arc<dyn StoreClient>,
    scope: Scope,
    inventory_id: String,
    config: ApplierConfig,
}

/// Outcome of one attempt inside a conflict-retry loop.
enum Attempt<T> {
    Done(T),
    Refetch,
}

impl Applier {
    pub fn new(store: Arc<dyn StoreClient>, scope: Scope, config: ApplierConfig) -> Self {
        let inventory_id = inventory_id(&scope);
        Self { store, scope, inventory_id, config }
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn config(&self) -> &ApplierConfig {
        &self.config
    }

    pub(crate) fn store(&self) -> &Arc<dyn StoreClient> {
        &self.store
    }

    /// The declaration as it is sent to the store: server-populated metadata
    /// cleared, bookkeeping for this scope stamped on.
    pub fn prepare(&self, declared: &DynamicObject) -> DynamicObject {
        let mut obj = declared.clone();
        let meta = &mut obj.metadata;
        meta.resource_version = None;
        meta.uid = None;
        meta.generation = None;
        meta.creation_timestamp = None;
        meta.managed_fields = None;
        metadata::set_annotation(meta, MANAGER_ANNOTATION, self.scope.manager_value());
        metadata::set_annotation(meta, OWNING_INVENTORY_ANNOTATION, self.inventory_id.clone());
        metadata::set_label(meta, MANAGED_BY_LABEL, MANAGED_BY_VALUE);
        obj
    }

    pub async fn create(&self, declared: &DynamicObject) -> Result<DynamicObject, ReconcileError> {
        let id = declared.resource_id()?;
        let obj = self.prepare(declared);
        let created = self
            .store
            .apply(&obj, &self.config.field_manager)
            .await
            .map_err(|e| ReconcileError::store(&id, e))?;
        info!(id = %id, "created");
        Ok(created)
    }

    /// Apply `declared` over `live`, using the live resource version as a
    /// precondition and refetching on conflict.
    pub async fn update(&self, declared: &DynamicObject, live: &DynamicObject) -> Result<DynamicObject, ReconcileError> {
        let id = declared.resource_id()?;
        let mut rv = live.resource_version().map(str::to_string);
        for attempt in 0..=self.config.max_conflict_retries {
            let mut obj = self.prepare(declared);
            obj.metadata.resource_version = rv.clone();
            match self.store.apply(&obj, &self.config.field_manager).await {
                Ok(updated) => {
                    info!(id = %id, attempt, "updated");
                    return Ok(updated);
                }
                Err(StoreError::Conflict(msg)) => {
                    debug!(id = %id, attempt, %msg, "update conflicted; refetching");
                    counter!("apply_conflicts_total", 1u64);
                    match self.refetch(&id).await? {
                        Some(fresh) => rv = fresh.resource_version().map(str::to_string),
                        None => rv = None,
                    }
                }
                Err(e) => return Err(ReconcileError::store(&id, e)),
            }
        }
        Err(self.exhausted(id))
    }

    /// Delete `live`, guarded by its UID so a replacement is never removed.
    /// Already gone is success.
    pub async fn delete(&self, live: &DynamicObject) -> Result<(), ReconcileError> {
        let id = live.resource_id()?;
        match self.store.delete(&id, live.uid()).await {
            Ok(()) => {
                info!(id = %id, "deleted");
                Ok(())
            }
            Err(StoreError::NotFound(_)) => Ok(()),
            Err(StoreError::Conflict(msg)) => {
                info!(id = %id, %msg, "object replaced since it was observed; not deleting");
                Ok(())
            }
            Err(e) => Err(ReconcileError::store(&id, e)),
        }
    }

    /// Strip bookkeeping from `live` and leave it in place.
    pub async fn unmanage(&self, live: &DynamicObject) -> Result<(), ReconcileError> {
        let id = live.resource_id()?;
        let mut current = live.clone();
        for attempt in 0..=self.config.max_conflict_retries {
            match self.try_unmanage(&id, &current).await? {
                Attempt::Done(()) => {
                    debug!(id = %id, attempt, "unmanaged");
                    return Ok(());
                }
                Attempt::Refetch => match self.refetch(&id).await? {
                    Some(fresh) => current = fresh,
                    None => return Ok(()),
                },
            }
        }
        Err(self.exhausted(id))
    }

    async fn try_unmanage(&self, id: &ResourceId, current: &DynamicObject) -> Result<Attempt<()>, ReconcileError> {
        if !current.has_bookkeeping() {
            return Ok(Attempt::Done(()));
        }
        let mut next = current.clone();
        let removed = metadata::strip_bookkeeping(&mut next.metadata);
        match self.store.update(&next).await {
            Ok(_) => {
                info!(id = %id, removed = ?removed, "unmanaged");
                Ok(Attempt::Done(()))
            }
            Err(StoreError::NotFound(_)) => Ok(Attempt::Done(())),
            Err(StoreError::Conflict(_)) => {
                counter!("apply_conflicts_total", 1u64);
                Ok(Attempt::Refetch)
            }
            Err(e) => Err(ReconcileError::store(id, e)),
        }
    }

    /// Current live state; a scope change on the way is a management conflict.
    async fn refetch(&self, id: &ResourceId) -> Result<Option<DynamicObject>, ReconcileError> {
        let fresh = self.store.get(id).await.map_err(|e| ReconcileError::store(id, e))?;
        if let Some(obj) = &fresh {
            if !can_manage(&self.scope, obj) {
                return Err(management_conflict(id, obj, &self.scope));
            }
        }
        Ok(fresh)
    }

    fn exhausted(&self, id: ResourceId) -> ReconcileError {
        counter!("apply_conflict_retries_exhausted_total", 1u64);
        ReconcileError::ConflictRetriesExhausted { id, attempts: self.config.max_conflict_retries + 1 }
    }
}

pub fn management_conflict(id: &ResourceId, live: &DynamicObject, scope: &Scope) -> ReconcileError {
    ReconcileError::ManagementConflict {
        id: id.clone(),
        manager: live.manager().map(|m| m.to_string()).unwrap_or_default(),
        scope: scope.to_string(),
    }
}
