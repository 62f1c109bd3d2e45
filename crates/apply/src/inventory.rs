//! The set of objects a scope has applied, persisted in the store so pruning
//! survives restarts.
//!
//! One ConfigMap per scope: `konform-inventory` in `konform-system` for the
//! root scope, or in the scope's own namespace. The `objects` key holds a
//! JSON array of resource ids.

use std::collections::BTreeSet;
use std::sync::Arc;

use konform_core::metadata::{self, INVENTORY_ID_LABEL, SYSTEM_NAMESPACE};
use konform_core::{DynamicObject, Gvk, ReconcileError, ResourceId, Scope};
use konform_kubehub::StoreClient;
use kube::core::{ApiResource, GroupVersionKind};
use tracing::debug;

pub const INVENTORY_NAME: &str = "konform-inventory";
pub const OBJECTS_KEY: &str = "objects";

/// Label-safe identifier for a scope's inventory.
pub fn inventory_id(scope: &Scope) -> String {
    match scope {
        Scope::Root => "root".to_string(),
        Scope::Namespace(ns) => format!("ns-{ns}"),
    }
}

fn configmap_gvk() -> Gvk {
    Gvk::new("", "v1", "ConfigMap")
}

pub struct Inventory {
    store: Arc<dyn StoreClient>,
    id: String,
    location: ResourceId,
}

impl Inventory {
    pub fn new(store: Arc<dyn StoreClient>, scope: &Scope) -> Self {
        let namespace = scope.namespace().unwrap_or(SYSTEM_NAMESPACE);
        Self {
            store,
            id: inventory_id(scope),
            location: ResourceId::new(&configmap_gvk(), namespace, INVENTORY_NAME),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Where the record lives.
    pub fn location(&self) -> &ResourceId {
        &self.location
    }

    /// The recorded set; a missing record is an empty inventory.
    pub async fn load(&self) -> Result<BTreeSet<ResourceId>, ReconcileError> {
        let Some(obj) = self
            .store
            .get(&self.location)
            .await
            .map_err(|e| ReconcileError::store(&self.location, e))?
        else {
            return Ok(BTreeSet::new());
        };
        let raw = obj.data.get("data").and_then(|d| d.get(OBJECTS_KEY)).and_then(|v| v.as_str());
        let Some(raw) = raw else { return Ok(BTreeSet::new()) };
        let ids: Vec<ResourceId> = serde_json::from_str(raw)
            .map_err(|e| ReconcileError::Internal(format!("{}: corrupt inventory: {e}", self.location)))?;
        debug!(inventory = %self.id, count = ids.len(), "inventory loaded");
        Ok(ids.into_iter().collect())
    }

    pub async fn store(&self, ids: &BTreeSet<ResourceId>, field_manager: &str) -> Result<(), ReconcileError> {
        let encoded = serde_json::to_string(&ids.iter().collect::<Vec<_>>())
            .map_err(|e| ReconcileError::Internal(format!("encoding inventory: {e}")))?;
        let gvk = configmap_gvk();
        let ar = ApiResource::from_gvk(&GroupVersionKind::gvk(&gvk.group, &gvk.version, &gvk.kind));
        let mut obj = DynamicObject::new(INVENTORY_NAME, &ar).within(&self.location.namespace);
        // No bookkeeping labels: the record itself is never a prune candidate.
        metadata::set_label(&mut obj.metadata, INVENTORY_ID_LABEL, self.id.clone());
        let mut data = serde_json::Map::new();
        data.insert(OBJECTS_KEY.to_string(), encoded.into());
        obj.data = serde_json::json!({ "data": data });
        self.store
            .apply(&obj, field_manager)
            .await
            .map_err(|e| ReconcileError::store(&self.location, e))?;
        debug!(inventory = %self.id, count = ids.len(), "inventory stored");
        Ok(())
    }
}
