//! Declared resource cache: the latest parsed source, published as one
//! immutable snapshot.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use konform_core::{CoreError, DynamicObject, Gvk, ObjectExt, ObjectKey, ResourceId};
use metrics::gauge;
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

/// One published version of the declared state.
#[derive(Debug, Default)]
pub struct DeclaredSnapshot {
    pub epoch: u64,
    pub commit: String,
    objects: FxHashMap<ObjectKey, Arc<DynamicObject>>,
}

impl DeclaredSnapshot {
    pub fn get(&self, key: &ObjectKey) -> Option<&Arc<DynamicObject>> {
        self.objects.get(key)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ObjectKey, &Arc<DynamicObject>)> {
        self.objects.iter()
    }

    pub fn kind_set(&self) -> BTreeSet<Gvk> {
        self.objects.values().filter_map(|o| o.gvk().ok()).collect()
    }
}

/// Thread-safe holder of the declared state.
///
/// `update` builds a complete map off to the side and publishes it with one
/// atomic swap. Readers load the current `Arc` and never observe a partially
/// built map.
pub struct DeclaredResourceCache {
    snap: ArcSwap<DeclaredSnapshot>,
    epoch: AtomicU64,
}

impl Default for DeclaredResourceCache {
    fn default() -> Self {
        Self::new()
    }
}

impl DeclaredResourceCache {
    pub fn new() -> Self {
        Self { snap: ArcSwap::from_pointee(DeclaredSnapshot::default()), epoch: AtomicU64::new(0) }
    }

    /// Replace the declared state wholesale.
    ///
    /// Entries without `apiVersion`/`kind` or a name are skipped. An entry that
    /// cannot be normalized fails the whole update and leaves the previous
    /// snapshot published.
    pub fn update<I>(&self, resources: I, commit: &str) -> Result<(), CoreError>
    where
        I: IntoIterator<Item = DynamicObject>,
    {
        let mut objects: FxHashMap<ObjectKey, Arc<DynamicObject>> = FxHashMap::default();
        for obj in resources {
            let named = obj.metadata.name.as_deref().map(|n| !n.is_empty()).unwrap_or(false);
            if obj.types.is_none() || !named {
                warn!(name = ?obj.metadata.name, types = ?obj.types, "skipping declared entry without type or name");
                continue;
            }
            let id = obj.resource_id()?;
            if !(obj.data.is_object() || obj.data.is_null()) {
                return Err(CoreError::Normalize(format!("{}: payload is not an object", id)));
            }
            if let Some(prev) = objects.insert(id.key(), Arc::new(obj)) {
                warn!(id = %id, replaced = ?prev.gvk().ok(), "duplicate declaration; last one wins");
            }
        }
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let count = objects.len();
        self.snap.store(Arc::new(DeclaredSnapshot { epoch, commit: commit.to_string(), objects }));
        gauge!("declared_resources", count as f64);
        debug!(epoch, count, commit, "declared snapshot published");
        Ok(())
    }

    /// Current snapshot; consistent across multiple reads.
    pub fn snapshot(&self) -> Arc<DeclaredSnapshot> {
        self.snap.load_full()
    }

    pub fn get(&self, key: &ObjectKey) -> Option<Arc<DynamicObject>> {
        self.snap.load().get(key).cloned()
    }

    /// Lookup by full identity; the stored version may differ from `id.version`.
    pub fn get_id(&self, id: &ResourceId) -> Option<Arc<DynamicObject>> {
        self.get(&id.key())
    }

    pub fn all(&self) -> Vec<Arc<DynamicObject>> {
        self.snap.load().objects.values().cloned().collect()
    }

    pub fn kind_set(&self) -> BTreeSet<Gvk> {
        self.snap.load().kind_set()
    }

    pub fn commit(&self) -> String {
        self.snap.load().commit.clone()
    }
}
