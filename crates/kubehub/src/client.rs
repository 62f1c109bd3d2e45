//! The resource-store capability the engine is written against.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use konform_core::{DynamicObject, Gvk, ResourceId, StoreError};

/// One event on a watch connection.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    Added(DynamicObject),
    Modified(DynamicObject),
    /// Carries the last state of the object before it was removed.
    Deleted(DynamicObject),
    /// Progress marker carrying only a resource version.
    Bookmark(String),
    /// In-band error; `StoreError::Expired` means the cursor must be reset.
    Error(StoreError),
}

impl WatchEvent {
    /// Resource version this event moves the cursor to, if any.
    pub fn resource_version(&self) -> Option<&str> {
        match self {
            Self::Added(o) | Self::Modified(o) | Self::Deleted(o) => o.metadata.resource_version.as_deref(),
            Self::Bookmark(rv) => Some(rv.as_str()),
            Self::Error(_) => None,
        }
    }
}

pub type WatchStream = BoxStream<'static, Result<WatchEvent, StoreError>>;

/// What the store knows about a kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KindInfo {
    pub namespaced: bool,
}

#[async_trait]
pub trait StoreClient: Send + Sync {
    /// Confirm the store serves `gvk`; `StoreError::UnknownKind` otherwise.
    async fn resolve(&self, gvk: &Gvk) -> Result<KindInfo, StoreError>;

    async fn get(&self, id: &ResourceId) -> Result<Option<DynamicObject>, StoreError>;

    async fn list(&self, gvk: &Gvk, namespace: Option<&str>) -> Result<Vec<DynamicObject>, StoreError>;

    /// Open a watch. An empty `cursor` starts with synthetic `Added` events for
    /// every existing object. The stream ends once `timeout` elapses.
    async fn watch(
        &self,
        gvk: &Gvk,
        namespace: Option<&str>,
        cursor: &str,
        timeout: Duration,
    ) -> Result<WatchStream, StoreError>;

    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject, StoreError>;

    /// Full replace. A resource version on `obj` is a precondition.
    async fn update(&self, obj: &DynamicObject) -> Result<DynamicObject, StoreError>;

    /// Server-side apply under `field_manager`. A resource version on `obj`
    /// is a precondition.
    async fn apply(&self, obj: &DynamicObject, field_manager: &str) -> Result<DynamicObject, StoreError>;

    async fn delete(&self, id: &ResourceId, uid: Option<&str>) -> Result<(), StoreError>;
}
