//! The capability set every collaborator needs from an untyped object.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::core::DynamicObject;

use crate::error::CoreError;
use crate::identity::{Gvk, ObjectKey, ResourceId};
use crate::metadata::{self, ManagementFlag, MANAGER_ANNOTATION};
use crate::scope::Scope;

/// Read-only accessors over a `DynamicObject`.
pub trait ObjectExt {
    fn gvk(&self) -> Result<Gvk, CoreError>;
    fn resource_id(&self) -> Result<ResourceId, CoreError>;
    fn key(&self) -> Result<ObjectKey, CoreError>;
    fn annotations(&self) -> Option<&BTreeMap<String, String>>;
    fn annotation(&self, key: &str) -> Option<&str>;
    fn label(&self, key: &str) -> Option<&str>;
    fn owner_references(&self) -> &[OwnerReference];
    fn generation(&self) -> i64;
    fn resource_version(&self) -> Option<&str>;
    fn uid(&self) -> Option<&str>;
    fn management(&self) -> ManagementFlag;
    /// The scope recorded in the manager annotation, if any.
    fn manager(&self) -> Option<Scope>;
    fn has_bookkeeping(&self) -> bool;
}

impl ObjectExt for DynamicObject {
    fn gvk(&self) -> Result<Gvk, CoreError> {
        let types = self
            .types
            .as_ref()
            .ok_or_else(|| CoreError::Normalize("object missing apiVersion/kind".into()))?;
        Gvk::from_api_version(&types.api_version, &types.kind)
    }

    fn resource_id(&self) -> Result<ResourceId, CoreError> {
        let gvk = self.gvk()?;
        let name = self
            .metadata
            .name
            .as_deref()
            .filter(|n| !n.is_empty())
            .ok_or_else(|| CoreError::Normalize(format!("{} object missing metadata.name", gvk)))?;
        Ok(ResourceId::new(&gvk, self.metadata.namespace.clone().unwrap_or_default(), name))
    }

    fn key(&self) -> Result<ObjectKey, CoreError> {
        self.resource_id().map(|id| id.key())
    }

    fn annotations(&self) -> Option<&BTreeMap<String, String>> {
        self.metadata.annotations.as_ref()
    }

    fn annotation(&self, key: &str) -> Option<&str> {
        self.metadata.annotations.as_ref().and_then(|a| a.get(key)).map(String::as_str)
    }

    fn label(&self, key: &str) -> Option<&str> {
        self.metadata.labels.as_ref().and_then(|l| l.get(key)).map(String::as_str)
    }

    fn owner_references(&self) -> &[OwnerReference] {
        self.metadata.owner_references.as_deref().unwrap_or(&[])
    }

    fn generation(&self) -> i64 {
        self.metadata.generation.unwrap_or(0)
    }

    fn resource_version(&self) -> Option<&str> {
        self.metadata.resource_version.as_deref()
    }

    fn uid(&self) -> Option<&str> {
        self.metadata.uid.as_deref()
    }

    fn management(&self) -> ManagementFlag {
        ManagementFlag::from_annotations(self.metadata.annotations.as_ref())
    }

    fn manager(&self) -> Option<Scope> {
        self.annotation(MANAGER_ANNOTATION).map(Scope::parse)
    }

    fn has_bookkeeping(&self) -> bool {
        metadata::has_bookkeeping(&self.metadata)
    }
}

/// An observation of a live object.
///
/// `deleted` marks a tombstone: `object` is the last state seen before the
/// store removed it.
#[derive(Debug, Clone)]
pub struct ActualResource {
    pub object: DynamicObject,
    pub deleted: bool,
}

impl ActualResource {
    pub fn live(object: DynamicObject) -> Self {
        Self { object, deleted: false }
    }

    pub fn tombstone(object: DynamicObject) -> Self {
        Self { object, deleted: true }
    }

    pub fn key(&self) -> Result<ObjectKey, CoreError> {
        self.object.key()
    }

    pub fn generation(&self) -> i64 {
        self.object.generation()
    }

    /// The object as seen by the differ: `None` once deleted.
    pub fn current(&self) -> Option<&DynamicObject> {
        if self.deleted { None } else { Some(&self.object) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::{ApiResource, GroupVersionKind};

    fn obj() -> DynamicObject {
        let ar = ApiResource::from_gvk(&GroupVersionKind::gvk("apps", "v1", "Deployment"));
        let mut o = DynamicObject::new("web", &ar).within("ns1");
        o.metadata.generation = Some(3);
        o.metadata.annotations = Some(
            [(MANAGER_ANNOTATION.to_string(), "ns1".to_string())].into_iter().collect(),
        );
        o
    }

    #[test]
    fn identity_accessors() {
        let o = obj();
        let id = o.resource_id().unwrap();
        assert_eq!(id.to_string(), "apps/v1/Deployment ns1/web");
        assert_eq!(o.generation(), 3);
        assert_eq!(o.manager(), Some(Scope::Namespace("ns1".into())));
        assert_eq!(o.management(), ManagementFlag::Unset);
        assert!(o.has_bookkeeping());
    }

    #[test]
    fn missing_types_is_a_normalize_error() {
        let mut o = obj();
        o.types = None;
        assert!(matches!(o.resource_id(), Err(CoreError::Normalize(_))));
    }

    #[test]
    fn tombstone_hides_current() {
        let t = ActualResource::tombstone(obj());
        assert!(t.current().is_none());
        assert!(ActualResource::live(obj()).current().is_some());
    }
}
