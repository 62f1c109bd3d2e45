//! Bookkeeping metadata written onto managed objects, and the lifecycle
//! directives users put on declarations.

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use smallvec::SmallVec;

use crate::identity::ResourceId;

pub const MANAGED_ANNOTATION: &str = "konform.dev/managed";
pub const MANAGER_ANNOTATION: &str = "konform.dev/manager";
pub const OWNING_INVENTORY_ANNOTATION: &str = "konform.dev/owning-inventory";
pub const SOURCE_PATH_ANNOTATION: &str = "konform.dev/source-path";
pub const SOURCE_COMMIT_ANNOTATION: &str = "konform.dev/source-commit";

pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY_VALUE: &str = "konform";

pub const INVENTORY_ID_LABEL: &str = "konform.dev/inventory-id";

pub const DELETION_DIRECTIVE: &str = "client.lifecycle.config.k8s.io/deletion";
pub const DELETION_DETACH: &str = "detach";
pub const MUTATION_DIRECTIVE: &str = "client.lifecycle.config.k8s.io/mutation";
pub const MUTATION_IGNORE: &str = "ignore";

pub const ENABLED: &str = "enabled";
pub const DISABLED: &str = "disabled";

/// Namespace the root reconciler keeps its own state in.
pub const SYSTEM_NAMESPACE: &str = "konform-system";

/// Annotations removed when an object is unmanaged.
pub const BOOKKEEPING_ANNOTATIONS: [&str; 5] = [
    MANAGED_ANNOTATION,
    MANAGER_ANNOTATION,
    OWNING_INVENTORY_ANNOTATION,
    SOURCE_PATH_ANNOTATION,
    SOURCE_COMMIT_ANNOTATION,
];

/// Namespaces that are unmanaged instead of deleted when they leave the source.
pub const PROTECTED_NAMESPACES: [&str; 5] =
    ["default", "kube-system", "kube-public", "kube-node-lease", SYSTEM_NAMESPACE];

/// Value of the management annotation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagementFlag {
    Enabled,
    Disabled,
    Unset,
    /// Present but not a recognized value; the empty string lands here too.
    Invalid(String),
}

impl ManagementFlag {
    pub fn parse(value: Option<&str>) -> Self {
        match value {
            None => Self::Unset,
            Some(ENABLED) => Self::Enabled,
            Some(DISABLED) => Self::Disabled,
            Some(other) => Self::Invalid(other.to_string()),
        }
    }

    pub fn from_annotations(annotations: Option<&BTreeMap<String, String>>) -> Self {
        Self::parse(annotations.and_then(|a| a.get(MANAGED_ANNOTATION)).map(String::as_str))
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self, Self::Enabled)
    }
}

impl fmt::Display for ManagementFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Enabled => f.write_str(ENABLED),
            Self::Disabled => f.write_str(DISABLED),
            Self::Unset => f.write_str("unset"),
            Self::Invalid(v) => write!(f, "invalid({:?})", v),
        }
    }
}

pub fn has_bookkeeping(meta: &ObjectMeta) -> bool {
    let annotated = meta
        .annotations
        .as_ref()
        .map(|a| BOOKKEEPING_ANNOTATIONS.iter().any(|k| a.contains_key(*k)))
        .unwrap_or(false);
    let labelled = meta
        .labels
        .as_ref()
        .and_then(|l| l.get(MANAGED_BY_LABEL))
        .map(|v| v == MANAGED_BY_VALUE)
        .unwrap_or(false);
    annotated || labelled
}

/// Remove every bookkeeping annotation and label. Returns the removed keys.
pub fn strip_bookkeeping(meta: &mut ObjectMeta) -> SmallVec<[&'static str; 8]> {
    let mut removed = SmallVec::new();
    if let Some(annotations) = meta.annotations.as_mut() {
        for key in BOOKKEEPING_ANNOTATIONS {
            if annotations.remove(key).is_some() {
                removed.push(key);
            }
        }
        if annotations.is_empty() {
            meta.annotations = None;
        }
    }
    if let Some(labels) = meta.labels.as_mut() {
        if labels.get(MANAGED_BY_LABEL).map(|v| v == MANAGED_BY_VALUE).unwrap_or(false) {
            labels.remove(MANAGED_BY_LABEL);
            removed.push(MANAGED_BY_LABEL);
        }
        if labels.is_empty() {
            meta.labels = None;
        }
    }
    removed
}

pub fn set_annotation(meta: &mut ObjectMeta, key: &str, value: impl Into<String>) {
    meta.annotations.get_or_insert_with(BTreeMap::new).insert(key.to_string(), value.into());
}

pub fn set_label(meta: &mut ObjectMeta, key: &str, value: impl Into<String>) {
    meta.labels.get_or_insert_with(BTreeMap::new).insert(key.to_string(), value.into());
}

pub fn prevents_deletion(meta: &ObjectMeta) -> bool {
    annotation_is(meta, DELETION_DIRECTIVE, DELETION_DETACH)
}

pub fn ignores_mutation(meta: &ObjectMeta) -> bool {
    annotation_is(meta, MUTATION_DIRECTIVE, MUTATION_IGNORE)
}

/// Objects on the fixed allow-list are never deleted, only unmanaged.
pub fn is_protected(id: &ResourceId) -> bool {
    id.group.is_empty() && id.kind == "Namespace" && PROTECTED_NAMESPACES.contains(&id.name.as_str())
}

fn annotation_is(meta: &ObjectMeta, key: &str, value: &str) -> bool {
    meta.annotations.as_ref().and_then(|a| a.get(key)).map(|v| v == value).unwrap_or(false)
}
