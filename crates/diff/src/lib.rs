//! konform differ: decides what to do with one declared/actual pair.
//!
//! `operation` is pure and deterministic. The only side effect is an error
//! log when both sides are absent, which callers should never produce.

#![forbid(unsafe_code)]

use std::fmt;

use konform_core::metadata::{self, ManagementFlag};
use konform_core::{can_manage, DynamicObject, ObjectExt, Scope};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::error;

pub mod drift;

pub use drift::{drift_summary, is_subset, strip_noisy, DiffSummary};

/// Outcome of one reconciliation attempt for one identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    NoOp,
    Create,
    Update,
    Delete,
    /// Strip bookkeeping, leave the object in place.
    Unmanage,
    /// Unmanage an object on the protected allow-list instead of deleting it.
    UnmanageProtected,
    /// Invalid management directive on the declaration.
    Error,
    /// The object belongs to a scope that outranks this one.
    ManagementConflict,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoOp => "noop",
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Unmanage => "unmanage",
            Self::UnmanageProtected => "unmanage-protected",
            Self::Error => "error",
            Self::ManagementConflict => "management-conflict",
        }
    }

    pub fn is_destructive(&self) -> bool {
        matches!(self, Self::Delete)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A declared/actual pair for one identity.
#[derive(Debug, Clone, Copy)]
pub struct Diff<'a> {
    pub declared: Option<&'a DynamicObject>,
    pub actual: Option<&'a DynamicObject>,
}

impl<'a> Diff<'a> {
    pub fn new(declared: Option<&'a DynamicObject>, actual: Option<&'a DynamicObject>) -> Self {
        Self { declared, actual }
    }

    pub fn operation(&self, scope: &Scope) -> Operation {
        operation(self.declared, self.actual, scope)
    }
}

pub fn operation(declared: Option<&DynamicObject>, actual: Option<&DynamicObject>, scope: &Scope) -> Operation {
    match (declared, actual) {
        (Some(d), None) => create_type(d),
        (Some(d), Some(a)) => update_type(d, a, scope),
        (None, Some(a)) => delete_type(a, scope),
        (None, None) => {
            error!(scope = %scope, "internal error: diff called with neither declared nor actual object");
            Operation::NoOp
        }
    }
}

fn create_type(declared: &DynamicObject) -> Operation {
    match declared.management() {
        ManagementFlag::Enabled => Operation::Create,
        ManagementFlag::Disabled => Operation::NoOp,
        ManagementFlag::Unset | ManagementFlag::Invalid(_) => Operation::Error,
    }
}

fn update_type(declared: &DynamicObject, actual: &DynamicObject, scope: &Scope) -> Operation {
    match (declared.gvk(), actual.gvk()) {
        (Ok(d), Ok(a)) if d.version != a.version => return Operation::NoOp,
        (Ok(_), Ok(_)) => {}
        _ => return Operation::Error,
    }
    match declared.management() {
        ManagementFlag::Enabled => {
            if !can_manage(scope, actual) {
                Operation::ManagementConflict
            } else {
                let ignored = (
                    metadata::ignores_mutation(&declared.metadata),
                    metadata::ignores_mutation(&actual.metadata),
                );
                match ignored {
                    (true, true) => Operation::NoOp,
                    // The directive itself has to reach the live object, or leave it.
                    (true, false) | (false, true) => Operation::Update,
                    (false, false) if has_drift(declared, actual, scope) => Operation::Update,
                    (false, false) => Operation::NoOp,
                }
            }
        }
        ManagementFlag::Disabled => {
            if can_manage(scope, actual) && actual.has_bookkeeping() {
                Operation::Unmanage
            } else {
                Operation::NoOp
            }
        }
        ManagementFlag::Unset | ManagementFlag::Invalid(_) => Operation::Error,
    }
}

fn delete_type(actual: &DynamicObject, scope: &Scope) -> Operation {
    if !actual.has_bookkeeping() {
        return Operation::NoOp;
    }
    // Generated children go away with their owner.
    if !actual.owner_references().is_empty() {
        return Operation::NoOp;
    }
    if !can_manage(scope, actual) {
        return Operation::NoOp;
    }
    if !actual.management().is_enabled() {
        return Operation::Unmanage;
    }
    // Another scope applied it; it is not ours to remove.
    if actual.manager().map(|m| &m != scope).unwrap_or(false) {
        return Operation::NoOp;
    }
    if metadata::prevents_deletion(&actual.metadata) {
        return Operation::Unmanage;
    }
    match actual.resource_id() {
        Ok(id) if metadata::is_protected(&id) => Operation::UnmanageProtected,
        Ok(_) => Operation::Delete,
        Err(_) => Operation::Error,
    }
}

/// Whether the live object must be patched to match the declaration.
///
/// The live object drifts when it records a different manager than `scope`
/// or when any declared field is missing or different on it.
pub fn has_drift(declared: &DynamicObject, actual: &DynamicObject, scope: &Scope) -> bool {
    if actual.manager().as_ref() != Some(scope) {
        return true;
    }
    let (d, a) = comparable(declared, actual);
    !is_subset(&d, &a)
}

/// Field-level drift of `actual` against `declared`.
pub fn drift(declared: &DynamicObject, actual: &DynamicObject) -> DiffSummary {
    let (d, a) = comparable(declared, actual);
    drift_summary(&d, &a)
}

fn comparable(declared: &DynamicObject, actual: &DynamicObject) -> (Json, Json) {
    (
        strip_noisy(serde_json::to_value(declared).unwrap_or(Json::Null)),
        strip_noisy(serde_json::to_value(actual).unwrap_or(Json::Null)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use konform_core::metadata::{
        DELETION_DETACH, DELETION_DIRECTIVE, DISABLED, ENABLED, MANAGED_ANNOTATION, MANAGER_ANNOTATION,
        MUTATION_DIRECTIVE, MUTATION_IGNORE,
    };
    use kube::core::{ApiResource, GroupVersionKind};

    fn cm(annotations: &[(&str, &str)]) -> DynamicObject {
        let ar = ApiResource::from_gvk(&GroupVersionKind::gvk("", "v1", "ConfigMap"));
        let mut o = DynamicObject::new("cm", &ar).within("ns1");
        if !annotations.is_empty() {
            o.metadata.annotations =
                Some(annotations.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect());
        }
        o.data = serde_json::json!({"data": {"k": "v"}});
        o
    }

    #[test]
    fn declared_only() {
        assert_eq!(operation(Some(&cm(&[(MANAGED_ANNOTATION, ENABLED)])), None, &Scope::Root), Operation::Create);
        assert_eq!(operation(Some(&cm(&[(MANAGED_ANNOTATION, DISABLED)])), None, &Scope::Root), Operation::NoOp);
        assert_eq!(operation(Some(&cm(&[(MANAGED_ANNOTATION, "")])), None, &Scope::Root), Operation::Error);
        assert_eq!(operation(Some(&cm(&[])), None, &Scope::Root), Operation::Error);
    }

    #[test]
    fn in_sync_pair_is_noop_and_drift_is_update() {
        let declared = cm(&[(MANAGED_ANNOTATION, ENABLED)]);
        let mut live = cm(&[(MANAGED_ANNOTATION, ENABLED), (MANAGER_ANNOTATION, ":root")]);
        live.metadata.resource_version = Some("7".into());
        assert_eq!(operation(Some(&declared), Some(&live), &Scope::Root), Operation::NoOp);

        live.data = serde_json::json!({"data": {"k": "changed"}});
        assert_eq!(operation(Some(&declared), Some(&live), &Scope::Root), Operation::Update);
    }

    #[test]
    fn foreign_manager_is_drift() {
        let declared = cm(&[(MANAGED_ANNOTATION, ENABLED)]);
        let live = cm(&[(MANAGED_ANNOTATION, ENABLED), (MANAGER_ANNOTATION, "ns1")]);
        assert_eq!(operation(Some(&declared), Some(&live), &Scope::Root), Operation::Update);
    }

    #[test]
    fn ignore_mutation_needs_both_sides() {
        let both = [(MANAGED_ANNOTATION, ENABLED), (MUTATION_DIRECTIVE, MUTATION_IGNORE)];
        let declared = cm(&both);
        let mut live = cm(&both);
        live.data = serde_json::json!({"data": {"k": "changed"}});
        assert_eq!(operation(Some(&declared), Some(&live), &Scope::Root), Operation::NoOp);

        let live_plain = cm(&[(MANAGED_ANNOTATION, ENABLED), (MANAGER_ANNOTATION, ":root")]);
        assert_eq!(operation(Some(&declared), Some(&live_plain), &Scope::Root), Operation::Update);

        // Dropped from the declaration but still on the live object.
        let plain = cm(&[(MANAGED_ANNOTATION, ENABLED)]);
        let live_ignoring = cm(&[(MANAGED_ANNOTATION, ENABLED), (MANAGER_ANNOTATION, ":root"), (MUTATION_DIRECTIVE, MUTATION_IGNORE)]);
        assert_eq!(operation(Some(&plain), Some(&live_ignoring), &Scope::Root), Operation::Update);
    }

    #[test]
    fn disabled_declaration() {
        let declared = cm(&[(MANAGED_ANNOTATION, DISABLED)]);
        let tracked = cm(&[(MANAGED_ANNOTATION, ENABLED), (MANAGER_ANNOTATION, ":root")]);
        assert_eq!(operation(Some(&declared), Some(&tracked), &Scope::Root), Operation::Unmanage);
        let ns1 = Scope::Namespace("ns1".into());
        assert_eq!(operation(Some(&declared), Some(&tracked), &ns1), Operation::NoOp);
    }

    #[test]
    fn version_skew_waits() {
        let declared = cm(&[(MANAGED_ANNOTATION, ENABLED)]);
        let mut live = cm(&[]);
        live.types.as_mut().unwrap().api_version = "v2".into();
        assert_eq!(operation(Some(&declared), Some(&live), &Scope::Root), Operation::NoOp);
    }

    #[test]
    fn undeclared_live_objects() {
        let root = Scope::Root;
        assert_eq!(operation(None, Some(&cm(&[])), &root), Operation::NoOp);
        let owned = [(MANAGED_ANNOTATION, ENABLED), (MANAGER_ANNOTATION, ":root")];
        assert_eq!(operation(None, Some(&cm(&owned)), &root), Operation::Delete);
        assert_eq!(
            operation(None, Some(&cm(&[(MANAGED_ANNOTATION, "bogus"), (MANAGER_ANNOTATION, ":root")])), &root),
            Operation::Unmanage
        );
        assert_eq!(
            operation(None, Some(&cm(&[(MANAGED_ANNOTATION, DISABLED)])), &root),
            Operation::Unmanage
        );
        let detached = [(MANAGED_ANNOTATION, ENABLED), (MANAGER_ANNOTATION, ":root"), (DELETION_DIRECTIVE, DELETION_DETACH)];
        assert_eq!(operation(None, Some(&cm(&detached)), &root), Operation::Unmanage);
    }

    #[test]
    fn never_deletes_for_another_scope() {
        let ns1_owned = cm(&[(MANAGED_ANNOTATION, ENABLED), (MANAGER_ANNOTATION, "ns1")]);
        assert_eq!(operation(None, Some(&ns1_owned), &Scope::Root), Operation::NoOp);
        let root_owned = cm(&[(MANAGED_ANNOTATION, ENABLED), (MANAGER_ANNOTATION, ":root")]);
        assert_eq!(operation(None, Some(&root_owned), &Scope::Namespace("ns1".into())), Operation::NoOp);
    }

    #[test]
    fn protected_namespace_is_unmanaged() {
        let ar = ApiResource::from_gvk(&GroupVersionKind::gvk("", "v1", "Namespace"));
        let mut ns = DynamicObject::new("kube-system", &ar);
        ns.metadata.annotations = Some(
            [(MANAGED_ANNOTATION, ENABLED), (MANAGER_ANNOTATION, ":root")]
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        assert_eq!(operation(None, Some(&ns), &Scope::Root), Operation::UnmanageProtected);
    }

    #[test]
    fn nothing_on_either_side() {
        assert_eq!(operation(None, None, &Scope::Root), Operation::NoOp);
    }
}
