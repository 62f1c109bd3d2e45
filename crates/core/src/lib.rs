//! konform core types: identities, scopes, management metadata and errors.

#![forbid(unsafe_code)]

pub mod error;
pub mod identity;
pub mod metadata;
pub mod object;
pub mod scope;

pub use error::{CoreError, ErrorClass, MultiError, ReconcileError, StoreError};
pub use identity::{Gvk, ObjectKey, ResourceId};
pub use metadata::ManagementFlag;
pub use object::{ActualResource, ObjectExt};
pub use scope::{can_manage, Scope};

/// Untyped object payload shared by every collaborator.
pub use kube::core::DynamicObject;

pub mod prelude {
    pub use super::{
        can_manage, ActualResource, DynamicObject, Gvk, ManagementFlag, MultiError, ObjectExt, ObjectKey,
        ReconcileError, ResourceId, Scope, StoreError,
    };
}
