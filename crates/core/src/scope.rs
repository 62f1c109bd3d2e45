use std::fmt;

use serde::{Deserialize, Serialize};

use crate::object::ObjectExt;

/// Manager value recorded on objects owned by the root reconciler.
pub const ROOT_MANAGER: &str = ":root";

/// Authority boundary of one reconciler.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Scope {
    /// Unrestricted; dominates every namespace scope.
    Root,
    /// Restricted to a single namespace.
    Namespace(String),
}

impl Scope {
    pub fn parse(s: &str) -> Self {
        if s == ROOT_MANAGER { Self::Root } else { Self::Namespace(s.to_string()) }
    }

    pub fn is_root(&self) -> bool {
        matches!(self, Self::Root)
    }

    /// Namespace to restrict list/watch calls to.
    pub fn namespace(&self) -> Option<&str> {
        match self {
            Self::Root => None,
            Self::Namespace(ns) => Some(ns.as_str()),
        }
    }

    /// Value written into the manager annotation.
    pub fn manager_value(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Root => f.write_str(ROOT_MANAGER),
            Self::Namespace(ns) => f.write_str(ns),
        }
    }
}

/// Whether `scope` may act on `obj`.
///
/// Root may always act. A namespace scope may act unless the object is
/// actively managed (management enabled) by the root reconciler.
pub fn can_manage<O: ObjectExt + ?Sized>(scope: &Scope, obj: &O) -> bool {
    if scope.is_root() {
        return true;
    }
    let Some(manager) = obj.manager() else { return true };
    if !obj.management().is_enabled() {
        return true;
    }
    !manager.is_root()
}
