//! Resource identities.
//!
//! `ResourceId` is the fully qualified identity of one object. `ObjectKey`
//! drops the version and is what the cache and the queue are keyed by, so a
//! declared `apps/v1` object and a live object observed through another
//! version of the same kind still pair up.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Group/Version/Kind of a declared or watched type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Gvk {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl Gvk {
    pub fn new(group: impl Into<String>, version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self { group: group.into(), version: version.into(), kind: kind.into() }
    }

    /// Build from an `apiVersion` (`v1` or `group/v1`) and a kind.
    pub fn from_api_version(api_version: &str, kind: &str) -> Result<Self, CoreError> {
        let (group, version) = split_api_version(api_version)?;
        if kind.is_empty() {
            return Err(CoreError::Normalize(format!("empty kind for apiVersion {}", api_version)));
        }
        Ok(Self { group: group.to_string(), version: version.to_string(), kind: kind.to_string() })
    }

    /// Parse a key of the form `v1/Kind` or `group/v1/Kind`.
    pub fn parse_key(key: &str) -> Result<Self, CoreError> {
        let parts: Vec<_> = key.split('/').collect();
        match parts.as_slice() {
            [version, kind] if !version.is_empty() && !kind.is_empty() => Ok(Self::new("", *version, *kind)),
            [group, version, kind] if !version.is_empty() && !kind.is_empty() => Ok(Self::new(*group, *version, *kind)),
            _ => Err(CoreError::Normalize(format!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key))),
        }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    /// True for the kinds that must exist before anything else is applied.
    pub fn is_prerequisite(&self) -> bool {
        (self.group.is_empty() && self.kind == "Namespace")
            || (self.group == "apiextensions.k8s.io" && self.kind == "CustomResourceDefinition")
    }
}

impl fmt::Display for Gvk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}/{}", self.version, self.kind)
        } else {
            write!(f, "{}/{}/{}", self.group, self.version, self.kind)
        }
    }
}

/// Fully qualified identity of a resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceId {
    pub group: String,
    pub version: String,
    pub kind: String,
    /// Empty for cluster-scoped resources.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    pub name: String,
}

impl ResourceId {
    pub fn new(gvk: &Gvk, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            group: gvk.group.clone(),
            version: gvk.version.clone(),
            kind: gvk.kind.clone(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn gvk(&self) -> Gvk {
        Gvk::new(self.group.clone(), self.version.clone(), self.kind.clone())
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey {
            group: self.group.clone(),
            kind: self.kind.clone(),
            namespace: self.namespace.clone(),
            name: self.name.clone(),
        }
    }

    pub fn namespace(&self) -> Option<&str> {
        if self.namespace.is_empty() { None } else { Some(self.namespace.as_str()) }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ", self.gvk())?;
        if self.namespace.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

/// Version-less identity: group, kind, namespace and name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub group: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(
        group: impl Into<String>,
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self { group: group.into(), kind: kind.into(), namespace: namespace.into(), name: name.into() }
    }

    pub fn with_version(&self, version: impl Into<String>) -> ResourceId {
        ResourceId {
            group: self.group.clone(),
            version: version.into(),
            kind: self.kind.clone(),
            namespace: self.namespace.clone(),
            name: self.name.clone(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}", self.kind)?;
        } else {
            write!(f, "{}.{}", self.kind, self.group)?;
        }
        if self.namespace.is_empty() {
            write!(f, " {}", self.name)
        } else {
            write!(f, " {}/{}", self.namespace, self.name)
        }
    }
}

fn split_api_version(api_version: &str) -> Result<(&str, &str), CoreError> {
    let parts: Vec<_> = api_version.split('/').collect();
    match parts.as_slice() {
        [version] if !version.is_empty() => Ok(("", version)),
        [group, version] if !group.is_empty() && !version.is_empty() => Ok((group, version)),
        _ => Err(CoreError::Normalize(format!("invalid apiVersion: {:?}", api_version))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gvk_from_api_version() {
        let core = Gvk::from_api_version("v1", "ConfigMap").unwrap();
        assert_eq!(core.group, "");
        assert_eq!(core.to_string(), "v1/ConfigMap");
        let apps = Gvk::from_api_version("apps/v1", "Deployment").unwrap();
        assert_eq!(apps.api_version(), "apps/v1");
        assert_eq!(apps.to_string(), "apps/v1/Deployment");
        assert!(Gvk::from_api_version("a/b/c", "X").is_err());
        assert!(Gvk::from_api_version("", "X").is_err());
        assert!(Gvk::from_api_version("v1", "").is_err());
    }

    #[test]
    fn gvk_key_roundtrips_through_display() {
        for key in ["v1/Namespace", "rbac.authorization.k8s.io/v1/Role"] {
            assert_eq!(Gvk::parse_key(key).unwrap().to_string(), key);
        }
        assert!(Gvk::parse_key("Namespace").is_err());
    }

    #[test]
    fn key_drops_version_only() {
        let gvk = Gvk::new("apps", "v1", "Deployment");
        let id = ResourceId::new(&gvk, "ns1", "web");
        let key = id.key();
        assert_eq!(key, ObjectKey::new("apps", "Deployment", "ns1", "web"));
        assert_eq!(key.with_version("v1"), id);
        assert_eq!(id.to_string(), "apps/v1/Deployment ns1/web");
    }
}
