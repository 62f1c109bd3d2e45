//! JSON comparison between a declaration and the live object.

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary {
    pub adds: usize,
    pub updates: usize,
}

impl DiffSummary {
    pub fn is_empty(&self) -> bool {
        self.adds == 0 && self.updates == 0
    }
}

impl std::fmt::Display for DiffSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "+{} ~{}", self.adds, self.updates)
    }
}

/// Drop server-populated fields that never appear in a declaration.
pub fn strip_noisy(mut v: Json) -> Json {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
            obj.remove("resourceVersion");
            obj.remove("generation");
            obj.remove("creationTimestamp");
            obj.remove("uid");
            obj.remove("selfLink");
        }
    }
    // Status is server-populated; ignore it during diffs
    if let Some(obj) = v.as_object_mut() {
        obj.remove("status");
    }
    v
}

/// True when every field set in `declared` has the same value in `live`.
///
/// Objects are compared key by key so fields the server defaults do not count
/// as drift; arrays must match element for element.
pub fn is_subset(declared: &Json, live: &Json) -> bool {
    match (declared, live) {
        (Json::Object(d), Json::Object(l)) => {
            d.iter().all(|(k, dv)| match l.get(k) {
                Some(lv) => is_subset(dv, lv),
                None => dv.is_null(),
            })
        }
        (Json::Array(d), Json::Array(l)) => {
            d.len() == l.len() && d.iter().zip(l.iter()).all(|(dv, lv)| is_subset(dv, lv))
        }
        (d, l) => d == l,
    }
}

/// Declared fields the live object lacks (`adds`) or holds with another
/// value (`updates`). A differing array counts once.
pub fn drift_summary(declared: &Json, live: &Json) -> DiffSummary {
    fn walk(d: &Json, l: &Json, out: &mut DiffSummary) {
        match (d, l) {
            (Json::Object(d), Json::Object(l)) => {
                for (k, dv) in d {
                    match l.get(k) {
                        Some(lv) => walk(dv, lv, out),
                        None if dv.is_null() => {}
                        None => out.adds += 1,
                    }
                }
            }
            (d, l) if is_subset(d, l) => {}
            _ => out.updates += 1,
        }
    }
    let mut out = DiffSummary::default();
    walk(declared, live, &mut out);
    out
}
