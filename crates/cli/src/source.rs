//! Directory source: every `*.yaml`/`*.yml` file under a root, multi-document.

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use konform_core::metadata::{ENABLED, MANAGED_ANNOTATION, SOURCE_PATH_ANNOTATION};
use konform_core::DynamicObject;
use serde::Deserialize;
use serde_json::Value as Json;
use tracing::{debug, info};
use walkdir::WalkDir;

fn is_manifest(path: &Path) -> bool {
    matches!(path.extension().and_then(|e| e.to_str()), Some("yaml" | "yml"))
}

fn is_hidden(name: &std::ffi::OsStr) -> bool {
    name.to_str().map(|n| n.starts_with('.')).unwrap_or(false)
}

/// Load every declaration under `root`, in file-name order.
pub fn load_dir(root: &Path) -> Result<Vec<DynamicObject>> {
    let mut out = Vec::new();
    let mut files = 0usize;
    let walker = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !is_hidden(e.file_name()));
    for entry in walker {
        let entry = entry.with_context(|| format!("walking {}", root.display()))?;
        if !entry.file_type().is_file() || !is_manifest(entry.path()) {
            continue;
        }
        let rel = entry.path().strip_prefix(root).unwrap_or(entry.path());
        let text = std::fs::read_to_string(entry.path())
            .with_context(|| format!("reading {}", entry.path().display()))?;
        let docs = parse_documents(&text, &rel.to_string_lossy())?;
        debug!(file = %rel.display(), objects = docs.len(), "source file parsed");
        out.extend(docs);
        files += 1;
    }
    metrics::gauge!("source_objects", out.len() as f64);
    info!(root = %root.display(), files, objects = out.len(), "source loaded");
    Ok(out)
}

/// Parse one file's documents. `List` documents are flattened into their items.
pub fn parse_documents(text: &str, source_path: &str) -> Result<Vec<DynamicObject>> {
    let mut out = Vec::new();
    for (i, doc) in serde_yaml::Deserializer::from_str(text).enumerate() {
        let val = serde_yaml::Value::deserialize(doc).with_context(|| format!("{source_path}: document {i}"))?;
        if val.is_null() {
            continue;
        }
        let json = serde_json::to_value(val).with_context(|| format!("{source_path}: document {i}: converting to JSON"))?;
        if json.get("kind").and_then(Json::as_str) == Some("List") {
            let items = json.get("items").and_then(Json::as_array).cloned().unwrap_or_default();
            for item in items {
                out.push(declaration(item, source_path, i)?);
            }
        } else {
            out.push(declaration(json, source_path, i)?);
        }
    }
    Ok(out)
}

fn declaration(json: Json, source_path: &str, doc: usize) -> Result<DynamicObject> {
    if json.get("apiVersion").and_then(Json::as_str).is_none() || json.get("kind").and_then(Json::as_str).is_none() {
        return Err(anyhow!("{source_path}: document {doc}: missing apiVersion or kind"));
    }
    let mut obj: DynamicObject =
        serde_json::from_value(json).with_context(|| format!("{source_path}: document {doc}: not an object"))?;
    let annotations = obj.metadata.annotations.get_or_insert_with(Default::default);
    annotations.insert(SOURCE_PATH_ANNOTATION.to_string(), source_path.to_string());
    annotations.entry(MANAGED_ANNOTATION.to_string()).or_insert_with(|| ENABLED.to_string());
    Ok(obj)
}
