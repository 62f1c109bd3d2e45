//! In-process `StoreClient` for tests and dry runs.
//!
//! Objects live in a map keyed by their version-less identity and are served
//! in whatever version the caller asks for. Every write bumps a global
//! resource version and is appended to a change log; watches replay the log
//! from their cursor and then follow a broadcast channel. Generations only
//! move when the payload outside `metadata` and `status` changes.
//!
//! Server-side apply is emulated closely enough for reconciliation: applied
//! fields are merged into the live object and fields a manager applied
//! before but no longer applies are removed.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use konform_core::{DynamicObject, Gvk, ObjectExt, ObjectKey, ResourceId, StoreError};
use kube::core::TypeMeta;
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::debug;

use crate::client::{KindInfo, StoreClient, WatchEvent, WatchStream};

/// Store calls that can be made to fail on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Resolve,
    Get,
    List,
    Watch,
    Create,
    Update,
    Apply,
    Delete,
}

#[derive(Debug, Clone, Copy)]
enum ChangeKind {
    Added,
    Modified,
    Deleted,
}

#[derive(Debug, Clone)]
struct Change {
    rv: u64,
    kind: ChangeKind,
    object: DynamicObject,
}

#[derive(Debug, Clone)]
enum Signal {
    Change(Change),
    Bookmark(u64),
    Disconnect,
}

#[derive(Default)]
struct State {
    kinds: HashMap<Gvk, KindInfo>,
    objects: BTreeMap<ObjectKey, DynamicObject>,
    /// Last applied configuration per (object, field manager).
    applied: HashMap<(ObjectKey, String), Value>,
    log: Vec<Change>,
    rv: u64,
    compacted: u64,
    faults: HashMap<Op, VecDeque<StoreError>>,
    calls: HashMap<Op, usize>,
}

#[derive(Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
    tx: broadcast::Sender<Signal>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

struct Filter {
    gvk: Gvk,
    namespace: Option<String>,
}

impl Filter {
    fn matches(&self, obj: &DynamicObject) -> bool {
        let Ok(key) = obj.key() else { return false };
        key.group == self.gvk.group
            && key.kind == self.gvk.kind
            && self.namespace.as_deref().map_or(true, |ns| ns.is_empty() || ns == key.namespace)
    }
}

struct Feed {
    initial: VecDeque<WatchEvent>,
    rx: Option<broadcast::Receiver<Signal>>,
    deadline: Instant,
    after: u64,
    filter: Filter,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self { state: Arc::new(Mutex::new(State::default())), tx }
    }

    /// Builder form of [`register_kind`](Self::register_kind).
    pub fn with_kind(self, gvk: Gvk, namespaced: bool) -> Self {
        self.register_kind(gvk, namespaced);
        self
    }

    pub fn register_kind(&self, gvk: Gvk, namespaced: bool) {
        self.lock().kinds.insert(gvk, KindInfo { namespaced });
    }

    /// Make the next call of `op` fail with `err`. Queued errors are consumed in order.
    pub fn fail_next(&self, op: Op, err: StoreError) {
        self.lock().faults.entry(op).or_default().push_back(err);
    }

    /// How many times `op` was called, failed calls included.
    pub fn calls(&self, op: Op) -> usize {
        self.lock().calls.get(&op).copied().unwrap_or(0)
    }

    /// Put an object in place without going through fault injection.
    pub fn seed(&self, obj: DynamicObject) -> Result<DynamicObject, StoreError> {
        let mut st = self.lock();
        self.insert(&mut st, obj)
    }

    /// The stored object for `key`, in the version it was written.
    pub fn object(&self, key: &ObjectKey) -> Option<DynamicObject> {
        self.lock().objects.get(key).cloned()
    }

    pub fn objects(&self) -> Vec<DynamicObject> {
        self.lock().objects.values().cloned().collect()
    }

    /// Drop the change log; watches resuming from an older cursor get `Expired`.
    pub fn compact(&self) {
        let mut st = self.lock();
        st.compacted = st.rv;
        st.log.clear();
    }

    /// End every open watch stream.
    pub fn disconnect_watches(&self) {
        let _ = self.tx.send(Signal::Disconnect);
    }

    /// Send a bookmark at the current resource version to every open watch.
    pub fn bookmark(&self) {
        let rv = self.lock().rv;
        let _ = self.tx.send(Signal::Bookmark(rv));
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enter(&self, op: Op) -> Result<MutexGuard<'_, State>, StoreError> {
        let mut st = self.lock();
        *st.calls.entry(op).or_default() += 1;
        if let Some(err) = st.faults.get_mut(&op).and_then(VecDeque::pop_front) {
            debug!(?op, error = %err, "injected store failure");
            return Err(err);
        }
        Ok(st)
    }

    fn commit(&self, st: &mut State, kind: ChangeKind, mut object: DynamicObject) -> DynamicObject {
        st.rv += 1;
        object.metadata.resource_version = Some(st.rv.to_string());
        let change = Change { rv: st.rv, kind, object: object.clone() };
        st.log.push(change.clone());
        let _ = self.tx.send(Signal::Change(change));
        object
    }

    fn insert(&self, st: &mut State, obj: DynamicObject) -> Result<DynamicObject, StoreError> {
        let id = identity(&obj)?;
        check_kind(st, &id)?;
        let key = id.key();
        if st.objects.contains_key(&key) {
            return Err(StoreError::AlreadyExists(id.to_string()));
        }
        let mut fresh = obj;
        fresh.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
        fresh.metadata.generation = Some(1);
        fresh.metadata.creation_timestamp = Some(Time(chrono::Utc::now()));
        fresh.metadata.managed_fields = None;
        let stored = self.commit(st, ChangeKind::Added, fresh);
        st.objects.insert(key, stored.clone());
        Ok(stored)
    }

    fn replace(&self, st: &mut State, key: ObjectKey, existing: &DynamicObject, mut next: DynamicObject) -> DynamicObject {
        next.metadata.uid = existing.metadata.uid.clone();
        next.metadata.creation_timestamp = existing.metadata.creation_timestamp.clone();
        next.metadata.managed_fields = None;
        let bump = i64::from(payload(&next) != payload(existing));
        next.metadata.generation = Some(existing.generation() + bump);
        let stored = self.commit(st, ChangeKind::Modified, next);
        st.objects.insert(key, stored.clone());
        stored
    }
}

fn identity(obj: &DynamicObject) -> Result<ResourceId, StoreError> {
    obj.resource_id().map_err(|e| StoreError::Invalid(e.to_string()))
}

fn check_kind(st: &State, id: &ResourceId) -> Result<KindInfo, StoreError> {
    let gvk = id.gvk();
    let info = *st.kinds.get(&gvk).ok_or_else(|| StoreError::UnknownKind(gvk.to_string()))?;
    if info.namespaced && id.namespace.is_empty() {
        return Err(StoreError::Invalid(format!("{id}: namespaced kind without namespace")));
    }
    Ok(info)
}

fn check_version(id: &ResourceId, expected: Option<&str>, live: &DynamicObject) -> Result<(), StoreError> {
    match expected {
        Some(rv) if Some(rv) != live.resource_version() => Err(StoreError::Conflict(format!(
            "{id}: resource version {rv} is stale (live {})",
            live.resource_version().unwrap_or_default()
        ))),
        _ => Ok(()),
    }
}

/// The part of an object whose changes move its generation.
fn payload(obj: &DynamicObject) -> Value {
    let mut data = obj.data.clone();
    if let Some(m) = data.as_object_mut() {
        m.remove("status");
    }
    data
}

fn as_version(obj: &DynamicObject, gvk: &Gvk) -> DynamicObject {
    let mut out = obj.clone();
    out.types = Some(TypeMeta { api_version: gvk.api_version(), kind: gvk.kind.clone() });
    out
}

/// The fields an apply request sets: labels, annotations and the payload.
fn applied_fields(obj: &DynamicObject) -> Value {
    let mut meta = Map::new();
    if let Some(labels) = &obj.metadata.labels {
        meta.insert("labels".into(), serde_json::json!(labels));
    }
    if let Some(annotations) = &obj.metadata.annotations {
        meta.insert("annotations".into(), serde_json::json!(annotations));
    }
    let mut out = match &obj.data {
        Value::Object(m) => m.clone(),
        _ => Map::new(),
    };
    out.insert("metadata".into(), Value::Object(meta));
    Value::Object(out)
}

/// Merge `applied` into `live`, removing keys present in `previous` but no longer applied.
fn merge(live: &mut Value, applied: &Value, previous: Option<&Value>) {
    match (live, applied) {
        (Value::Object(live), Value::Object(applied)) => {
            let prev = previous.and_then(Value::as_object);
            for (k, v) in applied {
                let before = prev.and_then(|p| p.get(k));
                let nested = v.is_object() && live.get(k).is_some_and(Value::is_object);
                if nested {
                    if let Some(slot) = live.get_mut(k) {
                        merge(slot, v, before);
                    }
                } else {
                    live.insert(k.clone(), v.clone());
                }
            }
            if let Some(prev) = prev {
                for k in prev.keys() {
                    if !applied.contains_key(k) {
                        live.remove(k);
                    }
                }
            }
        }
        (live, applied) => *live = applied.clone(),
    }
}

#[async_trait]
impl StoreClient for MemoryStore {
    async fn resolve(&self, gvk: &Gvk) -> Result<KindInfo, StoreError> {
        let st = self.enter(Op::Resolve)?;
        st.kinds.get(gvk).copied().ok_or_else(|| StoreError::UnknownKind(gvk.to_string()))
    }

    async fn get(&self, id: &ResourceId) -> Result<Option<DynamicObject>, StoreError> {
        let st = self.enter(Op::Get)?;
        check_kind(&st, id)?;
        Ok(st.objects.get(&id.key()).map(|o| as_version(o, &id.gvk())))
    }

    async fn list(&self, gvk: &Gvk, namespace: Option<&str>) -> Result<Vec<DynamicObject>, StoreError> {
        let st = self.enter(Op::List)?;
        if !st.kinds.contains_key(gvk) {
            return Err(StoreError::UnknownKind(gvk.to_string()));
        }
        let filter = Filter { gvk: gvk.clone(), namespace: namespace.map(str::to_string) };
        Ok(st.objects.values().filter(|o| filter.matches(o)).map(|o| as_version(o, gvk)).collect())
    }

    async fn watch(
        &self,
        gvk: &Gvk,
        namespace: Option<&str>,
        cursor: &str,
        timeout: Duration,
    ) -> Result<WatchStream, StoreError> {
        let st = self.enter(Op::Watch)?;
        if !st.kinds.contains_key(gvk) {
            return Err(StoreError::UnknownKind(gvk.to_string()));
        }
        let filter = Filter { gvk: gvk.clone(), namespace: namespace.map(str::to_string) };
        // Subscribe under the lock so no write falls between replay and follow.
        let rx = self.tx.subscribe();
        let mut feed = Feed {
            initial: VecDeque::new(),
            rx: Some(rx),
            deadline: Instant::now() + timeout,
            after: st.rv,
            filter,
        };
        if cursor.is_empty() {
            feed.initial = st
                .objects
                .values()
                .filter(|o| feed.filter.matches(o))
                .map(|o| WatchEvent::Added(as_version(o, gvk)))
                .collect();
        } else {
            let from: u64 = cursor.parse().map_err(|_| StoreError::Invalid(format!("bad cursor {cursor:?}")))?;
            if from < st.compacted {
                feed.initial.push_back(WatchEvent::Error(StoreError::Expired(format!(
                    "cursor {from} is older than {}",
                    st.compacted
                ))));
                feed.rx = None;
            } else {
                feed.initial = st
                    .log
                    .iter()
                    .filter(|c| c.rv > from && feed.filter.matches(&c.object))
                    .map(|c| change_event(c, gvk))
                    .collect();
            }
        }
        drop(st);

        let stream = futures::stream::unfold(feed, |mut feed| async move {
            if let Some(ev) = feed.initial.pop_front() {
                return Some((Ok(ev), feed));
            }
            loop {
                let rx = feed.rx.as_mut()?;
                match tokio::time::timeout_at(feed.deadline, rx.recv()).await {
                    Err(_) => return None,
                    Ok(Ok(Signal::Change(c))) => {
                        if c.rv > feed.after && feed.filter.matches(&c.object) {
                            let ev = change_event(&c, &feed.filter.gvk);
                            return Some((Ok(ev), feed));
                        }
                    }
                    Ok(Ok(Signal::Bookmark(rv))) => return Some((Ok(WatchEvent::Bookmark(rv.to_string())), feed)),
                    Ok(Ok(Signal::Disconnect)) | Ok(Err(broadcast::error::RecvError::Closed)) => return None,
                    Ok(Err(broadcast::error::RecvError::Lagged(n))) => {
                        feed.rx = None;
                        let err = StoreError::Expired(format!("watch fell {n} events behind"));
                        return Some((Ok(WatchEvent::Error(err)), feed));
                    }
                }
            }
        });
        Ok(stream.boxed())
    }

    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject, StoreError> {
        let mut st = self.enter(Op::Create)?;
        self.insert(&mut st, obj.clone())
    }

    async fn update(&self, obj: &DynamicObject) -> Result<DynamicObject, StoreError> {
        let mut st = self.enter(Op::Update)?;
        let id = identity(obj)?;
        check_kind(&st, &id)?;
        let key = id.key();
        let existing = st.objects.get(&key).cloned().ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        check_version(&id, obj.resource_version(), &existing)?;
        Ok(self.replace(&mut st, key, &existing, obj.clone()))
    }

    async fn apply(&self, obj: &DynamicObject, field_manager: &str) -> Result<DynamicObject, StoreError> {
        let mut st = self.enter(Op::Apply)?;
        let id = identity(obj)?;
        check_kind(&st, &id)?;
        let key = id.key();
        let fields = applied_fields(obj);
        let slot = (key.clone(), field_manager.to_string());
        let Some(existing) = st.objects.get(&key).cloned() else {
            if obj.resource_version().is_some() {
                return Err(StoreError::NotFound(id.to_string()));
            }
            let stored = self.insert(&mut st, obj.clone())?;
            st.applied.insert(slot, fields);
            return Ok(stored);
        };
        check_version(&id, obj.resource_version(), &existing)?;

        let mut live = serde_json::to_value(&existing).map_err(|e| StoreError::Invalid(e.to_string()))?;
        merge(&mut live, &fields, st.applied.get(&slot));
        let mut merged: DynamicObject =
            serde_json::from_value(live).map_err(|e| StoreError::Invalid(e.to_string()))?;
        merged.types = obj.types.clone();
        // Timestamps lose sub-second precision through JSON.
        merged.metadata.creation_timestamp = existing.metadata.creation_timestamp.clone();
        st.applied.insert(slot, fields);
        if merged.metadata.labels.as_ref().is_some_and(BTreeMap::is_empty) {
            merged.metadata.labels = None;
        }
        if merged.metadata.annotations.as_ref().is_some_and(BTreeMap::is_empty) {
            merged.metadata.annotations = None;
        }
        if merged.metadata == existing.metadata && merged.data == existing.data {
            return Ok(existing);
        }
        Ok(self.replace(&mut st, key, &existing, merged))
    }

    async fn delete(&self, id: &ResourceId, uid: Option<&str>) -> Result<(), StoreError> {
        let mut st = self.enter(Op::Delete)?;
        check_kind(&st, id)?;
        let key = id.key();
        let existing = st.objects.get(&key).ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        if let Some(uid) = uid {
            if existing.uid() != Some(uid) {
                return Err(StoreError::Conflict(format!("{id}: uid precondition {uid} failed")));
            }
        }
        if let Some(gone) = st.objects.remove(&key) {
            st.applied.retain(|(k, _), _| k != &key);
            self.commit(&mut st, ChangeKind::Deleted, gone);
        }
        Ok(())
    }
}

fn change_event(c: &Change, gvk: &Gvk) -> WatchEvent {
    let obj = as_version(&c.object, gvk);
    match c.kind {
        ChangeKind::Added => WatchEvent::Added(obj),
        ChangeKind::Modified => WatchEvent::Modified(obj),
        ChangeKind::Deleted => WatchEvent::Deleted(obj),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_removes_fields_no_longer_applied() {
        let mut live = json!({"spec": {"replicas": 3, "paused": true, "image": "a"}, "status": {"ok": true}});
        let previous = json!({"spec": {"replicas": 3, "paused": true}});
        let applied = json!({"spec": {"replicas": 5}});
        merge(&mut live, &applied, Some(&previous));
        assert_eq!(live, json!({"spec": {"replicas": 5, "image": "a"}, "status": {"ok": true}}));
    }

    #[test]
    fn merge_without_history_only_adds() {
        let mut live = json!({"a": 1, "b": {"c": 2}});
        merge(&mut live, &json!({"b": {"d": 3}}), None);
        assert_eq!(live, json!({"a": 1, "b": {"c": 2, "d": 3}}));
    }
}
