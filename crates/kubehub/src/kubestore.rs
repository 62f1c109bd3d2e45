//! `StoreClient` over a live API server through kube-rs dynamic objects.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use konform_core::{DynamicObject, Gvk, ObjectExt, ResourceId, StoreError};
use kube::{
    api::{
        Api, DeleteParams, ListParams, Patch, PatchParams, PostParams, Preconditions, PropagationPolicy,
        WatchEvent as KubeWatchEvent, WatchParams,
    },
    core::{ApiResource, GroupVersionKind, TypeMeta},
    discovery::{self, Scope},
    Client,
};
use metrics::counter;
use tracing::{debug, info};

use crate::client::{KindInfo, StoreClient, WatchEvent, WatchStream};

/// API server limit on watch timeouts.
const MAX_WATCH_TIMEOUT_SECS: u32 = 295;

pub struct KubeStore {
    client: Client,
    kinds: Mutex<HashMap<Gvk, (ApiResource, bool)>>,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client, kinds: Mutex::new(HashMap::new()) }
    }

    async fn resource(&self, gvk: &Gvk) -> Result<(ApiResource, bool), StoreError> {
        if let Some(hit) = self.kinds.lock().unwrap_or_else(PoisonError::into_inner).get(gvk) {
            return Ok(hit.clone());
        }
        let (ar, caps) = discovery::pinned_kind(&self.client, &GroupVersionKind::gvk(&gvk.group, &gvk.version, &gvk.kind))
            .await
            .map_err(|e| store_error("resolve", e))?;
        let namespaced = matches!(caps.scope, Scope::Namespaced);
        info!(gvk = %gvk, plural = %ar.plural, namespaced, "resolved kind");
        self.kinds
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(gvk.clone(), (ar.clone(), namespaced));
        Ok((ar, namespaced))
    }

    async fn api(&self, gvk: &Gvk, namespace: Option<&str>) -> Result<(Api<DynamicObject>, ApiResource), StoreError> {
        let (ar, namespaced) = self.resource(gvk).await?;
        let api = match namespace {
            Some(ns) if namespaced && !ns.is_empty() => Api::namespaced_with(self.client.clone(), ns, &ar),
            _ => Api::all_with(self.client.clone(), &ar),
        };
        Ok((api, ar))
    }

    async fn api_for(&self, obj: &DynamicObject) -> Result<(Api<DynamicObject>, String), StoreError> {
        let id = obj.resource_id().map_err(|e| StoreError::Invalid(e.to_string()))?;
        let (api, _) = self.api(&id.gvk(), id.namespace()).await?;
        Ok((api, id.name))
    }
}

fn store_error(op: &'static str, e: kube::Error) -> StoreError {
    counter!("store_errors_total", 1u64, "op" => op);
    match e {
        kube::Error::Api(resp) => match resp.code {
            404 => StoreError::NotFound(resp.message),
            409 if resp.reason == "AlreadyExists" => StoreError::AlreadyExists(resp.message),
            409 => StoreError::Conflict(resp.message),
            410 => StoreError::Expired(resp.message),
            400 | 422 => StoreError::Invalid(resp.message),
            code => StoreError::Transport(format!("{} ({code})", resp.message)),
        },
        kube::Error::Discovery(d) => StoreError::UnknownKind(d.to_string()),
        other => StoreError::Transport(other.to_string()),
    }
}

/// List and get responses omit `apiVersion`/`kind` on items.
fn with_types(mut obj: DynamicObject, ar: &ApiResource) -> DynamicObject {
    if obj.types.is_none() {
        obj.types = Some(TypeMeta { api_version: ar.api_version.clone(), kind: ar.kind.clone() });
    }
    obj
}

/// Bookmarks are on by default, so only the server-side timeout is set.
fn watch_params(timeout: Duration) -> WatchParams {
    let secs = u32::try_from(timeout.as_secs()).unwrap_or(u32::MAX).clamp(1, MAX_WATCH_TIMEOUT_SECS);
    WatchParams::default().timeout(secs)
}

fn translate(ev: kube::Result<KubeWatchEvent<DynamicObject>>, ar: &ApiResource) -> Result<WatchEvent, StoreError> {
    match ev {
        Ok(KubeWatchEvent::Added(o)) => Ok(WatchEvent::Added(with_types(o, ar))),
        Ok(KubeWatchEvent::Modified(o)) => Ok(WatchEvent::Modified(with_types(o, ar))),
        Ok(KubeWatchEvent::Deleted(o)) => Ok(WatchEvent::Deleted(with_types(o, ar))),
        Ok(KubeWatchEvent::Bookmark(b)) => Ok(WatchEvent::Bookmark(b.metadata.resource_version)),
        Ok(KubeWatchEvent::Error(resp)) => Ok(WatchEvent::Error(store_error("watch", kube::Error::Api(resp)))),
        Err(e) => Err(store_error("watch", e)),
    }
}

#[async_trait]
impl StoreClient for KubeStore {
    async fn resolve(&self, gvk: &Gvk) -> Result<KindInfo, StoreError> {
        let (_, namespaced) = self.resource(gvk).await?;
        Ok(KindInfo { namespaced })
    }

    async fn get(&self, id: &ResourceId) -> Result<Option<DynamicObject>, StoreError> {
        let (api, ar) = self.api(&id.gvk(), id.namespace()).await?;
        let got = api.get_opt(&id.name).await.map_err(|e| store_error("get", e))?;
        Ok(got.map(|o| with_types(o, &ar)))
    }

    async fn list(&self, gvk: &Gvk, namespace: Option<&str>) -> Result<Vec<DynamicObject>, StoreError> {
        let (api, ar) = self.api(gvk, namespace).await?;
        let list = api.list(&ListParams::default()).await.map_err(|e| store_error("list", e))?;
        Ok(list.items.into_iter().map(|o| with_types(o, &ar)).collect())
    }

    async fn watch(
        &self,
        gvk: &Gvk,
        namespace: Option<&str>,
        cursor: &str,
        timeout: Duration,
    ) -> Result<WatchStream, StoreError> {
        let (api, ar) = self.api(gvk, namespace).await?;
        let wp = watch_params(timeout);
        let secs = wp.timeout.unwrap_or(MAX_WATCH_TIMEOUT_SECS);
        // An empty cursor with a plain watch means "from now", so seed it with a list first.
        let mut seed = Vec::new();
        let cursor = if cursor.is_empty() {
            let list = api.list(&ListParams::default()).await.map_err(|e| store_error("list", e))?;
            seed = list.items.into_iter().map(|o| Ok(WatchEvent::Added(with_types(o, &ar)))).collect();
            list.metadata.resource_version.unwrap_or_default()
        } else {
            cursor.to_string()
        };
        debug!(gvk = %gvk, ns = ?namespace, cursor = %cursor, timeout_secs = secs, seeded = seed.len(), "opening watch");
        let stream = api.watch(&wp, &cursor).await.map_err(|e| store_error("watch", e))?;
        let events = stream.map(move |ev| translate(ev, &ar));
        Ok(futures::stream::iter(seed).chain(events).boxed())
    }

    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject, StoreError> {
        let (api, _) = self.api_for(obj).await?;
        api.create(&PostParams::default(), obj).await.map_err(|e| store_error("create", e))
    }

    async fn update(&self, obj: &DynamicObject) -> Result<DynamicObject, StoreError> {
        let (api, name) = self.api_for(obj).await?;
        api.replace(&name, &PostParams::default(), obj).await.map_err(|e| store_error("update", e))
    }

    async fn apply(&self, obj: &DynamicObject, field_manager: &str) -> Result<DynamicObject, StoreError> {
        let (api, name) = self.api_for(obj).await?;
        let pp = PatchParams::apply(field_manager).force();
        api.patch(&name, &pp, &Patch::Apply(obj)).await.map_err(|e| store_error("apply", e))
    }

    async fn delete(&self, id: &ResourceId, uid: Option<&str>) -> Result<(), StoreError> {
        let (api, _) = self.api(&id.gvk(), id.namespace()).await?;
        let dp = DeleteParams {
            propagation_policy: Some(PropagationPolicy::Background),
            preconditions: uid.map(|u| Preconditions { uid: Some(u.to_string()), resource_version: None }),
            ..DeleteParams::default()
        };
        api.delete(&id.name, &dp).await.map_err(|e| store_error("delete", e))?;
        Ok(())
    }
}
