#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use konform_core::metadata::{MANAGED_ANNOTATION, MANAGER_ANNOTATION};
use konform_core::{ActualResource, DynamicObject, Gvk, ObjectExt, ReconcileError, ResourceId, Scope, StoreError};
use konform_kubehub::{KindInfo, MemoryStore, StoreClient, WatchEvent, WatchStream};
use konform_store::{DeclaredResourceCache, ObjectQueue};
use konform_watch::{FilteredWatcher, WatchManager, WatcherConfig};
use kube::core::{ApiResource, GroupVersionKind};

fn deploy_gvk() -> Gvk {
    Gvk::new("apps", "v1", "Deployment")
}

fn fast() -> WatcherConfig {
    WatcherConfig {
        timeout_min: Duration::from_secs(2),
        timeout_max: Duration::from_secs(3),
        reconnect_base: Duration::from_millis(10),
        reconnect_max: Duration::from_millis(50),
    }
}

fn object(version: &str, name: &str, annotations: &[(&str, &str)]) -> DynamicObject {
    let ar = ApiResource::from_gvk(&GroupVersionKind::gvk("apps", version, "Deployment"));
    let mut o = DynamicObject::new(name, &ar).within("ns1");
    if !annotations.is_empty() {
        o.metadata.annotations =
            Some(annotations.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect());
    }
    o.data = serde_json::json!({ "spec": { "replicas": 1 } });
    o
}

fn managed(name: &str) -> DynamicObject {
    object("v1", name, &[(MANAGED_ANNOTATION, "enabled")])
}

struct Rig {
    store: MemoryStore,
    cache: Arc<DeclaredResourceCache>,
    queue: ObjectQueue,
}

impl Rig {
    fn new() -> Self {
        Self {
            store: MemoryStore::new().with_kind(deploy_gvk(), true),
            cache: Arc::new(DeclaredResourceCache::new()),
            queue: ObjectQueue::new(),
        }
    }

    fn client(&self) -> Arc<dyn StoreClient> {
        Arc::new(self.store.clone())
    }

    fn manager(&self, scope: Scope) -> WatchManager {
        WatchManager::new(scope, self.client(), Arc::clone(&self.cache), self.queue.clone(), fast())
    }

    fn watcher(&self, scope: Scope) -> FilteredWatcher {
        FilteredWatcher::new(deploy_gvk(), scope, self.client(), Arc::clone(&self.cache), self.queue.clone(), fast())
    }

    async fn next(&self) -> Arc<ActualResource> {
        tokio::time::timeout(Duration::from_secs(5), self.queue.get())
            .await
            .expect("nothing queued")
            .expect("queue shut down")
    }
}

fn kinds(k: &[Gvk]) -> BTreeSet<Gvk> {
    k.iter().cloned().collect()
}

#[test]
fn should_process_filters_by_declaration_and_ownership() {
    let rig = Rig::new();
    rig.cache.update(vec![object("v1", "declared", &[])], "c1").unwrap();
    let root = rig.watcher(Scope::Root);

    assert!(root.should_process(&object("v1", "declared", &[])));
    assert!(!root.should_process(&object("v1beta1", "declared", &[])), "version must match the declaration");
    assert!(root.should_process(&managed("stray")));
    assert!(!root.should_process(&object("v1", "stray", &[])));
    assert!(!root.should_process(&object("v1", "stray", &[(MANAGED_ANNOTATION, "disabled")])));

    let ns = rig.watcher(Scope::Namespace("ns1".into()));
    let root_owned = object("v1", "declared", &[(MANAGED_ANNOTATION, "enabled"), (MANAGER_ANNOTATION, ":root")]);
    assert!(!ns.should_process(&root_owned));
    assert!(root.should_process(&root_owned));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn forwards_upserts_and_tombstones() {
    let rig = Rig::new();
    let mgr = rig.manager(Scope::Root);
    let (watched, res) = mgr.update(&kinds(&[deploy_gvk()])).await;
    assert!(res.is_ok());
    assert_eq!(watched, kinds(&[deploy_gvk()]));

    rig.store.create(&object("v1", "ignored", &[])).await.unwrap();
    let a = rig.store.create(&managed("a")).await.unwrap();
    let got = rig.next().await;
    assert_eq!(got.object.metadata.name.as_deref(), Some("a"));
    assert!(!got.deleted);
    rig.queue.done(&got);

    rig.store.delete(&a.resource_id().unwrap(), None).await.unwrap();
    let gone = rig.next().await;
    assert!(gone.deleted);
    assert_eq!(gone.object.metadata.name.as_deref(), Some("a"));
    rig.queue.done(&gone);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rig.queue.is_empty(), "unmanaged undeclared object must not be queued");
    mgr.stop_all().await;
    assert!(mgr.watched().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_kind_sets_needs_update_until_it_appears() {
    let rig = Rig::new();
    let mgr = rig.manager(Scope::Root);
    let cm = Gvk::new("", "v1", "ConfigMap");

    let (watched, res) = mgr.update(&kinds(&[deploy_gvk(), cm.clone()])).await;
    assert_eq!(watched, kinds(&[deploy_gvk()]));
    let errs = res.unwrap_err();
    assert_eq!(errs.len(), 1);
    assert!(matches!(&errs.errors()[0], ReconcileError::UnknownKind { gvk } if *gvk == cm));
    assert!(mgr.needs_update());

    rig.store.register_kind(cm.clone(), true);
    let (watched, res) = mgr.update(&kinds(&[deploy_gvk(), cm.clone()])).await;
    assert!(res.is_ok());
    assert_eq!(watched.len(), 2);
    assert!(!mgr.needs_update());

    let (watched, _) = mgr.update(&kinds(&[cm.clone()])).await;
    assert_eq!(watched, kinds(&[cm]));
    mgr.stop_all().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn expired_cursor_relists() {
    let rig = Rig::new();
    let cm = Gvk::new("", "v1", "ConfigMap");
    rig.store.register_kind(cm.clone(), true);
    let mgr = rig.manager(Scope::Root);
    mgr.update(&kinds(&[deploy_gvk()])).await.1.unwrap();

    rig.store.create(&managed("a")).await.unwrap();
    let first = rig.next().await;
    rig.queue.done(&first);

    // Move the store past the watcher's cursor, then forget the history.
    let ar = ApiResource::from_gvk(&GroupVersionKind::gvk("", "v1", "ConfigMap"));
    rig.store.create(&DynamicObject::new("other", &ar).within("ns1")).await.unwrap();
    rig.store.compact();
    rig.store.disconnect_watches();

    let relisted = rig.next().await;
    assert_eq!(relisted.object.metadata.name.as_deref(), Some("a"));
    assert!(!relisted.deleted);
    mgr.stop_all().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn bookmarks_advance_cursor_and_stop_is_idempotent() {
    let rig = Rig::new();
    let watcher = Arc::new(rig.watcher(Scope::Root));
    let task = {
        let w = Arc::clone(&watcher);
        tokio::spawn(async move { w.run().await })
    };
    // Unrelated kind writes move the global resource version.
    let cm = Gvk::new("", "v1", "ConfigMap");
    rig.store.register_kind(cm, true);
    let ar = ApiResource::from_gvk(&GroupVersionKind::gvk("", "v1", "ConfigMap"));
    let other = rig.store.create(&DynamicObject::new("other", &ar).within("ns1")).await.unwrap();
    let want = other.resource_version().unwrap().to_string();

    let advanced = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            rig.store.bookmark();
            if watcher.cursor().await == want {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(advanced.is_ok(), "bookmark never reached the watcher");
    assert!(rig.queue.is_empty());

    watcher.stop().await;
    watcher.stop().await;
    assert!(watcher.is_stopped());
    let res = tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
    assert!(res.is_ok());
}

/// A store whose every watch connection opens and then fails in-band.
#[derive(Default)]
struct FailingWatches {
    connects: AtomicUsize,
}

#[async_trait]
impl StoreClient for FailingWatches {
    async fn resolve(&self, _gvk: &Gvk) -> Result<KindInfo, StoreError> {
        Ok(KindInfo { namespaced: true })
    }

    async fn get(&self, _id: &ResourceId) -> Result<Option<DynamicObject>, StoreError> {
        Ok(None)
    }

    async fn list(&self, _gvk: &Gvk, _namespace: Option<&str>) -> Result<Vec<DynamicObject>, StoreError> {
        Ok(Vec::new())
    }

    async fn watch(
        &self,
        _gvk: &Gvk,
        _namespace: Option<&str>,
        _cursor: &str,
        _timeout: Duration,
    ) -> Result<WatchStream, StoreError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let events = vec![Ok(WatchEvent::Error(StoreError::Transport("stream reset".into())))];
        Ok(futures::stream::iter(events).boxed())
    }

    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject, StoreError> {
        Ok(obj.clone())
    }

    async fn update(&self, obj: &DynamicObject) -> Result<DynamicObject, StoreError> {
        Ok(obj.clone())
    }

    async fn apply(&self, obj: &DynamicObject, _field_manager: &str) -> Result<DynamicObject, StoreError> {
        Ok(obj.clone())
    }

    async fn delete(&self, _id: &ResourceId, _uid: Option<&str>) -> Result<(), StoreError> {
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn in_band_errors_back_off_between_reconnects() {
    let store = Arc::new(FailingWatches::default());
    let client: Arc<dyn StoreClient> = Arc::clone(&store) as Arc<dyn StoreClient>;
    let watcher = Arc::new(FilteredWatcher::new(
        deploy_gvk(),
        Scope::Root,
        client,
        Arc::new(DeclaredResourceCache::new()),
        ObjectQueue::new(),
        fast(),
    ));
    let task = {
        let w = Arc::clone(&watcher);
        tokio::spawn(async move { w.run().await })
    };

    // 10ms doubling to a 50ms cap allows under ten connects in 300ms.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let connects = store.connects.load(Ordering::SeqCst);
    assert!(connects >= 2, "watcher never reconnected");
    assert!(connects <= 15, "reconnected {connects} times without backing off");

    watcher.stop().await;
    let res = tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
    assert!(res.is_ok());
}
