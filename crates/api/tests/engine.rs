#![forbid(unsafe_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use konform_api::{Engine, EngineConfig, EngineError, Operation};
use konform_core::metadata::{MANAGED_ANNOTATION, MANAGER_ANNOTATION, SOURCE_COMMIT_ANNOTATION};
use konform_core::{ActualResource, DynamicObject, ErrorClass, Gvk, ObjectExt, ReconcileError, Scope, StoreError};
use konform_kubehub::{MemoryStore, Op, StoreClient};
use konform_watch::WatcherConfig;
use kube::core::{ApiResource, GroupVersionKind};
use serde_json::json;

fn store() -> MemoryStore {
    MemoryStore::new()
        .with_kind(Gvk::new("", "v1", "Namespace"), false)
        .with_kind(Gvk::new("", "v1", "ConfigMap"), true)
}

fn config(scope: Scope) -> EngineConfig {
    EngineConfig {
        scope,
        workers: 2,
        watch: WatcherConfig {
            timeout_min: Duration::from_secs(2),
            timeout_max: Duration::from_secs(3),
            reconnect_base: Duration::from_millis(10),
            reconnect_max: Duration::from_millis(50),
        },
        retry_base: Duration::from_millis(20),
        retry_max: Duration::from_millis(100),
        ..EngineConfig::default()
    }
}

fn engine(s: &MemoryStore, scope: Scope) -> Arc<Engine> {
    let client: Arc<dyn StoreClient> = Arc::new(s.clone());
    Arc::new(Engine::new(client, config(scope)))
}

fn cm(name: &str, value: &str) -> DynamicObject {
    let ar = ApiResource::from_gvk(&GroupVersionKind::gvk("", "v1", "ConfigMap"));
    let mut o = DynamicObject::new(name, &ar).within("ns1");
    o.metadata.annotations = Some([(MANAGED_ANNOTATION.to_string(), "enabled".to_string())].into_iter().collect());
    o.data = json!({ "data": { "k": value } });
    o
}

fn widget_gvk() -> Gvk {
    Gvk::new("example.com", "v1", "Widget")
}

fn widget(name: &str) -> DynamicObject {
    let ar = ApiResource::from_gvk(&GroupVersionKind::gvk("example.com", "v1", "Widget"));
    let mut w = DynamicObject::new(name, &ar).within("ns1");
    w.metadata.annotations = cm("x", "").metadata.annotations;
    w
}

async fn live(s: &MemoryStore, obj: &DynamicObject) -> Option<DynamicObject> {
    s.get(&obj.resource_id().unwrap()).await.unwrap()
}

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn workers_repair_drift_and_deletion() {
    let s = store();
    let e = engine(&s, Scope::Root);
    e.sync(vec![cm("a", "1")], "c1").await.unwrap();
    let workers = e.run_workers(2);

    let mut tampered = live(&s, &cm("a", "")).await.unwrap();
    assert_eq!(tampered.annotation(SOURCE_COMMIT_ANNOTATION), Some("c1"));
    tampered.data["data"]["k"] = json!("tampered");
    s.update(&tampered).await.unwrap();
    eventually("drift repaired", || {
        let s = s.clone();
        async move { live(&s, &cm("a", "")).await.map(|o| o.data["data"]["k"] == "1").unwrap_or(false) }
    })
    .await;

    let id = cm("a", "").resource_id().unwrap();
    s.delete(&id, None).await.unwrap();
    eventually("object recreated", || {
        let s = s.clone();
        async move { live(&s, &cm("a", "")).await.is_some() }
    })
    .await;

    e.shutdown().await;
    for w in workers {
        w.await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn remediate_deletes_undeclared_objects() {
    let s = store();
    let e = engine(&s, Scope::Root);
    e.sync(vec![cm("a", "1")], "").await.unwrap();
    let observed = live(&s, &cm("a", "")).await.unwrap();

    e.cache().update(Vec::new(), "").unwrap();
    let op = e.remediate(&observed.key().unwrap(), Some(&observed)).await.unwrap();
    assert_eq!(op, Operation::Delete);
    assert!(live(&s, &cm("a", "")).await.is_none());

    // Nothing declared and nothing observed.
    let op = e.remediate(&observed.key().unwrap(), None).await.unwrap();
    assert_eq!(op, Operation::NoOp);
    e.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn remediate_reports_policy_and_ownership_errors() {
    let s = store();
    let root = engine(&s, Scope::Root);
    root.sync(vec![cm("shared", "root")], "").await.unwrap();
    let observed = live(&s, &cm("shared", "")).await.unwrap();
    assert_eq!(observed.annotation(MANAGER_ANNOTATION), Some(":root"));

    let ns = engine(&s, Scope::Namespace("ns1".into()));
    ns.cache().update(vec![cm("shared", "ns")], "").unwrap();
    let err = ns.remediate(&observed.key().unwrap(), Some(&observed)).await.unwrap_err();
    assert!(matches!(&err, ReconcileError::ManagementConflict { manager, .. } if manager == ":root"));
    assert_eq!(err.class(), ErrorClass::Ownership);

    let mut unset = cm("loose", "1");
    unset.metadata.annotations = None;
    ns.cache().update(vec![unset.clone()], "").unwrap();
    let err = ns.remediate(&unset.key().unwrap(), None).await.unwrap_err();
    assert!(matches!(err, ReconcileError::InvalidManagement { .. }));
    assert!(!err.is_retriable());
    assert!(live(&s, &unset).await.is_none());

    root.shutdown().await;
    ns.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn transient_failures_are_retried_by_workers() {
    let s = store();
    let e = engine(&s, Scope::Root);
    let declared = cm("a", "1");
    e.cache().update(vec![declared.clone()], "").unwrap();
    s.fail_next(Op::Apply, StoreError::Transport("connection reset".into()));
    s.fail_next(Op::Apply, StoreError::Transport("connection reset".into()));

    let workers = e.run_workers(1);
    e.queue().add(ActualResource::tombstone(declared.clone()));
    eventually("create after retries", || {
        let (s, declared) = (s.clone(), declared.clone());
        async move { live(&s, &declared).await.is_some() }
    })
    .await;
    assert_eq!(s.calls(Op::Apply), 3);

    e.shutdown().await;
    for w in workers {
        w.await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn plan_covers_declared_and_stale_entries() {
    let s = store();
    let e = engine(&s, Scope::Root);
    e.sync(vec![cm("a", "1"), cm("b", "1"), cm("same", "1")], "").await.unwrap();

    e.cache().update(vec![cm("a", "2"), cm("c", "1"), cm("same", "1")], "").unwrap();
    let (plan, res) = e.plan().await;
    res.unwrap();
    let ops: Vec<(&str, Operation)> = plan.iter().map(|p| (p.id.name.as_str(), p.op)).collect();
    assert_eq!(
        ops,
        vec![
            ("a", Operation::Update),
            ("b", Operation::Delete),
            ("c", Operation::Create),
            ("same", Operation::NoOp),
        ]
    );
    assert_eq!(plan[0].drift.as_ref().map(|d| (d.adds, d.updates)), Some((0, 1)));
    assert!(plan[3].drift.is_none());
    // Planning writes nothing.
    assert!(live(&s, &cm("b", "")).await.is_some());
    assert!(live(&s, &cm("c", "")).await.is_none());
    e.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rejected_declared_state_applies_nothing() {
    let s = store();
    let e = engine(&s, Scope::Root);
    e.sync(vec![cm("a", "1")], "c1").await.unwrap();

    let mut broken = cm("b", "1");
    broken.data = json!("not an object");
    let err = e.sync(vec![cm("a", "2"), broken], "c2").await.unwrap_err();
    assert!(matches!(err, EngineError::Declared(_)));
    assert_eq!(e.cache().commit(), "c1");
    assert_eq!(live(&s, &cm("a", "")).await.unwrap().data["data"]["k"], "1");
    e.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sync_watches_only_accepted_kinds() {
    let s = store();
    let e = engine(&s, Scope::Root);
    let err = e.sync(vec![widget("w"), cm("a", "1")], "").await.unwrap_err();
    let EngineError::Reconcile(errs) = err else { panic!("expected reconcile errors") };
    assert!(errs.errors().iter().any(|e| matches!(e, ReconcileError::UnknownKind { gvk } if gvk.kind == "Widget")));
    assert_eq!(e.watches().watched().into_iter().collect::<Vec<_>>(), vec![Gvk::new("", "v1", "ConfigMap")]);
    assert_eq!(e.pending_kinds().into_iter().collect::<Vec<_>>(), vec![widget_gvk()]);
    assert!(e.needs_recovery());
    e.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unserved_kinds_converge_once_the_store_serves_them() {
    let s = store();
    let e = engine(&s, Scope::Root);
    assert!(e.sync(vec![widget("w"), cm("a", "1")], "").await.is_err());
    assert!(live(&s, &cm("a", "")).await.is_some());
    let workers = e.run_workers(1);

    // Still unserved: retries keep failing without a new sync.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(e.needs_recovery());

    s.register_kind(widget_gvk(), true);
    eventually("widget created", || {
        let s = s.clone();
        async move { live(&s, &widget("w")).await.is_some() }
    })
    .await;
    eventually("widget watched", || {
        let e = Arc::clone(&e);
        async move { !e.needs_recovery() && e.watches().watched().contains(&widget_gvk()) }
    })
    .await;
    assert!(e.pending_kinds().is_empty());

    e.shutdown().await;
    for w in workers {
        w.await.unwrap();
    }
}
