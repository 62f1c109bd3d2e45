#![forbid(unsafe_code)]

use std::time::Duration;

use futures::StreamExt;
use konform_core::{DynamicObject, Gvk, ObjectExt, StoreError};
use konform_kubehub::{MemoryStore, Op, StoreClient, WatchEvent};
use kube::core::{ApiResource, GroupVersionKind};
use serde_json::json;

fn deploy_gvk() -> Gvk {
    Gvk::new("apps", "v1", "Deployment")
}

fn deploy(name: &str, replicas: i64) -> DynamicObject {
    let ar = ApiResource::from_gvk(&GroupVersionKind::gvk("apps", "v1", "Deployment"));
    let mut o = DynamicObject::new(name, &ar).within("ns1");
    o.data = json!({ "spec": { "replicas": replicas } });
    o
}

fn store() -> MemoryStore {
    MemoryStore::new().with_kind(deploy_gvk(), true)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn generation_moves_only_with_payload() {
    let s = store();
    let created = s.create(&deploy("web", 1)).await.unwrap();
    assert_eq!(created.generation(), 1);
    assert!(created.uid().is_some());

    let mut relabel = created.clone();
    relabel.metadata.labels = Some([("tier".to_string(), "front".to_string())].into_iter().collect());
    let relabeled = s.update(&relabel).await.unwrap();
    assert_eq!(relabeled.generation(), 1);
    assert_ne!(relabeled.resource_version(), created.resource_version());

    let mut scaled = relabeled.clone();
    scaled.data = json!({ "spec": { "replicas": 4 } });
    assert_eq!(s.update(&scaled).await.unwrap().generation(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stale_resource_version_conflicts() {
    let s = store();
    let created = s.create(&deploy("web", 1)).await.unwrap();
    let mut first = created.clone();
    first.data = json!({ "spec": { "replicas": 2 } });
    s.update(&first).await.unwrap();

    let mut second = created;
    second.data = json!({ "spec": { "replicas": 3 } });
    assert!(matches!(s.update(&second).await, Err(StoreError::Conflict(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn apply_merges_and_drops_fields_no_longer_applied() {
    let s = store();
    let mut v1 = deploy("web", 1);
    v1.data["spec"]["paused"] = json!(true);
    s.apply(&v1, "konform").await.unwrap();

    // Another writer adds a field konform never applied.
    let id = v1.resource_id().unwrap();
    let mut live = s.get(&id).await.unwrap().unwrap();
    live.data["spec"]["minReadySeconds"] = json!(5);
    s.update(&live).await.unwrap();

    let v2 = deploy("web", 2);
    let applied = s.apply(&v2, "konform").await.unwrap();
    assert_eq!(applied.data["spec"], json!({ "replicas": 2, "minReadySeconds": 5 }));

    let again = s.apply(&v2, "konform").await.unwrap();
    assert_eq!(again.resource_version(), applied.resource_version(), "no-op apply must not write");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn delete_honours_uid_precondition() {
    let s = store();
    let created = s.create(&deploy("web", 1)).await.unwrap();
    let id = created.resource_id().unwrap();
    assert!(matches!(s.delete(&id, Some("not-the-uid")).await, Err(StoreError::Conflict(_))));
    s.delete(&id, created.uid()).await.unwrap();
    assert!(s.get(&id).await.unwrap().is_none());
    assert!(s.delete(&id, None).await.unwrap_err().is_not_found());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_kind_and_injected_faults() {
    let s = store();
    let cm = Gvk::new("", "v1", "ConfigMap");
    assert!(matches!(s.resolve(&cm).await, Err(StoreError::UnknownKind(_))));

    s.fail_next(Op::Apply, StoreError::Transport("boom".into()));
    assert!(matches!(s.apply(&deploy("web", 1), "konform").await, Err(StoreError::Transport(_))));
    s.apply(&deploy("web", 1), "konform").await.unwrap();
    assert_eq!(s.calls(Op::Apply), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn watch_lists_then_follows_and_resumes() {
    let s = store();
    s.create(&deploy("a", 1)).await.unwrap();
    let mut w = s.watch(&deploy_gvk(), Some("ns1"), "", Duration::from_secs(5)).await.unwrap();
    let first = w.next().await.unwrap().unwrap();
    assert!(matches!(first, WatchEvent::Added(ref o) if o.metadata.name.as_deref() == Some("a")));
    let cursor = first.resource_version().unwrap().to_string();

    let b = s.create(&deploy("b", 1)).await.unwrap();
    let next = w.next().await.unwrap().unwrap();
    assert!(matches!(next, WatchEvent::Added(ref o) if o.metadata.name.as_deref() == Some("b")));

    s.delete(&b.resource_id().unwrap(), None).await.unwrap();
    assert!(matches!(w.next().await.unwrap().unwrap(), WatchEvent::Deleted(_)));

    // Resuming from the first cursor replays what happened since.
    let mut resumed = s.watch(&deploy_gvk(), Some("ns1"), &cursor, Duration::from_secs(5)).await.unwrap();
    assert!(matches!(resumed.next().await.unwrap().unwrap(), WatchEvent::Added(_)));
    assert!(matches!(resumed.next().await.unwrap().unwrap(), WatchEvent::Deleted(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn compacted_cursor_expires_and_timeout_ends_stream() {
    let s = store();
    let a = s.create(&deploy("a", 1)).await.unwrap();
    s.create(&deploy("b", 1)).await.unwrap();
    s.compact();
    let rv = a.resource_version().unwrap();
    let mut w = s.watch(&deploy_gvk(), None, rv, Duration::from_secs(5)).await.unwrap();
    assert!(matches!(w.next().await.unwrap().unwrap(), WatchEvent::Error(StoreError::Expired(_))));
    assert!(w.next().await.is_none());

    let mut short = s.watch(&deploy_gvk(), None, "", Duration::from_millis(50)).await.unwrap();
    let mut seen = 0;
    while let Some(ev) = tokio::time::timeout(Duration::from_secs(2), short.next()).await.unwrap() {
        ev.unwrap();
        seen += 1;
    }
    assert_eq!(seen, 2);
}
