use std::sync::Arc;
use std::time::Duration;

use annotator::annotator::annotation::memory::RecordingSink;
use annotator::annotator::controller::dispatch::{Dispatcher, WatchEvent};
use annotator::annotator::controller::reconcile::WorkloadReconciler;
use annotator::annotator::controller::runtime::{ControllerRuntime, WorkQueue};
use annotator::annotator::controller::tracking::{TRACKING_ENABLED_VALUE, TRACKING_LABEL};
use annotator::annotator::k8s::{NamespaceSnapshot, WorkloadKey, WorkloadKind};
use annotator::annotator::store::memory::InMemoryMetadataStore;
use annotator::annotator::store::state::VERSION_KEY;
use annotator::annotator::test_support::{
    daemonset, deployment, rolling, tracked_namespace, untracked_namespace,
};

fn setup() -> (
    Arc<InMemoryMetadataStore>,
    Arc<RecordingSink>,
    Arc<ControllerRuntime>,
) {
    let store = Arc::new(InMemoryMetadataStore::new());
    let sink = Arc::new(RecordingSink::new());
    let runtime = ControllerRuntime::new();
    runtime.register_store(store.clone());
    runtime.register_sink(sink.clone());
    (store, sink, runtime)
}

async fn drain(queue: &WorkQueue<WorkloadKey>) -> Vec<WorkloadKey> {
    let mut keys = Vec::new();
    while !queue.is_empty() {
        let key = queue.next().await.expect("queue open");
        queue.done(&key);
        keys.push(key);
    }
    keys.sort();
    keys
}

async fn reconcile(runtime: &ControllerRuntime, key: &WorkloadKey) {
    WorkloadReconciler::new(key.kind, Duration::from_secs(60))
        .reconcile(&runtime.context(), key)
        .await;
}

fn enabled(name: &str) -> NamespaceSnapshot {
    NamespaceSnapshot::new(name).with_label(TRACKING_LABEL, TRACKING_ENABLED_VALUE)
}

#[tokio::test]
async fn untracked_namespaces_never_emit() {
    let (store, sink, runtime) = setup();
    untracked_namespace(&store, "dev");
    let key = WorkloadKey::new(WorkloadKind::Deployment, "dev", "api");

    store.upsert_workload(deployment("dev", "api", "api:1"));
    reconcile(&runtime, &key).await;
    let current = store.workload(&key).expect("workload");
    store.upsert_workload(rolling(current, "api:2"));
    reconcile(&runtime, &key).await;
    store.remove_workload(&key);
    reconcile(&runtime, &key).await;

    assert!(sink.created().is_empty());
    assert_eq!(store.patch_count(), 0);
}

#[tokio::test]
async fn wrong_label_value_is_not_tracked() {
    let (store, sink, runtime) = setup();
    let namespace = NamespaceSnapshot::new("dev").with_label(TRACKING_LABEL, "Enabled");
    store.set_namespace_labels("dev", namespace.labels.clone());
    let key = WorkloadKey::new(WorkloadKind::DaemonSet, "dev", "agent");
    store.upsert_workload(daemonset("dev", "agent", "agent:1"));

    reconcile(&runtime, &key).await;
    assert!(sink.created().is_empty());
    assert_eq!(store.patch_count(), 0);
}

#[tokio::test]
async fn enabling_a_namespace_fans_out_and_initializes() {
    let (store, sink, runtime) = setup();
    store.upsert_workload(deployment("shop", "web", "web:1"));
    store.upsert_workload(deployment("shop", "api", "api:3"));
    store.upsert_workload(daemonset("shop", "agent", "agent:1"));
    store.upsert_workload(deployment("other", "web", "web:1"));

    let dispatcher = Dispatcher::new(WorkloadKind::Deployment, runtime.clone(), store.clone());
    let queue = runtime.work_queue(WorkloadKind::Deployment);

    // Seen without the label first: no transition.
    let triggered = dispatcher
        .on_namespace(WatchEvent::Applied(NamespaceSnapshot::new("shop")))
        .await
        .expect("fan out");
    assert!(triggered.is_empty());

    tracked_namespace(&store, "shop");
    let triggered = dispatcher
        .on_namespace(WatchEvent::Applied(enabled("shop")))
        .await
        .expect("fan out");
    assert_eq!(triggered.len(), 2);

    let keys = drain(&queue).await;
    assert_eq!(
        keys,
        vec![
            WorkloadKey::new(WorkloadKind::Deployment, "shop", "api"),
            WorkloadKey::new(WorkloadKind::Deployment, "shop", "web"),
        ]
    );
    for key in &keys {
        reconcile(&runtime, key).await;
        assert!(store
            .annotations(key)
            .expect("workload")
            .contains_key(VERSION_KEY));
    }
    assert!(sink.created().is_empty());

    // Label unchanged: no second fan-out.
    let triggered = dispatcher
        .on_namespace(WatchEvent::Applied(enabled("shop")))
        .await
        .expect("fan out");
    assert!(triggered.is_empty());
}

#[tokio::test]
async fn disabling_a_namespace_clears_state() {
    let (store, sink, runtime) = setup();
    tracked_namespace(&store, "shop");
    let key = WorkloadKey::new(WorkloadKind::Deployment, "shop", "web");
    store.upsert_workload(deployment("shop", "web", "web:1"));
    reconcile(&runtime, &key).await;

    let dispatcher = Dispatcher::new(WorkloadKind::Deployment, runtime.clone(), store.clone());
    dispatcher
        .on_namespace(WatchEvent::Applied(enabled("shop")))
        .await
        .expect("fan out");
    drain(&runtime.work_queue(WorkloadKind::Deployment)).await;

    untracked_namespace(&store, "shop");
    let triggered = dispatcher
        .on_namespace(WatchEvent::Applied(NamespaceSnapshot::new("shop")))
        .await
        .expect("fan out");
    assert_eq!(triggered, vec![key.clone()]);

    reconcile(&runtime, &key).await;
    assert!(!store
        .annotations(&key)
        .expect("workload")
        .contains_key(VERSION_KEY));
    assert!(sink.created().is_empty());
}

#[tokio::test]
async fn namespace_deletion_never_triggers() {
    let (store, _sink, runtime) = setup();
    store.upsert_workload(deployment("shop", "web", "web:1"));
    let dispatcher = Dispatcher::new(WorkloadKind::Deployment, runtime.clone(), store.clone());

    dispatcher
        .on_namespace(WatchEvent::Applied(enabled("shop")))
        .await
        .expect("fan out");
    drain(&runtime.work_queue(WorkloadKind::Deployment)).await;

    let triggered = dispatcher
        .on_namespace(WatchEvent::Deleted(enabled("shop")))
        .await
        .expect("delete");
    assert!(triggered.is_empty());
    assert!(runtime.work_queue(WorkloadKind::Deployment).is_empty());
}
