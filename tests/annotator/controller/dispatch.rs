use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use annotator::annotator::controller::dispatch::{Dispatcher, WatchEvent};
use annotator::annotator::controller::reconcile::ReconcileOutcome;
use annotator::annotator::controller::runtime::{ControllerRuntime, WorkQueue};
use annotator::annotator::k8s::{WorkloadKey, WorkloadKind};
use annotator::annotator::store::memory::InMemoryMetadataStore;
use annotator::annotator::store::state::VERSION_KEY;
use annotator::annotator::test_support::{deployment, replica_set, rolling, settled, statefulset};
use chrono::Utc;
use tokio_util::sync::CancellationToken;

fn dispatcher(kind: WorkloadKind) -> (Dispatcher, Arc<ControllerRuntime>) {
    let runtime = ControllerRuntime::new();
    let store = Arc::new(InMemoryMetadataStore::new());
    (Dispatcher::new(kind, runtime.clone(), store), runtime)
}

fn pending(queue: &WorkQueue<WorkloadKey>) -> usize {
    queue.len()
}

#[test]
fn creation_and_deletion_always_trigger() {
    let (dispatcher, runtime) = dispatcher(WorkloadKind::Deployment);
    let web = deployment("shop", "web", "web:1");

    assert_eq!(
        dispatcher.on_workload(WatchEvent::Applied(web.clone())),
        vec![web.key.clone()]
    );
    assert_eq!(
        dispatcher.on_workload(WatchEvent::Deleted(web.clone())),
        vec![web.key.clone()]
    );
    // Both land on the same key; the queue holds it once.
    assert_eq!(pending(&runtime.work_queue(WorkloadKind::Deployment)), 1);
}

#[test]
fn metadata_only_updates_are_ignored() {
    let (dispatcher, runtime) = dispatcher(WorkloadKind::Deployment);
    let web = deployment("shop", "web", "web:1");
    dispatcher.on_workload(WatchEvent::Applied(web.clone()));

    let mut patched = web.clone();
    patched
        .annotations
        .insert(VERSION_KEY.to_string(), "gen-1-img-1".to_string());
    patched.resource_version = Some("99".to_string());
    assert!(dispatcher
        .on_workload(WatchEvent::Applied(patched.clone()))
        .is_empty());

    assert_eq!(
        dispatcher.on_workload(WatchEvent::Applied(rolling(patched.clone(), "web:2"))),
        vec![web.key.clone()]
    );
    assert_eq!(
        dispatcher.on_workload(WatchEvent::Applied(settled(rolling(patched, "web:2")))),
        vec![web.key.clone()]
    );
    assert_eq!(pending(&runtime.work_queue(WorkloadKind::Deployment)), 1);
}

#[test]
fn other_kinds_are_not_dispatched() {
    let (dispatcher, runtime) = dispatcher(WorkloadKind::Deployment);
    assert!(dispatcher
        .on_workload(WatchEvent::Applied(statefulset("shop", "db", "db:1")))
        .is_empty());
    assert!(runtime.work_queue(WorkloadKind::StatefulSet).is_empty());
}

#[test]
fn relist_detects_missed_deletions() {
    let (dispatcher, _runtime) = dispatcher(WorkloadKind::Deployment);
    let web = deployment("shop", "web", "web:1");
    let api = deployment("shop", "api", "api:1");
    dispatcher.on_workload(WatchEvent::Applied(web.clone()));
    dispatcher.on_workload(WatchEvent::Applied(api.clone()));

    assert!(dispatcher.on_workload(WatchEvent::RelistStarted).is_empty());
    assert!(dispatcher
        .on_workload(WatchEvent::Applied(web.clone()))
        .is_empty());
    assert_eq!(
        dispatcher.on_workload(WatchEvent::RelistDone),
        vec![api.key.clone()]
    );
}

#[test]
fn replica_set_changes_trigger_their_deployment() {
    let (dispatcher, runtime) = dispatcher(WorkloadKind::Deployment);
    let web = deployment("shop", "web", "web:1");
    let child = replica_set(&web, "abc123", Utc::now());

    assert_eq!(
        dispatcher.on_child(WatchEvent::Applied(child.clone())),
        Some(web.key.clone())
    );

    let mut orphan = child.clone();
    orphan.owners.clear();
    assert_eq!(dispatcher.on_child(WatchEvent::Applied(orphan)), None);
    assert_eq!(pending(&runtime.work_queue(WorkloadKind::Deployment)), 1);

    let (sts_dispatcher, _) = self::dispatcher(WorkloadKind::StatefulSet);
    assert_eq!(sts_dispatcher.on_child(WatchEvent::Deleted(child)), None);
}

#[tokio::test]
async fn a_key_is_never_reconciled_concurrently() {
    let runtime = ControllerRuntime::new();
    let shutdown = CancellationToken::new();
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let runs = Arc::new(AtomicUsize::new(0));

    let handles = {
        let active = active.clone();
        let peak = peak.clone();
        let runs = runs.clone();
        runtime.spawn_workers(WorkloadKind::Deployment, 4, shutdown.clone(), move |_key| {
            let active = active.clone();
            let peak = peak.clone();
            let runs = runs.clone();
            async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                runs.fetch_add(1, Ordering::SeqCst);
                ReconcileOutcome::Done
            }
        })
    };

    let key = WorkloadKey::new(WorkloadKind::Deployment, "shop", "web");
    runtime.enqueue(key.clone());
    tokio::time::sleep(Duration::from_millis(5)).await;
    // Arrives while the first run is in flight: coalesced into one rerun.
    runtime.enqueue(key.clone());
    runtime.enqueue(key.clone());

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(peak.load(Ordering::SeqCst), 1);
    assert_eq!(runs.load(Ordering::SeqCst), 2);

    shutdown.cancel();
    for handle in handles {
        handle.await.expect("worker");
    }
}

#[tokio::test]
async fn distinct_keys_run_in_parallel() {
    let runtime = ControllerRuntime::new();
    let shutdown = CancellationToken::new();
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let handles = {
        let active = active.clone();
        let peak = peak.clone();
        runtime.spawn_workers(WorkloadKind::Deployment, 2, shutdown.clone(), move |_key| {
            let active = active.clone();
            let peak = peak.clone();
            async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(30)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                ReconcileOutcome::Done
            }
        })
    };

    runtime.enqueue(WorkloadKey::new(WorkloadKind::Deployment, "shop", "web"));
    runtime.enqueue(WorkloadKey::new(WorkloadKind::Deployment, "shop", "api"));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(peak.load(Ordering::SeqCst), 2);

    shutdown.cancel();
    for handle in handles {
        handle.await.expect("worker");
    }
}

#[tokio::test(start_paused = true)]
async fn requeue_outcome_reschedules_after_delay() {
    let runtime = ControllerRuntime::new();
    let shutdown = CancellationToken::new();
    let runs = Arc::new(AtomicUsize::new(0));

    let handles = {
        let runs = runs.clone();
        runtime.spawn_workers(WorkloadKind::Deployment, 1, shutdown.clone(), move |_key| {
            let runs = runs.clone();
            async move {
                if runs.fetch_add(1, Ordering::SeqCst) == 0 {
                    ReconcileOutcome::RequeueAfter(Duration::from_secs(60))
                } else {
                    ReconcileOutcome::Done
                }
            }
        })
    };

    runtime.enqueue(WorkloadKey::new(WorkloadKind::Deployment, "shop", "web"));
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(runs.load(Ordering::SeqCst), 2);

    shutdown.cancel();
    for handle in handles {
        handle.await.expect("worker");
    }
}
