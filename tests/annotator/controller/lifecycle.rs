use std::sync::Arc;
use std::time::Duration;

use annotator::annotator::annotation::memory::RecordingSink;
use annotator::annotator::annotation::{AnnotationPhase, REGION_TAG};
use annotator::annotator::controller::reconcile::{ReconcileOutcome, WorkloadReconciler};
use annotator::annotator::controller::runtime::ControllerRuntime;
use annotator::annotator::k8s::{WorkloadKey, WorkloadKind};
use annotator::annotator::store::memory::InMemoryMetadataStore;
use annotator::annotator::store::state::{
    END_ANNOTATION_KEY, START_ANNOTATION_KEY, VERSION_KEY,
};
use annotator::annotator::test_support::{
    deployment, replica_set, rolling, settled, statefulset, tracked_namespace,
    untracked_namespace,
};
use chrono::{TimeZone, Utc};

struct Harness {
    store: Arc<InMemoryMetadataStore>,
    sink: Arc<RecordingSink>,
    runtime: Arc<ControllerRuntime>,
}

impl Harness {
    fn new() -> Self {
        let store = Arc::new(InMemoryMetadataStore::new());
        let sink = Arc::new(RecordingSink::new());
        let runtime = ControllerRuntime::new();
        runtime.register_store(store.clone());
        runtime.register_sink(sink.clone());
        Self {
            store,
            sink,
            runtime,
        }
    }

    async fn reconcile(&self, key: &WorkloadKey) -> ReconcileOutcome {
        WorkloadReconciler::new(key.kind, Duration::from_secs(60))
            .reconcile(&self.runtime.context(), key)
            .await
    }

    fn annotation(&self, key: &WorkloadKey, name: &str) -> Option<String> {
        self.store
            .annotations(key)
            .and_then(|annotations| annotations.get(name).cloned())
    }
}

#[tokio::test]
async fn rollout_lifecycle_end_to_end() {
    let h = Harness::new();
    tracked_namespace(&h.store, "shop");
    let key = WorkloadKey::new(WorkloadKind::Deployment, "shop", "svc");

    // First sighting only records the running version.
    h.store.upsert_workload(deployment("shop", "svc", "svc:0.9"));
    assert_eq!(h.reconcile(&key).await, ReconcileOutcome::Done);
    assert!(h.sink.created().is_empty());
    assert_eq!(h.annotation(&key, VERSION_KEY).as_deref(), Some("gen-1-img-0.9"));

    // Rollout of svc:1.0 starts.
    let current = h.store.workload(&key).expect("workload");
    h.store.upsert_workload(rolling(current, "svc:1.0"));
    assert_eq!(h.reconcile(&key).await, ReconcileOutcome::Done);
    assert_eq!(h.sink.phases(), vec![AnnotationPhase::Started]);
    let (start_id, start) = h.sink.created()[0].clone();
    assert_eq!(start.title, "deploy-start:svc");
    assert_eq!(start.body, "Started deployment svc:1.0");
    assert_eq!(h.annotation(&key, VERSION_KEY).as_deref(), Some("gen-2-img-1.0"));
    assert_eq!(h.annotation(&key, START_ANNOTATION_KEY), Some(start_id.to_string()));
    assert_eq!(h.annotation(&key, END_ANNOTATION_KEY), None);

    // Not ready yet: nothing else happens.
    assert_eq!(h.reconcile(&key).await, ReconcileOutcome::Done);
    assert_eq!(h.sink.created().len(), 1);

    // Ready: completed marker plus region conversion of the start marker.
    let current = h.store.workload(&key).expect("workload");
    h.store.upsert_workload(settled(current));
    assert_eq!(h.reconcile(&key).await, ReconcileOutcome::Done);
    assert_eq!(
        h.sink.phases(),
        vec![AnnotationPhase::Started, AnnotationPhase::Completed]
    );
    let (end_id, end) = h.sink.created()[1].clone();
    assert_eq!(end.title, "deploy-end:svc");
    assert_eq!(h.annotation(&key, END_ANNOTATION_KEY), Some(end_id.to_string()));
    let regions = h.sink.regions();
    assert_eq!(regions.len(), 1);
    assert_eq!(regions[0].id, start_id);
    assert!(regions[0].tags.iter().any(|tag| tag == REGION_TAG));

    // svc:2.0 starts a new rollout and clears the end marker.
    let current = h.store.workload(&key).expect("workload");
    h.store.upsert_workload(rolling(current, "svc:2.0"));
    assert_eq!(h.reconcile(&key).await, ReconcileOutcome::Done);
    assert_eq!(h.sink.created().len(), 3);
    let (restart_id, _) = h.sink.created()[2].clone();
    assert_eq!(h.annotation(&key, VERSION_KEY).as_deref(), Some("gen-3-img-2.0"));
    assert_eq!(h.annotation(&key, START_ANNOTATION_KEY), Some(restart_id.to_string()));
    assert_eq!(h.annotation(&key, END_ANNOTATION_KEY), None);

    // Deletion in a tracked namespace emits the delete marker.
    h.store.remove_workload(&key);
    assert_eq!(h.reconcile(&key).await, ReconcileOutcome::Done);
    let (_, deleted) = h.sink.created()[3].clone();
    assert_eq!(deleted.title, "deploy-delete:svc");
    assert_eq!(deleted.body, "Deleted deployment svc");
    assert_eq!(h.sink.phases().last(), Some(&AnnotationPhase::Deleted));
}

#[tokio::test]
async fn untracking_clears_keys_without_emitting() {
    let h = Harness::new();
    tracked_namespace(&h.store, "shop");
    let key = WorkloadKey::new(WorkloadKind::Deployment, "shop", "svc");

    h.store.upsert_workload(deployment("shop", "svc", "svc:1.0"));
    h.reconcile(&key).await;
    let current = h.store.workload(&key).expect("workload");
    h.store.upsert_workload(rolling(current, "svc:2.0"));
    h.reconcile(&key).await;
    assert_eq!(h.sink.created().len(), 1);

    untracked_namespace(&h.store, "shop");
    assert_eq!(h.reconcile(&key).await, ReconcileOutcome::Done);
    assert_eq!(h.sink.created().len(), 1);
    let annotations = h.store.annotations(&key).expect("workload");
    assert!(!annotations.contains_key(VERSION_KEY));
    assert!(!annotations.contains_key(START_ANNOTATION_KEY));
    assert!(!annotations.contains_key(END_ANNOTATION_KEY));

    // Already clear: no further patch.
    let patches = h.store.patch_count();
    h.reconcile(&key).await;
    assert_eq!(h.store.patch_count(), patches);
}

#[tokio::test]
async fn repeated_reconcile_is_idempotent() {
    let h = Harness::new();
    tracked_namespace(&h.store, "shop");
    let key = WorkloadKey::new(WorkloadKind::StatefulSet, "shop", "db");

    h.store.upsert_workload(statefulset("shop", "db", "db:15"));
    h.reconcile(&key).await;
    let current = h.store.workload(&key).expect("workload");
    h.store.upsert_workload(settled(rolling(current, "db:16")));
    h.reconcile(&key).await;
    h.reconcile(&key).await;
    assert_eq!(
        h.sink.phases(),
        vec![AnnotationPhase::Started, AnnotationPhase::Completed]
    );

    let patches = h.store.patch_count();
    h.reconcile(&key).await;
    h.reconcile(&key).await;
    assert_eq!(h.sink.created().len(), 2);
    assert_eq!(h.store.patch_count(), patches);
}

#[tokio::test]
async fn deployment_versions_follow_the_newest_replica_set() {
    let h = Harness::new();
    tracked_namespace(&h.store, "shop");
    let key = WorkloadKey::new(WorkloadKind::Deployment, "shop", "web");
    let web = deployment("shop", "web", "web:1.0");

    h.store.add_child_controller(replica_set(
        &web,
        "aaa111",
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
    ));
    h.store.upsert_workload(web.clone());
    h.reconcile(&key).await;
    assert_eq!(
        h.annotation(&key, VERSION_KEY).as_deref(),
        Some("hash-aaa111-img-1.0")
    );

    // A newer ReplicaSet alone is a new rollout even with the same tag.
    h.store.add_child_controller(replica_set(
        &web,
        "bbb222",
        Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap(),
    ));
    h.reconcile(&key).await;
    assert_eq!(h.sink.phases(), vec![AnnotationPhase::Started]);
    assert_eq!(
        h.annotation(&key, VERSION_KEY).as_deref(),
        Some("hash-bbb222-img-1.0")
    );
}

#[tokio::test]
async fn failed_region_conversion_keeps_completion() {
    let h = Harness::new();
    tracked_namespace(&h.store, "shop");
    let key = WorkloadKey::new(WorkloadKind::Deployment, "shop", "svc");

    h.store.upsert_workload(deployment("shop", "svc", "svc:1.0"));
    h.reconcile(&key).await;
    let current = h.store.workload(&key).expect("workload");
    h.store.upsert_workload(rolling(current, "svc:2.0"));
    h.reconcile(&key).await;

    h.sink.fail_regions(true);
    let current = h.store.workload(&key).expect("workload");
    h.store.upsert_workload(settled(current));
    assert_eq!(h.reconcile(&key).await, ReconcileOutcome::Done);
    assert!(h.sink.regions().is_empty());
    assert!(h.annotation(&key, END_ANNOTATION_KEY).is_some());
}

#[tokio::test]
async fn persistent_conflicts_requeue() {
    let h = Harness::new();
    tracked_namespace(&h.store, "shop");
    let key = WorkloadKey::new(WorkloadKind::Deployment, "shop", "svc");
    h.store.upsert_workload(deployment("shop", "svc", "svc:1.0"));

    h.store.inject_conflicts(16);
    assert_eq!(
        h.reconcile(&key).await,
        ReconcileOutcome::RequeueAfter(Duration::from_secs(60))
    );
    assert_eq!(h.annotation(&key, VERSION_KEY), None);
}

#[tokio::test]
async fn lost_state_write_reemits_start_on_retry() {
    let h = Harness::new();
    tracked_namespace(&h.store, "shop");
    let key = WorkloadKey::new(WorkloadKind::Deployment, "shop", "svc");
    h.store.upsert_workload(deployment("shop", "svc", "svc:1.0"));
    h.reconcile(&key).await;

    let current = h.store.workload(&key).expect("workload");
    h.store.upsert_workload(rolling(current, "svc:2.0"));
    h.store.fail_patches(1);
    assert_eq!(
        h.reconcile(&key).await,
        ReconcileOutcome::RequeueAfter(Duration::from_secs(60))
    );
    assert_eq!(h.sink.phases(), vec![AnnotationPhase::Started]);
    assert_eq!(h.annotation(&key, START_ANNOTATION_KEY), None);

    // The retry cannot know the first marker exists and writes a second one.
    assert_eq!(h.reconcile(&key).await, ReconcileOutcome::Done);
    assert_eq!(
        h.sink.phases(),
        vec![AnnotationPhase::Started, AnnotationPhase::Started]
    );
    let (second_id, _) = h.sink.created()[1].clone();
    assert_eq!(h.annotation(&key, START_ANNOTATION_KEY), Some(second_id.to_string()));
    assert_eq!(h.annotation(&key, VERSION_KEY).as_deref(), Some("gen-2-img-2.0"));
}

#[tokio::test]
async fn unparseable_start_id_still_completes() {
    let h = Harness::new();
    tracked_namespace(&h.store, "shop");
    let key = WorkloadKey::new(WorkloadKind::Deployment, "shop", "svc");
    h.store.upsert_workload(deployment("shop", "svc", "svc:1.0"));
    h.reconcile(&key).await;
    let current = h.store.workload(&key).expect("workload");
    h.store.upsert_workload(rolling(current, "svc:2.0"));
    h.reconcile(&key).await;

    let mut current = h.store.workload(&key).expect("workload");
    current
        .annotations
        .insert(START_ANNOTATION_KEY.to_string(), "garbage".to_string());
    h.store.upsert_workload(settled(current));

    assert_eq!(h.reconcile(&key).await, ReconcileOutcome::Done);
    assert_eq!(
        h.sink.phases(),
        vec![AnnotationPhase::Started, AnnotationPhase::Completed]
    );
    let (end_id, _) = h.sink.created()[1].clone();
    assert_eq!(h.annotation(&key, END_ANNOTATION_KEY), Some(end_id.to_string()));
    assert_eq!(h.annotation(&key, START_ANNOTATION_KEY).as_deref(), Some("garbage"));
    assert!(h.sink.regions().is_empty());
}

#[tokio::test]
async fn superseded_rollout_leaves_old_start_untouched() {
    let h = Harness::new();
    tracked_namespace(&h.store, "shop");
    let key = WorkloadKey::new(WorkloadKind::Deployment, "shop", "svc");
    h.store.upsert_workload(deployment("shop", "svc", "svc:1.0"));
    h.reconcile(&key).await;

    let current = h.store.workload(&key).expect("workload");
    h.store.upsert_workload(rolling(current, "svc:2.0"));
    h.reconcile(&key).await;
    let (abandoned_id, abandoned) = h.sink.created()[0].clone();

    // svc:3.0 lands before svc:2.0 ever became ready.
    let current = h.store.workload(&key).expect("workload");
    h.store.upsert_workload(rolling(current, "svc:3.0"));
    assert_eq!(h.reconcile(&key).await, ReconcileOutcome::Done);
    let (restart_id, restart) = h.sink.created()[1].clone();
    assert_ne!(restart_id, abandoned_id);
    assert_eq!(restart.body, "Started deployment svc:3.0");
    assert_eq!(h.annotation(&key, START_ANNOTATION_KEY), Some(restart_id.to_string()));
    assert_eq!(h.annotation(&key, END_ANNOTATION_KEY), None);
    assert!(h.sink.regions().is_empty());

    let current = h.store.workload(&key).expect("workload");
    h.store.upsert_workload(settled(current));
    assert_eq!(h.reconcile(&key).await, ReconcileOutcome::Done);
    assert_eq!(
        h.sink.phases(),
        vec![
            AnnotationPhase::Started,
            AnnotationPhase::Started,
            AnnotationPhase::Completed
        ]
    );
    let regions = h.sink.regions();
    assert_eq!(regions.len(), 1);
    assert_eq!(regions[0].id, restart_id);
    assert_eq!(h.sink.created()[0], (abandoned_id, abandoned));
}
