/*
 * Copyright (C) 2024 The Annotator Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Fixture builders shared by unit and integration tests.
#![allow(dead_code)]

use crate::annotator::controller::tracking::{TRACKING_ENABLED_VALUE, TRACKING_LABEL};
use crate::annotator::k8s::{
    ChildControllerSnapshot, OwnerReference, WorkloadKey, WorkloadKind, WorkloadSnapshot,
    TEMPLATE_HASH_LABEL,
};
use crate::annotator::store::memory::InMemoryMetadataStore;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// A settled workload at generation 1 with three of three replicas ready.
pub fn workload(kind: WorkloadKind, namespace: &str, name: &str, image: &str) -> WorkloadSnapshot {
    let mut snapshot = WorkloadSnapshot::new(WorkloadKey::new(kind, namespace, name));
    snapshot.uid = Some(format!("uid-{namespace}-{name}"));
    snapshot.generation = 1;
    snapshot.observed_generation = 1;
    snapshot.desired_replicas = 3;
    snapshot.ready_replicas = 3;
    snapshot.image = Some(image.to_string());
    snapshot
}

pub fn deployment(namespace: &str, name: &str, image: &str) -> WorkloadSnapshot {
    workload(WorkloadKind::Deployment, namespace, name, image)
}

pub fn statefulset(namespace: &str, name: &str, image: &str) -> WorkloadSnapshot {
    workload(WorkloadKind::StatefulSet, namespace, name, image)
}

pub fn daemonset(namespace: &str, name: &str, image: &str) -> WorkloadSnapshot {
    workload(WorkloadKind::DaemonSet, namespace, name, image)
}

/// Marks the snapshot as mid-rollout: a new generation nobody has observed.
pub fn rolling(mut snapshot: WorkloadSnapshot, image: &str) -> WorkloadSnapshot {
    snapshot.generation += 1;
    snapshot.ready_replicas = 0;
    snapshot.image = Some(image.to_string());
    snapshot
}

/// Marks the snapshot as settled on its current generation.
pub fn settled(mut snapshot: WorkloadSnapshot) -> WorkloadSnapshot {
    snapshot.observed_generation = snapshot.generation;
    snapshot.ready_replicas = snapshot.desired_replicas;
    snapshot
}

pub fn tracking_labels() -> BTreeMap<String, String> {
    BTreeMap::from([(
        TRACKING_LABEL.to_string(),
        TRACKING_ENABLED_VALUE.to_string(),
    )])
}

pub fn tracked_namespace(store: &InMemoryMetadataStore, namespace: &str) {
    store.set_namespace_labels(namespace, tracking_labels());
}

pub fn untracked_namespace(store: &InMemoryMetadataStore, namespace: &str) {
    store.set_namespace_labels(namespace, BTreeMap::new());
}

/// A ReplicaSet controlled by `owner` carrying the given template hash.
pub fn replica_set(
    owner: &WorkloadSnapshot,
    hash: &str,
    created_at: DateTime<Utc>,
) -> ChildControllerSnapshot {
    ChildControllerSnapshot {
        namespace: owner.namespace().to_string(),
        name: format!("{}-{hash}", owner.name()),
        created_at: Some(created_at),
        labels: BTreeMap::from([(TEMPLATE_HASH_LABEL.to_string(), hash.to_string())]),
        owners: vec![OwnerReference {
            api_version: "apps/v1".to_string(),
            kind: "Deployment".to_string(),
            name: owner.name().to_string(),
            uid: owner.uid.clone().unwrap_or_default(),
            controller: true,
        }],
    }
}
