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

use crate::annotator::k8s::{
    ChildControllerSnapshot, NamespaceSnapshot, OwnerReference, WorkloadKey, WorkloadKind,
    WorkloadSnapshot,
};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::core::v1::{Namespace, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::NamespaceResourceScope;
use kube::Resource;
use serde::de::DeserializeOwned;
use std::fmt::Debug;

/// Per-kind field mapping for the workload types the annotator watches.
/// Replica counts are `(desired, ready)`.
pub trait WorkloadResource:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Debug
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
    const KIND: WorkloadKind;

    fn replica_counts(&self) -> (i32, i32);

    fn observed_generation(&self) -> Option<i64>;

    fn pod_template(&self) -> Option<&PodTemplateSpec>;

    fn selector(&self) -> Option<&LabelSelector>;
}

impl WorkloadResource for Deployment {
    const KIND: WorkloadKind = WorkloadKind::Deployment;

    fn replica_counts(&self) -> (i32, i32) {
        self.status
            .as_ref()
            .map(|status| {
                (
                    status.replicas.unwrap_or(0),
                    status.ready_replicas.unwrap_or(0),
                )
            })
            .unwrap_or((0, 0))
    }

    fn observed_generation(&self) -> Option<i64> {
        self.status.as_ref().and_then(|status| status.observed_generation)
    }

    fn pod_template(&self) -> Option<&PodTemplateSpec> {
        self.spec.as_ref().map(|spec| &spec.template)
    }

    fn selector(&self) -> Option<&LabelSelector> {
        self.spec.as_ref().map(|spec| &spec.selector)
    }
}

impl WorkloadResource for StatefulSet {
    const KIND: WorkloadKind = WorkloadKind::StatefulSet;

    fn replica_counts(&self) -> (i32, i32) {
        self.status
            .as_ref()
            .map(|status| (status.replicas, status.ready_replicas.unwrap_or(0)))
            .unwrap_or((0, 0))
    }

    fn observed_generation(&self) -> Option<i64> {
        self.status.as_ref().and_then(|status| status.observed_generation)
    }

    fn pod_template(&self) -> Option<&PodTemplateSpec> {
        self.spec.as_ref().map(|spec| &spec.template)
    }

    fn selector(&self) -> Option<&LabelSelector> {
        self.spec.as_ref().map(|spec| &spec.selector)
    }
}

impl WorkloadResource for DaemonSet {
    const KIND: WorkloadKind = WorkloadKind::DaemonSet;

    fn replica_counts(&self) -> (i32, i32) {
        self.status
            .as_ref()
            .map(|status| {
                (
                    status.desired_number_scheduled,
                    status.number_available.unwrap_or(0),
                )
            })
            .unwrap_or((0, 0))
    }

    fn observed_generation(&self) -> Option<i64> {
        self.status.as_ref().and_then(|status| status.observed_generation)
    }

    fn pod_template(&self) -> Option<&PodTemplateSpec> {
        self.spec.as_ref().map(|spec| &spec.template)
    }

    fn selector(&self) -> Option<&LabelSelector> {
        self.spec.as_ref().map(|spec| &spec.selector)
    }
}

/// Maps a typed workload onto a snapshot. Objects without a namespace or
/// name cannot be addressed and yield `None`.
pub fn workload_snapshot<R: WorkloadResource>(resource: &R) -> Option<WorkloadSnapshot> {
    let meta = resource.meta();
    let namespace = meta.namespace.as_deref()?;
    let name = meta.name.as_deref()?;

    let mut snapshot = WorkloadSnapshot::new(WorkloadKey::new(R::KIND, namespace, name));
    snapshot.uid = meta.uid.clone();
    snapshot.resource_version = meta.resource_version.clone();
    snapshot.generation = meta.generation.unwrap_or(0);
    snapshot.observed_generation = resource.observed_generation().unwrap_or(0);
    let (desired, ready) = resource.replica_counts();
    snapshot.desired_replicas = desired;
    snapshot.ready_replicas = ready;
    snapshot.image = resource
        .pod_template()
        .and_then(|template| template.spec.as_ref())
        .and_then(|spec| spec.containers.first())
        .and_then(|container| container.image.clone())
        .filter(|image| !image.is_empty());
    snapshot.annotations = meta.annotations.clone().unwrap_or_default();
    Some(snapshot)
}

pub fn child_snapshot(replica_set: &ReplicaSet) -> Option<ChildControllerSnapshot> {
    let meta = &replica_set.metadata;
    Some(ChildControllerSnapshot {
        namespace: meta.namespace.clone()?,
        name: meta.name.clone()?,
        created_at: meta.creation_timestamp.as_ref().map(|time| time.0),
        labels: meta.labels.clone().unwrap_or_default(),
        owners: meta
            .owner_references
            .iter()
            .flatten()
            .map(|owner| OwnerReference {
                api_version: owner.api_version.clone(),
                kind: owner.kind.clone(),
                name: owner.name.clone(),
                uid: owner.uid.clone(),
                controller: owner.controller.unwrap_or(false),
            })
            .collect(),
    })
}

pub fn namespace_snapshot(namespace: &Namespace) -> Option<NamespaceSnapshot> {
    let meta = &namespace.metadata;
    Some(NamespaceSnapshot {
        name: meta.name.clone()?,
        labels: meta.labels.clone().unwrap_or_default(),
    })
}

/// Renders `matchLabels` as a label selector string. Expressions are not
/// supported; an empty result means "select nothing".
pub fn selector_string(selector: &LabelSelector) -> String {
    selector
        .match_labels
        .iter()
        .flatten()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join(",")
}
