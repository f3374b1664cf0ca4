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

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Label carried by ReplicaSets that identifies the pod template revision.
pub const TEMPLATE_HASH_LABEL: &str = "pod-template-hash";

const APPS_API_VERSION: &str = "apps/v1";

/// Workload kinds the annotator tracks. Each kind runs as an independent
/// processing stream sharing one lifecycle state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum WorkloadKind {
    Deployment,
    StatefulSet,
    DaemonSet,
}

impl WorkloadKind {
    pub const ALL: [WorkloadKind; 3] = [
        WorkloadKind::Deployment,
        WorkloadKind::StatefulSet,
        WorkloadKind::DaemonSet,
    ];

    /// Kubernetes `kind` string.
    pub fn as_str(self) -> &'static str {
        match self {
            WorkloadKind::Deployment => "Deployment",
            WorkloadKind::StatefulSet => "StatefulSet",
            WorkloadKind::DaemonSet => "DaemonSet",
        }
    }

    /// Lowercase marker appended to annotation tags and used as metric label.
    pub fn marker(self) -> &'static str {
        match self {
            WorkloadKind::Deployment => "deployment",
            WorkloadKind::StatefulSet => "statefulset",
            WorkloadKind::DaemonSet => "daemonset",
        }
    }

    /// Deployments roll out through owned ReplicaSets whose template hash is a
    /// sharper version signal than the generation counter.
    pub fn uses_child_controllers(self) -> bool {
        matches!(self, WorkloadKind::Deployment)
    }

    /// Parses a kind from user input, accepting singular or plural and any case.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "deployment" | "deployments" | "deploy" => Some(WorkloadKind::Deployment),
            "statefulset" | "statefulsets" | "sts" => Some(WorkloadKind::StatefulSet),
            "daemonset" | "daemonsets" | "ds" => Some(WorkloadKind::DaemonSet),
            _ => None,
        }
    }
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a workload; the unit of exclusivity in the work queue.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkloadKey {
    pub kind: WorkloadKind,
    pub namespace: String,
    pub name: String,
}

impl WorkloadKey {
    pub fn new(kind: WorkloadKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for WorkloadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

/// Point-in-time view of a workload with the replica fields of its kind
/// already mapped onto the shared desired/ready model.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkloadSnapshot {
    pub key: WorkloadKey,
    pub uid: Option<String>,
    pub resource_version: Option<String>,
    pub generation: i64,
    pub observed_generation: i64,
    pub desired_replicas: i32,
    pub ready_replicas: i32,
    /// Image of the first container in the pod template.
    pub image: Option<String>,
    pub annotations: BTreeMap<String, String>,
}

impl WorkloadSnapshot {
    pub fn new(key: WorkloadKey) -> Self {
        Self {
            key,
            uid: None,
            resource_version: None,
            generation: 0,
            observed_generation: 0,
            desired_replicas: 0,
            ready_replicas: 0,
            image: None,
            annotations: BTreeMap::new(),
        }
    }

    pub fn kind(&self) -> WorkloadKind {
        self.key.kind
    }

    pub fn namespace(&self) -> &str {
        &self.key.namespace
    }

    pub fn name(&self) -> &str {
        &self.key.name
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OwnerReference {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub uid: String,
    pub controller: bool,
}

/// ReplicaSet-style child controller owned by a workload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChildControllerSnapshot {
    pub namespace: String,
    pub name: String,
    pub created_at: Option<DateTime<Utc>>,
    pub labels: BTreeMap<String, String>,
    pub owners: Vec<OwnerReference>,
}

impl ChildControllerSnapshot {
    pub fn template_hash(&self) -> Option<&str> {
        self.labels
            .get(TEMPLATE_HASH_LABEL)
            .map(String::as_str)
            .filter(|hash| !hash.is_empty())
    }

    /// True when the controller reference points at `workload`, matched by
    /// UID when both sides carry one and by kind and name otherwise.
    pub fn is_owned_by(&self, workload: &WorkloadSnapshot) -> bool {
        if self.namespace != workload.namespace() {
            return false;
        }
        self.owners
            .iter()
            .filter(|owner| owner.controller)
            .any(|owner| match workload.uid.as_deref() {
                Some(uid) if !owner.uid.is_empty() => owner.uid == uid,
                _ => owner.kind == workload.kind().as_str() && owner.name == workload.name(),
            })
    }

    /// Resolves the Deployment this child belongs to from any `apps/v1`
    /// Deployment owner reference.
    pub fn controlling_deployment(&self) -> Option<WorkloadKey> {
        self.owners
            .iter()
            .find(|owner| {
                owner.kind == WorkloadKind::Deployment.as_str()
                    && owner.api_version == APPS_API_VERSION
            })
            .map(|owner| {
                WorkloadKey::new(WorkloadKind::Deployment, self.namespace.clone(), &owner.name)
            })
    }
}
