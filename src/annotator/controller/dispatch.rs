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

//! Turns watch events into work items. Only rollout-relevant changes reach
//! the queue; the annotator's own metadata patches are filtered out here.

use super::predicates::{tracking_transition, workload_changed};
use super::runtime::ControllerRuntime;
use super::tracking::{self, TrackingTransition};
use crate::annotator::k8s::{
    ChildControllerSnapshot, NamespaceSnapshot, WorkloadKey, WorkloadKind, WorkloadSnapshot,
};
use crate::annotator::logger::log_info;
use crate::annotator::store::{MetadataStore, StoreError};
use crate::annotator::util::sanitize_for_log;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

const COMPONENT: &str = "dispatcher";

/// Events a watch stream delivers. A relist is bracketed by `RelistStarted`
/// and `RelistDone`; objects missing from it were deleted while the stream
/// was down.
#[derive(Clone, Debug)]
pub enum WatchEvent<T> {
    Applied(T),
    Deleted(T),
    RelistStarted,
    RelistDone,
}

#[derive(Default)]
struct DispatchCache {
    workloads: HashMap<WorkloadKey, WorkloadSnapshot>,
    relist_seen: Option<HashSet<WorkloadKey>>,
    namespaces: HashMap<String, BTreeMap<String, String>>,
}

/// Per-kind trigger dispatcher.
pub struct Dispatcher {
    kind: WorkloadKind,
    runtime: Arc<ControllerRuntime>,
    store: Arc<dyn MetadataStore>,
    cache: Mutex<DispatchCache>,
}

impl Dispatcher {
    pub fn new(
        kind: WorkloadKind,
        runtime: Arc<ControllerRuntime>,
        store: Arc<dyn MetadataStore>,
    ) -> Self {
        Self {
            kind,
            runtime,
            store,
            cache: Mutex::new(DispatchCache::default()),
        }
    }

    pub fn kind(&self) -> WorkloadKind {
        self.kind
    }

    fn lock(&self) -> MutexGuard<'_, DispatchCache> {
        self.cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Handles a workload event; returns the keys that were enqueued.
    pub fn on_workload(&self, event: WatchEvent<WorkloadSnapshot>) -> Vec<WorkloadKey> {
        let mut triggered = Vec::new();
        {
            let mut cache = self.lock();
            match event {
                WatchEvent::Applied(snapshot) => {
                    if snapshot.kind() != self.kind {
                        return triggered;
                    }
                    let key = snapshot.key.clone();
                    if let Some(seen) = cache.relist_seen.as_mut() {
                        seen.insert(key.clone());
                    }
                    let changed = cache
                        .workloads
                        .get(&key)
                        .map(|previous| workload_changed(previous, &snapshot))
                        .unwrap_or(true);
                    cache.workloads.insert(key.clone(), snapshot);
                    if changed {
                        triggered.push(key);
                    }
                }
                WatchEvent::Deleted(snapshot) => {
                    if snapshot.kind() != self.kind {
                        return triggered;
                    }
                    cache.workloads.remove(&snapshot.key);
                    triggered.push(snapshot.key);
                }
                WatchEvent::RelistStarted => {
                    cache.relist_seen = Some(HashSet::new());
                }
                WatchEvent::RelistDone => {
                    if let Some(seen) = cache.relist_seen.take() {
                        let vanished: Vec<WorkloadKey> = cache
                            .workloads
                            .keys()
                            .filter(|key| !seen.contains(*key))
                            .cloned()
                            .collect();
                        for key in vanished {
                            cache.workloads.remove(&key);
                            triggered.push(key);
                        }
                    }
                }
            }
        }

        for key in &triggered {
            self.runtime.enqueue(key.clone());
        }
        triggered
    }

    /// Child controller changes re-trigger the owning Deployment.
    pub fn on_child(&self, event: WatchEvent<ChildControllerSnapshot>) -> Option<WorkloadKey> {
        if self.kind != WorkloadKind::Deployment {
            return None;
        }
        let child = match event {
            WatchEvent::Applied(child) | WatchEvent::Deleted(child) => child,
            WatchEvent::RelistStarted | WatchEvent::RelistDone => return None,
        };
        let owner = child.controlling_deployment()?;
        self.runtime.enqueue(owner.clone());
        Some(owner)
    }

    /// Handles a namespace event. When the tracking flag flips, every
    /// workload of this dispatcher's kind in the namespace is enqueued. The
    /// cached labels only advance once the fan-out succeeded, so a failed
    /// listing is retried by the next event for the namespace.
    pub async fn on_namespace(
        &self,
        event: WatchEvent<NamespaceSnapshot>,
    ) -> Result<Vec<WorkloadKey>, StoreError> {
        let namespace = match event {
            WatchEvent::Applied(namespace) => namespace,
            WatchEvent::Deleted(namespace) => {
                self.lock().namespaces.remove(&namespace.name);
                return Ok(Vec::new());
            }
            WatchEvent::RelistStarted | WatchEvent::RelistDone => return Ok(Vec::new()),
        };

        let transition = {
            let cache = self.lock();
            tracking_transition(cache.namespaces.get(&namespace.name), &namespace.labels)
        };

        let Some(transition) = transition else {
            self.lock()
                .namespaces
                .insert(namespace.name, namespace.labels);
            return Ok(Vec::new());
        };

        let keys = tracking::fan_out(self.store.as_ref(), self.kind, &namespace.name).await?;
        for key in &keys {
            self.runtime.enqueue(key.clone());
        }

        let name = sanitize_for_log(&namespace.name);
        let count = keys.len().to_string();
        log_info(
            COMPONENT,
            match transition {
                TrackingTransition::Enabled => "Namespace tracking enabled",
                TrackingTransition::Disabled => "Namespace tracking disabled",
            },
            &[
                ("namespace", name.as_str()),
                ("kind", self.kind.marker()),
                ("workloads", count.as_str()),
            ],
        );

        self.lock()
            .namespaces
            .insert(namespace.name, namespace.labels);
        Ok(keys)
    }
}
