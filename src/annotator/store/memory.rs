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

//! In-process [`MetadataStore`] used by tests and dry runs.

use super::{MetadataPatch, MetadataStore, StoreError, StoreFuture};
use crate::annotator::k8s::{ChildControllerSnapshot, WorkloadKey, WorkloadKind, WorkloadSnapshot};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

#[derive(Default)]
struct StoreState {
    workloads: HashMap<WorkloadKey, WorkloadSnapshot>,
    children: Vec<ChildControllerSnapshot>,
    namespaces: HashMap<String, BTreeMap<String, String>>,
    next_resource_version: u64,
    pending_conflicts: usize,
    failing_patches: usize,
    failing_namespace_reads: bool,
    patches: Vec<(WorkloadKey, MetadataPatch)>,
}

impl StoreState {
    fn bump_resource_version(&mut self) -> String {
        self.next_resource_version += 1;
        self.next_resource_version.to_string()
    }
}

/// Map-backed store with resource-version preconditions and fault injection.
#[derive(Default)]
pub struct InMemoryMetadataStore {
    state: Mutex<StoreState>,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Inserts or replaces a workload, stamping a fresh resource version.
    /// Annotations already stored for the workload are preserved when the
    /// incoming snapshot carries none, mirroring a spec-only update.
    pub fn upsert_workload(&self, mut snapshot: WorkloadSnapshot) -> WorkloadSnapshot {
        let mut state = self.lock();
        if snapshot.annotations.is_empty() {
            if let Some(existing) = state.workloads.get(&snapshot.key) {
                snapshot.annotations = existing.annotations.clone();
            }
        }
        snapshot.resource_version = Some(state.bump_resource_version());
        state
            .workloads
            .insert(snapshot.key.clone(), snapshot.clone());
        snapshot
    }

    pub fn remove_workload(&self, key: &WorkloadKey) -> Option<WorkloadSnapshot> {
        self.lock().workloads.remove(key)
    }

    pub fn workload(&self, key: &WorkloadKey) -> Option<WorkloadSnapshot> {
        self.lock().workloads.get(key).cloned()
    }

    pub fn annotations(&self, key: &WorkloadKey) -> Option<BTreeMap<String, String>> {
        self.lock()
            .workloads
            .get(key)
            .map(|snapshot| snapshot.annotations.clone())
    }

    pub fn add_child_controller(&self, child: ChildControllerSnapshot) {
        let mut state = self.lock();
        state
            .children
            .retain(|existing| !(existing.namespace == child.namespace && existing.name == child.name));
        state.children.push(child);
    }

    pub fn set_namespace_labels(&self, namespace: &str, labels: BTreeMap<String, String>) {
        self.lock().namespaces.insert(namespace.to_string(), labels);
    }

    pub fn remove_namespace(&self, namespace: &str) {
        self.lock().namespaces.remove(namespace);
    }

    /// The next `count` patches fail with [`StoreError::Conflict`].
    pub fn inject_conflicts(&self, count: usize) {
        self.lock().pending_conflicts = count;
    }

    /// The next `count` patches fail with a backend error.
    pub fn fail_patches(&self, count: usize) {
        self.lock().failing_patches = count;
    }

    pub fn fail_namespace_reads(&self, failing: bool) {
        self.lock().failing_namespace_reads = failing;
    }

    /// Number of patches that were applied.
    pub fn patch_count(&self) -> usize {
        self.lock().patches.len()
    }

    pub fn applied_patches(&self) -> Vec<(WorkloadKey, MetadataPatch)> {
        self.lock().patches.clone()
    }

    fn apply_patch(&self, key: &WorkloadKey, patch: &MetadataPatch) -> Result<(), StoreError> {
        let mut state = self.lock();
        if state.pending_conflicts > 0 {
            state.pending_conflicts -= 1;
            return Err(StoreError::Conflict);
        }
        if state.failing_patches > 0 {
            state.failing_patches -= 1;
            return Err(StoreError::backend("injected patch failure"));
        }

        let resource_version = state.bump_resource_version();
        let snapshot = state.workloads.get_mut(key).ok_or(StoreError::NotFound)?;
        if let Some(expected) = patch.resource_version.as_deref() {
            if snapshot.resource_version.as_deref() != Some(expected) {
                return Err(StoreError::Conflict);
            }
        }
        patch.apply_to(&mut snapshot.annotations);
        snapshot.resource_version = Some(resource_version);
        state.patches.push((key.clone(), patch.clone()));
        Ok(())
    }
}

impl MetadataStore for InMemoryMetadataStore {
    fn get<'a>(&'a self, key: &'a WorkloadKey) -> StoreFuture<'a, Option<WorkloadSnapshot>> {
        Box::pin(async move { Ok(self.workload(key)) })
    }

    fn list<'a>(
        &'a self,
        kind: WorkloadKind,
        namespace: &'a str,
    ) -> StoreFuture<'a, Vec<WorkloadSnapshot>> {
        Box::pin(async move {
            let state = self.lock();
            let mut workloads: Vec<WorkloadSnapshot> = state
                .workloads
                .values()
                .filter(|snapshot| snapshot.kind() == kind && snapshot.namespace() == namespace)
                .cloned()
                .collect();
            workloads.sort_by(|a, b| a.key.cmp(&b.key));
            Ok(workloads)
        })
    }

    fn child_controllers<'a>(
        &'a self,
        workload: &'a WorkloadSnapshot,
    ) -> StoreFuture<'a, Vec<ChildControllerSnapshot>> {
        Box::pin(async move {
            let state = self.lock();
            Ok(state
                .children
                .iter()
                .filter(|child| child.namespace == workload.namespace())
                .cloned()
                .collect())
        })
    }

    fn namespace_labels<'a>(
        &'a self,
        namespace: &'a str,
    ) -> StoreFuture<'a, Option<BTreeMap<String, String>>> {
        Box::pin(async move {
            let state = self.lock();
            if state.failing_namespace_reads {
                return Err(StoreError::backend("injected namespace read failure"));
            }
            Ok(state.namespaces.get(namespace).cloned())
        })
    }

    fn patch<'a>(&'a self, key: &'a WorkloadKey, patch: &'a MetadataPatch) -> StoreFuture<'a, ()> {
        Box::pin(async move { self.apply_patch(key, patch) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stale_resource_version_conflicts() {
        let store = InMemoryMetadataStore::new();
        let key = WorkloadKey::new(WorkloadKind::DaemonSet, "infra", "agent");
        let stored = store.upsert_workload(WorkloadSnapshot::new(key.clone()));

        store.upsert_workload(WorkloadSnapshot::new(key.clone()));

        let mut patch = MetadataPatch::default().with_resource_version(stored.resource_version);
        patch
            .entries
            .insert("example.com/k".to_string(), Some("v".to_string()));
        let err = store.patch(&key, &patch).await.expect_err("stale write");
        assert!(matches!(err, StoreError::Conflict));
        assert_eq!(store.patch_count(), 0);
    }

    #[tokio::test]
    async fn list_filters_by_kind_and_namespace() {
        let store = InMemoryMetadataStore::new();
        store.upsert_workload(WorkloadSnapshot::new(WorkloadKey::new(
            WorkloadKind::Deployment,
            "shop",
            "web",
        )));
        store.upsert_workload(WorkloadSnapshot::new(WorkloadKey::new(
            WorkloadKind::StatefulSet,
            "shop",
            "db",
        )));
        store.upsert_workload(WorkloadSnapshot::new(WorkloadKey::new(
            WorkloadKind::Deployment,
            "other",
            "api",
        )));

        let listed = store.list(WorkloadKind::Deployment, "shop").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name(), "web");
    }
}
