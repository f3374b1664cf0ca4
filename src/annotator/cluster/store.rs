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

//! [`MetadataStore`] backed by the Kubernetes API server.

use super::convert::{child_snapshot, selector_string, workload_snapshot, WorkloadResource};
use crate::annotator::k8s::{ChildControllerSnapshot, WorkloadKey, WorkloadKind, WorkloadSnapshot};
use crate::annotator::store::{MetadataPatch, MetadataStore, StoreError, StoreFuture};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::core::v1::Namespace;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::Client;
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

/// Store over the API server. Every request is bounded by `request_timeout`
/// independently of the client's read timeout, which the watch streams share.
#[derive(Clone)]
pub struct KubeMetadataStore {
    client: Client,
    request_timeout: Duration,
}

impl KubeMetadataStore {
    pub fn new(client: Client, request_timeout: Duration) -> Self {
        Self {
            client,
            request_timeout,
        }
    }

    async fn get_typed<R: WorkloadResource>(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<R>, StoreError> {
        let api: Api<R> = Api::namespaced(self.client.clone(), namespace);
        bounded(self.request_timeout, api.get_opt(name)).await
    }

    async fn get_snapshot<R: WorkloadResource>(
        &self,
        key: &WorkloadKey,
    ) -> Result<Option<WorkloadSnapshot>, StoreError> {
        Ok(self
            .get_typed::<R>(&key.namespace, &key.name)
            .await?
            .as_ref()
            .and_then(workload_snapshot))
    }

    async fn list_snapshots<R: WorkloadResource>(
        &self,
        namespace: &str,
    ) -> Result<Vec<WorkloadSnapshot>, StoreError> {
        let api: Api<R> = Api::namespaced(self.client.clone(), namespace);
        let list = bounded(self.request_timeout, api.list(&ListParams::default())).await?;
        Ok(list.items.iter().filter_map(workload_snapshot).collect())
    }

    async fn patch_typed<R: WorkloadResource>(
        &self,
        key: &WorkloadKey,
        patch: &MetadataPatch,
    ) -> Result<(), StoreError> {
        let api: Api<R> = Api::namespaced(self.client.clone(), &key.namespace);
        let params = PatchParams::default();
        let merge = Patch::Merge(patch.to_merge_json());
        bounded(self.request_timeout, api.patch(&key.name, &params, &merge))
            .await
            .map(|_| ())
    }
}

/// Runs one API call under `limit`, mapping its failure or expiry to a
/// [`StoreError`].
async fn bounded<T, F>(limit: Duration, call: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, kube::Error>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result.map_err(map_kube_error),
        Err(_) => Err(StoreError::Timeout(limit)),
    }
}

/// 409 and 404 responses become typed store errors; everything else is a
/// backend failure.
fn map_kube_error(error: kube::Error) -> StoreError {
    match error {
        kube::Error::Api(response) if response.code == 409 => StoreError::Conflict,
        kube::Error::Api(response) if response.code == 404 => StoreError::NotFound,
        other => StoreError::backend(other),
    }
}

impl MetadataStore for KubeMetadataStore {
    fn get<'a>(&'a self, key: &'a WorkloadKey) -> StoreFuture<'a, Option<WorkloadSnapshot>> {
        Box::pin(async move {
            match key.kind {
                WorkloadKind::Deployment => self.get_snapshot::<Deployment>(key).await,
                WorkloadKind::StatefulSet => self.get_snapshot::<StatefulSet>(key).await,
                WorkloadKind::DaemonSet => self.get_snapshot::<DaemonSet>(key).await,
            }
        })
    }

    fn list<'a>(
        &'a self,
        kind: WorkloadKind,
        namespace: &'a str,
    ) -> StoreFuture<'a, Vec<WorkloadSnapshot>> {
        Box::pin(async move {
            match kind {
                WorkloadKind::Deployment => self.list_snapshots::<Deployment>(namespace).await,
                WorkloadKind::StatefulSet => self.list_snapshots::<StatefulSet>(namespace).await,
                WorkloadKind::DaemonSet => self.list_snapshots::<DaemonSet>(namespace).await,
            }
        })
    }

    fn child_controllers<'a>(
        &'a self,
        workload: &'a WorkloadSnapshot,
    ) -> StoreFuture<'a, Vec<ChildControllerSnapshot>> {
        Box::pin(async move {
            if !workload.kind().uses_child_controllers() {
                return Ok(Vec::new());
            }
            // The snapshot does not carry the selector; read it from the owner.
            let Some(deployment) = self
                .get_typed::<Deployment>(workload.namespace(), workload.name())
                .await?
            else {
                return Ok(Vec::new());
            };
            let selector = deployment
                .selector()
                .map(selector_string)
                .unwrap_or_default();
            if selector.is_empty() {
                return Ok(Vec::new());
            }

            let api: Api<ReplicaSet> = Api::namespaced(self.client.clone(), workload.namespace());
            let params = ListParams::default().labels(&selector);
            let list = bounded(self.request_timeout, api.list(&params)).await?;
            Ok(list.items.iter().filter_map(child_snapshot).collect())
        })
    }

    fn namespace_labels<'a>(
        &'a self,
        namespace: &'a str,
    ) -> StoreFuture<'a, Option<BTreeMap<String, String>>> {
        Box::pin(async move {
            let api: Api<Namespace> = Api::all(self.client.clone());
            let found = bounded(self.request_timeout, api.get_opt(namespace)).await?;
            Ok(found.map(|ns| ns.metadata.labels.unwrap_or_default()))
        })
    }

    fn patch<'a>(&'a self, key: &'a WorkloadKey, patch: &'a MetadataPatch) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            match key.kind {
                WorkloadKind::Deployment => self.patch_typed::<Deployment>(key, patch).await,
                WorkloadKind::StatefulSet => self.patch_typed::<StatefulSet>(key, patch).await,
                WorkloadKind::DaemonSet => self.patch_typed::<DaemonSet>(key, patch).await,
            }
        })
    }
}
