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

//! Access to the workload's own metadata, the only shared mutable state the
//! annotator touches.

pub mod memory;
pub mod state;

pub use state::{MetadataPatch, PersistedState, StateChange};

use crate::annotator::k8s::{ChildControllerSnapshot, WorkloadKey, WorkloadKind, WorkloadSnapshot};
use crate::annotator::logger::log_debug;
use crate::annotator::observability::metrics;
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

const COMPONENT: &str = "metadata-store";

/// Bound on optimistic-concurrency retries for a single state change.
pub const MAX_CONFLICT_RETRIES: usize = 5;

pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

#[derive(Debug)]
pub enum StoreError {
    /// The resource version precondition no longer matches.
    Conflict,
    NotFound,
    /// The API call did not finish within the configured bound.
    Timeout(Duration),
    RetriesExhausted { attempts: usize },
    Backend(Box<dyn Error + Send + Sync>),
}

impl StoreError {
    pub fn backend(error: impl Into<Box<dyn Error + Send + Sync>>) -> Self {
        StoreError::Backend(error.into())
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Conflict => write!(f, "metadata changed concurrently"),
            StoreError::NotFound => write!(f, "object not found"),
            StoreError::Timeout(after) => {
                write!(f, "metadata request timed out after {}s", after.as_secs())
            }
            StoreError::RetriesExhausted { attempts } => {
                write!(f, "metadata patch still conflicting after {attempts} attempts")
            }
            StoreError::Backend(err) => write!(f, "metadata store error: {err}"),
        }
    }
}

impl Error for StoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            StoreError::Backend(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

/// Read and partial-write access to workloads and their surroundings.
pub trait MetadataStore: Send + Sync {
    /// Fetches a workload; `Ok(None)` when it no longer exists.
    fn get<'a>(&'a self, key: &'a WorkloadKey) -> StoreFuture<'a, Option<WorkloadSnapshot>>;

    /// Lists workloads of `kind` in `namespace`.
    fn list<'a>(
        &'a self,
        kind: WorkloadKind,
        namespace: &'a str,
    ) -> StoreFuture<'a, Vec<WorkloadSnapshot>>;

    /// Child controllers in the workload's namespace matching its selector.
    /// Ownership is not filtered here.
    fn child_controllers<'a>(
        &'a self,
        workload: &'a WorkloadSnapshot,
    ) -> StoreFuture<'a, Vec<ChildControllerSnapshot>>;

    /// Labels of `namespace`; `Ok(None)` when the namespace does not exist.
    fn namespace_labels<'a>(
        &'a self,
        namespace: &'a str,
    ) -> StoreFuture<'a, Option<BTreeMap<String, String>>>;

    /// Applies a merge patch to the workload's annotations, honouring the
    /// patch's resource version precondition.
    fn patch<'a>(&'a self, key: &'a WorkloadKey, patch: &'a MetadataPatch) -> StoreFuture<'a, ()>;
}

/// Merges `change` into the workload's persisted keys using read, merge,
/// conditional write, retrying on conflict up to [`MAX_CONFLICT_RETRIES`].
///
/// Returns `Ok(false)` when nothing needed writing.
pub async fn apply_state_change(
    store: &dyn MetadataStore,
    key: &WorkloadKey,
    change: &StateChange,
) -> Result<bool, StoreError> {
    if change.is_empty() {
        return Ok(false);
    }

    let key_label = key.to_string();
    for attempt in 1..=MAX_CONFLICT_RETRIES {
        let current = store.get(key).await?.ok_or(StoreError::NotFound)?;
        let patch = change
            .pending_against(&current.annotations)
            .with_resource_version(current.resource_version.clone());
        if patch.is_empty() {
            return Ok(false);
        }

        match store.patch(key, &patch).await {
            Ok(()) => return Ok(true),
            Err(StoreError::Conflict) => {
                metrics::record_metadata_patch_conflict(key.kind.marker());
                let attempt_label = attempt.to_string();
                log_debug(
                    COMPONENT,
                    "Metadata patch conflicted; re-reading workload",
                    &[("workload", key_label.as_str()), ("attempt", attempt_label.as_str())],
                );
            }
            Err(err) => return Err(err),
        }
    }

    Err(StoreError::RetriesExhausted {
        attempts: MAX_CONFLICT_RETRIES,
    })
}
