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

//! Namespace opt-in gate and the fan-out run when the opt-in flips.

use crate::annotator::k8s::{WorkloadKey, WorkloadKind};
use crate::annotator::store::{apply_state_change, MetadataStore, StateChange, StoreError};
use std::collections::BTreeMap;

/// Namespace label that opts workloads into annotation.
pub const TRACKING_LABEL: &str = "deployment-annotator";
pub const TRACKING_ENABLED_VALUE: &str = "enabled";

/// A namespace is tracked only when it carries the label with exactly the
/// enabled value.
pub fn is_tracked(labels: Option<&BTreeMap<String, String>>) -> bool {
    labels
        .and_then(|labels| labels.get(TRACKING_LABEL))
        .map(|value| value == TRACKING_ENABLED_VALUE)
        .unwrap_or(false)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrackingTransition {
    Enabled,
    Disabled,
}

/// Workloads of `kind` in `namespace` that must be re-observed after the
/// namespace's tracking flag flipped. Enabling lets each run its first
/// sighting; disabling lets each clear its persisted keys.
pub async fn fan_out(
    store: &dyn MetadataStore,
    kind: WorkloadKind,
    namespace: &str,
) -> Result<Vec<WorkloadKey>, StoreError> {
    Ok(store
        .list(kind, namespace)
        .await?
        .into_iter()
        .map(|snapshot| snapshot.key)
        .collect())
}

/// Removes all three persisted keys from the workload. Returns `Ok(false)`
/// when none were present.
pub async fn clear_persisted_state(
    store: &dyn MetadataStore,
    key: &WorkloadKey,
) -> Result<bool, StoreError> {
    apply_state_change(store, key, &StateChange::clear_all()).await
}
