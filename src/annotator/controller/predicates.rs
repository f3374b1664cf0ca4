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

//! Change-detection predicates deciding whether an event should trigger a
//! reconciliation. Metadata-only updates, including the annotator's own
//! patches, never trigger.

use super::tracking::{is_tracked, TrackingTransition};
use crate::annotator::k8s::WorkloadSnapshot;
use std::collections::BTreeMap;

/// Update predicate for workloads: spec-relevant fields or status fields that
/// feed readiness must differ.
pub fn workload_changed(old: &WorkloadSnapshot, new: &WorkloadSnapshot) -> bool {
    old.generation != new.generation
        || old.image != new.image
        || old.observed_generation != new.observed_generation
        || old.desired_replicas != new.desired_replicas
        || old.ready_replicas != new.ready_replicas
}

/// Namespace predicate. `old` is `None` for a namespace seen for the first
/// time, which triggers only when it arrives already enabled.
pub fn tracking_transition(
    old: Option<&BTreeMap<String, String>>,
    new: &BTreeMap<String, String>,
) -> Option<TrackingTransition> {
    let now_tracked = is_tracked(Some(new));
    match old {
        None if now_tracked => Some(TrackingTransition::Enabled),
        None => None,
        Some(old) => match (is_tracked(Some(old)), now_tracked) {
            (false, true) => Some(TrackingTransition::Enabled),
            (true, false) => Some(TrackingTransition::Disabled),
            _ => None,
        },
    }
}
