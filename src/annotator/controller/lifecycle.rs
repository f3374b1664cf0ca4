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

//! Per-workload lifecycle state machine.
//!
//! [`decide`] is pure: it maps the persisted state and a fresh observation to
//! a [`LifecycleAction`]. [`apply`] performs that action against the
//! annotation sink and the metadata store. Intent is recomputed from scratch
//! on every call, so duplicate or reordered triggers are harmless.

use super::reconcile::ReconcileError;
use crate::annotator::annotation::{
    AnnotationId, AnnotationPhase, AnnotationRequest, AnnotationSink, RegionRequest,
};
use crate::annotator::k8s::WorkloadKey;
use crate::annotator::logger::{log_debug, log_info, log_warn};
use crate::annotator::observability::metrics::{self, OperationOutcome};
use crate::annotator::store::{apply_state_change, MetadataStore, PersistedState, StateChange};
use crate::annotator::util::sanitize_for_log;
use chrono::Utc;

const COMPONENT: &str = "lifecycle";

/// Facts gathered for one reconciliation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Observation {
    pub tracking_enabled: bool,
    pub workload_exists: bool,
    pub current_version: Option<String>,
    pub ready: bool,
}

impl Observation {
    pub fn deleted(tracking_enabled: bool) -> Self {
        Self {
            tracking_enabled,
            workload_exists: false,
            current_version: None,
            ready: false,
        }
    }

    pub fn untracked() -> Self {
        Self {
            tracking_enabled: false,
            workload_exists: true,
            current_version: None,
            ready: false,
        }
    }

    pub fn tracked(current_version: impl Into<String>, ready: bool) -> Self {
        Self {
            tracking_enabled: true,
            workload_exists: true,
            current_version: Some(current_version.into()),
            ready,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LifecycleAction {
    None,
    /// First sighting of a pre-existing workload: remember its version only.
    Initialize { version: String },
    /// New rollout with no start marker on record.
    Start { version: String },
    /// New rollout while the previous one never completed.
    Restart {
        version: String,
        superseded_start_id: String,
    },
    /// Rollout reached readiness.
    Complete,
    Delete,
    /// Namespace no longer tracked: drop the persisted keys.
    Untrack,
}

impl LifecycleAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleAction::None => "none",
            LifecycleAction::Initialize { .. } => "initialize",
            LifecycleAction::Start { .. } => "start",
            LifecycleAction::Restart { .. } => "restart",
            LifecycleAction::Complete => "complete",
            LifecycleAction::Delete => "delete",
            LifecycleAction::Untrack => "untrack",
        }
    }
}

/// Transition rules, first match wins:
///
/// 1. gone and tracked: delete marker
/// 2. tracking disabled: clear persisted keys
/// 3. no version on record: initialize silently
/// 4. version differs: start (or restart over an unfinished start)
/// 5. same version, ready, started but not completed: complete
pub fn decide(state: &PersistedState, observation: &Observation) -> LifecycleAction {
    if !observation.workload_exists {
        return if observation.tracking_enabled {
            LifecycleAction::Delete
        } else {
            LifecycleAction::None
        };
    }

    if !observation.tracking_enabled {
        return if state.is_empty() {
            LifecycleAction::None
        } else {
            LifecycleAction::Untrack
        };
    }

    let Some(current) = observation.current_version.as_deref() else {
        return LifecycleAction::None;
    };

    match (state.version.as_deref(), state.start_annotation_id.as_deref()) {
        (None, _) => LifecycleAction::Initialize {
            version: current.to_string(),
        },
        (Some(recorded), None) if recorded != current => LifecycleAction::Start {
            version: current.to_string(),
        },
        (Some(recorded), Some(start)) if recorded != current => LifecycleAction::Restart {
            version: current.to_string(),
            superseded_start_id: start.to_string(),
        },
        (Some(_), Some(_)) if observation.ready && state.end_annotation_id.is_none() => {
            LifecycleAction::Complete
        }
        _ => LifecycleAction::None,
    }
}

/// The workload an action applies to.
#[derive(Clone, Copy, Debug)]
pub struct Subject<'a> {
    pub key: &'a WorkloadKey,
    pub image: Option<&'a str>,
    pub image_tag: Option<&'a str>,
}

/// Collaborators an action may touch.
#[derive(Clone, Copy)]
pub struct Effects<'a> {
    pub sink: &'a dyn AnnotationSink,
    pub store: &'a dyn MetadataStore,
}

/// Executes `action`. Sink and store failures are returned for the caller to
/// reschedule; the region conversion after a completion is best effort.
pub async fn apply(
    action: &LifecycleAction,
    state: &PersistedState,
    subject: Subject<'_>,
    effects: Effects<'_>,
) -> Result<(), ReconcileError> {
    let workload = sanitize_for_log(&subject.key.to_string());
    match action {
        LifecycleAction::None => Ok(()),
        LifecycleAction::Initialize { version } => {
            apply_state_change(effects.store, subject.key, &StateChange::new().set_version(version))
                .await?;
            let safe_version = sanitize_for_log(version);
            log_info(
                COMPONENT,
                "Tracking workload from its current version",
                &[("workload", workload.as_str()), ("version", safe_version.as_str())],
            );
            Ok(())
        }
        LifecycleAction::Start { version } => {
            let id = emit(AnnotationPhase::Started, subject, effects).await?;
            let change = StateChange::new()
                .set_version(version)
                .set_start_id(id)
                .clear_end_id();
            persist_after_emit(effects, subject, &change, id).await
        }
        LifecycleAction::Restart {
            version,
            superseded_start_id,
        } => {
            log_info(
                COMPONENT,
                "New rollout before the previous one completed",
                &[
                    ("workload", workload.as_str()),
                    ("superseded_start_id", superseded_start_id.as_str()),
                ],
            );
            let id = emit(AnnotationPhase::Started, subject, effects).await?;
            let change = StateChange::new()
                .set_version(version)
                .set_start_id(id)
                .clear_end_id();
            persist_after_emit(effects, subject, &change, id).await
        }
        LifecycleAction::Complete => {
            let id = emit(AnnotationPhase::Completed, subject, effects).await?;
            persist_after_emit(effects, subject, &StateChange::new().set_end_id(id), id).await?;
            convert_start_to_region(state, subject, effects).await;
            Ok(())
        }
        LifecycleAction::Delete => {
            emit(AnnotationPhase::Deleted, subject, effects).await?;
            Ok(())
        }
        LifecycleAction::Untrack => {
            if super::tracking::clear_persisted_state(effects.store, subject.key).await? {
                log_info(
                    COMPONENT,
                    "Cleared annotator state after tracking was disabled",
                    &[("workload", workload.as_str())],
                );
            }
            Ok(())
        }
    }
}

async fn emit(
    phase: AnnotationPhase,
    subject: Subject<'_>,
    effects: Effects<'_>,
) -> Result<AnnotationId, ReconcileError> {
    let (image, image_tag) = match phase {
        AnnotationPhase::Deleted => (None, None),
        _ => (subject.image, subject.image_tag),
    };
    let request = AnnotationRequest::for_workload(phase, subject.key, image, image_tag, Utc::now());
    let kind = subject.key.kind.marker();
    match effects.sink.create(&request).await {
        Ok(id) => {
            metrics::record_annotation(kind, phase.as_str(), OperationOutcome::Success);
            let id_label = id.to_string();
            log_info(
                COMPONENT,
                "Annotation created",
                &[
                    ("title", request.title.as_str()),
                    ("phase", phase.as_str()),
                    ("annotation_id", id_label.as_str()),
                ],
            );
            Ok(id)
        }
        Err(err) => {
            metrics::record_annotation(kind, phase.as_str(), OperationOutcome::Error);
            Err(ReconcileError::Annotation(err))
        }
    }
}

/// A failure here leaves an annotation without a persisted pointer; the
/// retry may write a second one for the same rollout.
async fn persist_after_emit(
    effects: Effects<'_>,
    subject: Subject<'_>,
    change: &StateChange,
    id: AnnotationId,
) -> Result<(), ReconcileError> {
    if let Err(err) = apply_state_change(effects.store, subject.key, change).await {
        let workload = sanitize_for_log(&subject.key.to_string());
        let id_label = id.to_string();
        let error_text = err.to_string();
        log_warn(
            COMPONENT,
            "Annotation created but state was not persisted; retry may duplicate it",
            &[
                ("workload", workload.as_str()),
                ("annotation_id", id_label.as_str()),
                ("error", error_text.as_str()),
            ],
        );
        return Err(err.into());
    }
    Ok(())
}

async fn convert_start_to_region(state: &PersistedState, subject: Subject<'_>, effects: Effects<'_>) {
    let workload = sanitize_for_log(&subject.key.to_string());
    let Some(start_id) = state.parsed_start_id() else {
        let raw = sanitize_for_log(state.start_annotation_id.as_deref().unwrap_or_default());
        log_debug(
            COMPONENT,
            "Start annotation id unparseable; skipping region conversion",
            &[("workload", workload.as_str()), ("start_annotation_id", raw.as_str())],
        );
        return;
    };

    let request = RegionRequest::for_workload(start_id, subject.key, subject.image_tag, Utc::now());
    if let Err(err) = effects.sink.extend_to_region(&request).await {
        let id_label = start_id.to_string();
        let error_text = err.to_string();
        log_warn(
            COMPONENT,
            "Failed to convert start annotation to region",
            &[
                ("workload", workload.as_str()),
                ("annotation_id", id_label.as_str()),
                ("error", error_text.as_str()),
            ],
        );
    }
}
