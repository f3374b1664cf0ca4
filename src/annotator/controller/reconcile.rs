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

use super::fingerprint::{compute_version, latest_owned_child};
use super::lifecycle::{apply, decide, Effects, Observation, Subject};
use super::readiness::is_ready;
use super::runtime::ControllerRuntime;
use super::tracking::is_tracked;
use crate::annotator::annotation::{AnnotationError, AnnotationSink};
use crate::annotator::k8s::{WorkloadKey, WorkloadKind};
use crate::annotator::logger::{log_debug, log_error, log_info, log_warn};
use crate::annotator::observability::metrics::{self, ControllerReconcileResult};
use crate::annotator::observability::tracing::with_span;
use crate::annotator::store::{MetadataStore, PersistedState, StoreError};
use crate::annotator::util::{extract_image_tag, sanitize_for_log};
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

const COMPONENT: &str = "reconciler";

/// Execution context shared across reconciliation phases.
///
/// The context exposes the underlying `ControllerRuntime` so reconcilers can
/// reach dependency-injected collaborators.
pub struct ReconcileContext<'a> {
    runtime: &'a ControllerRuntime,
}

impl<'a> ReconcileContext<'a> {
    pub fn new(runtime: &'a ControllerRuntime) -> Self {
        Self { runtime }
    }

    pub fn runtime(&self) -> &'a ControllerRuntime {
        self.runtime
    }

    /// Looks up a dependency that was previously registered with the runtime.
    pub fn dependency<T>(&self) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        self.runtime.dependency::<T>()
    }

    pub fn store(&self) -> Result<Arc<dyn MetadataStore>, ReconcileError> {
        self.dependency::<DependencyHandle<dyn MetadataStore>>()
            .map(|handle| handle.get())
            .ok_or(ReconcileError::Dependency("metadata store"))
    }

    pub fn sink(&self) -> Result<Arc<dyn AnnotationSink>, ReconcileError> {
        self.dependency::<DependencyHandle<dyn AnnotationSink>>()
            .map(|handle| handle.get())
            .ok_or(ReconcileError::Dependency("annotation sink"))
    }
}

/// Wrapper that stores an `Arc<T>` while remaining `Sized`, enabling trait-object dependencies.
pub struct DependencyHandle<T: ?Sized> {
    inner: Arc<T>,
}

impl<T: ?Sized> DependencyHandle<T> {
    pub fn new(inner: Arc<T>) -> Self {
        Self { inner }
    }

    pub fn get(&self) -> Arc<T> {
        Arc::clone(&self.inner)
    }
}

impl<T: ?Sized> Clone for DependencyHandle<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

#[derive(Debug)]
pub enum ReconcileError {
    Annotation(AnnotationError),
    Store(StoreError),
    Dependency(&'static str),
}

impl fmt::Display for ReconcileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconcileError::Annotation(err) => write!(f, "{err}"),
            ReconcileError::Store(err) => write!(f, "{err}"),
            ReconcileError::Dependency(name) => write!(f, "{name} dependency not registered"),
        }
    }
}

impl Error for ReconcileError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ReconcileError::Annotation(err) => Some(err),
            ReconcileError::Store(err) => Some(err),
            ReconcileError::Dependency(_) => None,
        }
    }
}

impl From<AnnotationError> for ReconcileError {
    fn from(err: AnnotationError) -> Self {
        ReconcileError::Annotation(err)
    }
}

impl From<StoreError> for ReconcileError {
    fn from(err: StoreError) -> Self {
        ReconcileError::Store(err)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Done,
    RequeueAfter(Duration),
}

/// Reconciler shared by every workload kind. Kind differences are already
/// folded into the snapshot (replica fields) and into
/// [`WorkloadKind::uses_child_controllers`] (version source).
pub struct WorkloadReconciler {
    kind: WorkloadKind,
    requeue_delay: Duration,
}

impl WorkloadReconciler {
    pub fn new(kind: WorkloadKind, requeue_delay: Duration) -> Self {
        Self {
            kind,
            requeue_delay,
        }
    }

    pub fn kind(&self) -> WorkloadKind {
        self.kind
    }

    /// Runs one reconciliation and turns failures into a delayed requeue.
    pub async fn reconcile(&self, ctx: &ReconcileContext<'_>, key: &WorkloadKey) -> ReconcileOutcome {
        let controller = self.kind.marker();
        with_span("controller", format!("reconcile {key}"), async {
            match self.try_reconcile(ctx, key).await {
                Ok(()) => {
                    metrics::record_controller_reconcile(controller, ControllerReconcileResult::Success);
                    ReconcileOutcome::Done
                }
                Err(err @ ReconcileError::Dependency(_)) => {
                    metrics::record_controller_reconcile(controller, ControllerReconcileResult::Error);
                    let workload = sanitize_for_log(&key.to_string());
                    let error_text = err.to_string();
                    log_error(
                        COMPONENT,
                        "Reconciliation cannot run",
                        &[("workload", workload.as_str()), ("error", error_text.as_str())],
                    );
                    ReconcileOutcome::Done
                }
                Err(err) => {
                    metrics::record_controller_reconcile(controller, ControllerReconcileResult::Requeue);
                    let workload = sanitize_for_log(&key.to_string());
                    let error_text = sanitize_for_log(&err.to_string());
                    let delay = format!("{}s", self.requeue_delay.as_secs());
                    log_error(
                        COMPONENT,
                        "Reconciliation failed; requeueing",
                        &[
                            ("workload", workload.as_str()),
                            ("error", error_text.as_str()),
                            ("requeue_after", delay.as_str()),
                        ],
                    );
                    ReconcileOutcome::RequeueAfter(self.requeue_delay)
                }
            }
        })
        .await
    }

    /// Fetch, gate on tracking, observe, decide, apply.
    pub async fn try_reconcile(
        &self,
        ctx: &ReconcileContext<'_>,
        key: &WorkloadKey,
    ) -> Result<(), ReconcileError> {
        let store = ctx.store()?;
        let sink = ctx.sink()?;
        let effects = Effects {
            sink: sink.as_ref(),
            store: store.as_ref(),
        };
        let workload = sanitize_for_log(&key.to_string());

        let Some(snapshot) = store.get(key).await? else {
            let tracked = match store.namespace_labels(&key.namespace).await {
                Ok(labels) => is_tracked(labels.as_ref()),
                Err(err) => {
                    let error_text = err.to_string();
                    log_error(
                        COMPONENT,
                        "Cannot read namespace of deleted workload; dropping deletion",
                        &[("workload", workload.as_str()), ("error", error_text.as_str())],
                    );
                    return Ok(());
                }
            };
            let state = PersistedState::default();
            let action = decide(&state, &Observation::deleted(tracked));
            let subject = Subject {
                key,
                image: None,
                image_tag: None,
            };
            return apply(&action, &state, subject, effects).await;
        };

        let state = PersistedState::from_annotations(&snapshot.annotations);
        let labels = store.namespace_labels(snapshot.namespace()).await?;
        if !is_tracked(labels.as_ref()) {
            let action = decide(&state, &Observation::untracked());
            let subject = Subject {
                key,
                image: snapshot.image.as_deref(),
                image_tag: None,
            };
            return apply(&action, &state, subject, effects).await;
        }

        let Some(image) = snapshot.image.as_deref().filter(|image| !image.trim().is_empty()) else {
            log_info(
                COMPONENT,
                "Workload has no usable container image; skipping",
                &[("workload", workload.as_str())],
            );
            return Ok(());
        };
        let image_tag = extract_image_tag(image);

        let latest_child = if self.kind.uses_child_controllers() {
            match store.child_controllers(&snapshot).await {
                Ok(children) => latest_owned_child(&snapshot, &children).cloned(),
                Err(err) => {
                    let error_text = err.to_string();
                    log_warn(
                        COMPONENT,
                        "Cannot list child controllers; versioning by generation",
                        &[("workload", workload.as_str()), ("error", error_text.as_str())],
                    );
                    None
                }
            }
        } else {
            None
        };

        let version = compute_version(&snapshot, &image_tag, latest_child.as_ref());
        let ready = is_ready(&snapshot);
        let action = decide(&state, &Observation::tracked(version.clone(), ready));

        let safe_version = sanitize_for_log(&version);
        log_debug(
            COMPONENT,
            "Evaluated workload",
            &[
                ("workload", workload.as_str()),
                ("version", safe_version.as_str()),
                ("ready", if ready { "true" } else { "false" }),
                ("action", action.as_str()),
            ],
        );

        let subject = Subject {
            key,
            image: Some(image),
            image_tag: Some(&image_tag),
        };
        apply(&action, &state, subject, effects).await
    }
}
