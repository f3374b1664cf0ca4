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

//! Annotation records written to the timeline service and the correlation
//! scheme that ties them to workloads.

pub mod grafana;
pub mod memory;

use crate::annotator::k8s::WorkloadKey;
use crate::annotator::util::sanitize_for_log;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use std::error::Error;
use std::fmt;
use std::future::Future;
use std::pin::Pin;

/// Category tag shared by every annotation the annotator writes.
pub const CATEGORY_TAG: &str = "deploy";
/// Phase tag applied when a start annotation is converted into a region.
pub const REGION_TAG: &str = "region";

pub type AnnotationId = i64;

pub type SinkFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, AnnotationError>> + Send + 'a>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AnnotationPhase {
    Started,
    Completed,
    Deleted,
}

impl AnnotationPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            AnnotationPhase::Started => "started",
            AnnotationPhase::Completed => "completed",
            AnnotationPhase::Deleted => "deleted",
        }
    }

    fn title_suffix(self) -> &'static str {
        match self {
            AnnotationPhase::Started => "start",
            AnnotationPhase::Completed => "end",
            AnnotationPhase::Deleted => "delete",
        }
    }
}

impl fmt::Display for AnnotationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single-instant annotation to create.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AnnotationRequest {
    pub title: String,
    pub tags: Vec<String>,
    pub body: String,
    pub timestamp: DateTime<Utc>,
}

impl AnnotationRequest {
    /// Builds the annotation for `phase` of the workload at `key`.
    ///
    /// `image` is the raw image reference and `image_tag` its extracted tag;
    /// both are absent for deletions. All user-derived values are sanitized.
    pub fn for_workload(
        phase: AnnotationPhase,
        key: &WorkloadKey,
        image: Option<&str>,
        image_tag: Option<&str>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let name = sanitize_for_log(&key.name);
        let body = match (phase, image) {
            (AnnotationPhase::Started, Some(image)) => {
                format!("Started deployment {}", sanitize_for_log(image))
            }
            (AnnotationPhase::Completed, Some(image)) => {
                format!("Completed deployment {}", sanitize_for_log(image))
            }
            (AnnotationPhase::Started, None) => format!("Started deployment {name}"),
            (AnnotationPhase::Completed, None) => format!("Completed deployment {name}"),
            (AnnotationPhase::Deleted, _) => format!("Deleted deployment {name}"),
        };

        Self {
            title: format!("{}-{}:{}", CATEGORY_TAG, phase.title_suffix(), name),
            tags: correlation_tags(key, image_tag, phase.as_str()),
            body,
            timestamp,
        }
    }
}

/// Request to turn an existing annotation into a region ending at `end`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegionRequest {
    pub id: AnnotationId,
    pub end: DateTime<Utc>,
    pub tags: Vec<String>,
}

impl RegionRequest {
    pub fn for_workload(
        id: AnnotationId,
        key: &WorkloadKey,
        image_tag: Option<&str>,
        end: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            end,
            tags: correlation_tags(key, image_tag, REGION_TAG),
        }
    }
}

/// Tag set `deploy, <namespace>, <name>, <tag>, <phase>, <kind>` with empty
/// values omitted.
fn correlation_tags(key: &WorkloadKey, image_tag: Option<&str>, phase: &str) -> Vec<String> {
    [
        CATEGORY_TAG,
        key.namespace.as_str(),
        key.name.as_str(),
        image_tag.unwrap_or_default(),
        phase,
        key.kind.marker(),
    ]
    .iter()
    .map(|value| sanitize_for_log(value))
    .filter(|value| !value.is_empty())
    .collect()
}

#[derive(Debug)]
pub enum AnnotationError {
    Timeout,
    Transport(reqwest::Error),
    /// Non-success response; `body` is sanitized and size-bounded.
    Status { status: StatusCode, body: String },
    Decode(String),
}

impl fmt::Display for AnnotationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnnotationError::Timeout => write!(f, "annotation request timed out"),
            AnnotationError::Transport(err) => write!(f, "annotation request failed: {err}"),
            AnnotationError::Status { status, body } => {
                write!(f, "annotation service returned {status}: {body}")
            }
            AnnotationError::Decode(detail) => {
                write!(f, "annotation response could not be decoded: {detail}")
            }
        }
    }
}

impl Error for AnnotationError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            AnnotationError::Transport(err) => Some(err),
            _ => None,
        }
    }
}

/// Destination for lifecycle annotations.
pub trait AnnotationSink: Send + Sync {
    fn create<'a>(&'a self, request: &'a AnnotationRequest) -> SinkFuture<'a, AnnotationId>;

    fn extend_to_region<'a>(&'a self, request: &'a RegionRequest) -> SinkFuture<'a, ()>;
}
