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

//! Recording [`AnnotationSink`] for tests.

use super::{
    AnnotationError, AnnotationId, AnnotationPhase, AnnotationRequest, AnnotationSink,
    RegionRequest, SinkFuture, CATEGORY_TAG,
};
use reqwest::StatusCode;
use std::sync::{Mutex, MutexGuard};

#[derive(Default)]
struct Recorded {
    next_id: AnnotationId,
    created: Vec<(AnnotationId, AnnotationRequest)>,
    regions: Vec<RegionRequest>,
    failing_creates: usize,
    failing_regions: bool,
}

/// Keeps every request in memory and hands out sequential ids from 1.
#[derive(Default)]
pub struct RecordingSink {
    inner: Mutex<Recorded>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Recorded> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn created(&self) -> Vec<(AnnotationId, AnnotationRequest)> {
        self.lock().created.clone()
    }

    pub fn regions(&self) -> Vec<RegionRequest> {
        self.lock().regions.clone()
    }

    /// Phases of the created annotations, in order, read back from the tags.
    pub fn phases(&self) -> Vec<AnnotationPhase> {
        self.lock()
            .created
            .iter()
            .filter_map(|(_, request)| phase_of(request))
            .collect()
    }

    /// The next `count` create calls fail with a 500 response.
    pub fn fail_creates(&self, count: usize) {
        self.lock().failing_creates = count;
    }

    pub fn fail_regions(&self, failing: bool) {
        self.lock().failing_regions = failing;
    }

    pub fn clear(&self) {
        let mut recorded = self.lock();
        recorded.created.clear();
        recorded.regions.clear();
    }
}

fn phase_of(request: &AnnotationRequest) -> Option<AnnotationPhase> {
    if request.tags.first().map(String::as_str) != Some(CATEGORY_TAG) {
        return None;
    }
    [
        AnnotationPhase::Started,
        AnnotationPhase::Completed,
        AnnotationPhase::Deleted,
    ]
    .into_iter()
    .find(|phase| request.tags.iter().any(|tag| tag == phase.as_str()))
}

impl AnnotationSink for RecordingSink {
    fn create<'a>(&'a self, request: &'a AnnotationRequest) -> SinkFuture<'a, AnnotationId> {
        Box::pin(async move {
            let mut recorded = self.lock();
            if recorded.failing_creates > 0 {
                recorded.failing_creates -= 1;
                return Err(AnnotationError::Status {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    body: "injected failure".to_string(),
                });
            }
            recorded.next_id += 1;
            let id = recorded.next_id;
            recorded.created.push((id, request.clone()));
            Ok(id)
        })
    }

    fn extend_to_region<'a>(&'a self, request: &'a RegionRequest) -> SinkFuture<'a, ()> {
        Box::pin(async move {
            let mut recorded = self.lock();
            if recorded.failing_regions {
                return Err(AnnotationError::Timeout);
            }
            recorded.regions.push(request.clone());
            Ok(())
        })
    }
}
