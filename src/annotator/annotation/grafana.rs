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

use super::{
    AnnotationError, AnnotationId, AnnotationRequest, AnnotationSink, RegionRequest, SinkFuture,
};
use crate::annotator::logger::log_debug;
use crate::annotator::observability::metrics::{self, SinkOperation};
use crate::annotator::util::bounded_body;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

const COMPONENT: &str = "grafana-sink";
const CREATE_PATH: &str = "/api/annotations/graphite";

/// Graphite-style annotation payload accepted by Grafana.
#[derive(Serialize)]
struct GraphiteAnnotation<'a> {
    what: &'a str,
    tags: &'a [String],
    data: &'a str,
    when: i64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RegionUpdate<'a> {
    time_end: i64,
    is_region: bool,
    tags: &'a [String],
}

#[derive(Deserialize)]
struct CreatedAnnotation {
    id: AnnotationId,
}

/// [`AnnotationSink`] backed by the Grafana annotations HTTP API.
pub struct GrafanaSink {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    request_timeout: Duration,
}

impl GrafanaSink {
    /// Builds a sink for `base_url`. `http_timeout` bounds the whole HTTP
    /// exchange inside the client and `request_timeout` bounds each sink call.
    pub fn new(
        base_url: &str,
        api_key: impl Into<String>,
        http_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Self, AnnotationError> {
        let client = reqwest::Client::builder()
            .timeout(http_timeout)
            .build()
            .map_err(AnnotationError::Transport)?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            request_timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post_annotation(
        &self,
        request: &AnnotationRequest,
    ) -> Result<AnnotationId, AnnotationError> {
        let payload = GraphiteAnnotation {
            what: &request.title,
            tags: &request.tags,
            data: &request.body,
            when: request.timestamp.timestamp(),
        };
        let call = self
            .client
            .post(format!("{}{}", self.base_url, CREATE_PATH))
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send();

        let response = self.bounded(call).await?;
        let created: CreatedAnnotation = self.handle_json(response).await?;
        let id_label = created.id.to_string();
        log_debug(
            COMPONENT,
            "Created annotation",
            &[
                ("title", request.title.as_str()),
                ("annotation_id", id_label.as_str()),
            ],
        );
        Ok(created.id)
    }

    async fn patch_region(&self, request: &RegionRequest) -> Result<(), AnnotationError> {
        let payload = RegionUpdate {
            time_end: request.end.timestamp_millis(),
            is_region: true,
            tags: &request.tags,
        };
        let call = self
            .client
            .patch(format!("{}/api/annotations/{}", self.base_url, request.id))
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send();

        let response = self.bounded(call).await?;
        ensure_ok(response).await?;
        let id_label = request.id.to_string();
        log_debug(
            COMPONENT,
            "Converted annotation to region",
            &[("annotation_id", id_label.as_str())],
        );
        Ok(())
    }

    async fn bounded<F>(&self, call: F) -> Result<reqwest::Response, AnnotationError>
    where
        F: Future<Output = Result<reqwest::Response, reqwest::Error>>,
    {
        match tokio::time::timeout(self.request_timeout, call).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(err)) if err.is_timeout() => Err(AnnotationError::Timeout),
            Ok(Err(err)) => Err(AnnotationError::Transport(err)),
            Err(_) => Err(AnnotationError::Timeout),
        }
    }

    async fn handle_json<T>(&self, response: reqwest::Response) -> Result<T, AnnotationError>
    where
        T: DeserializeOwned,
    {
        let response = ensure_ok(response).await?;
        let text = response.text().await.map_err(AnnotationError::Transport)?;
        serde_json::from_str(&text).map_err(|err| AnnotationError::Decode(err.to_string()))
    }
}

/// Grafana acknowledges annotation writes with 200; anything else is an
/// error carrying the bounded response body.
async fn ensure_ok(response: reqwest::Response) -> Result<reqwest::Response, AnnotationError> {
    let status = response.status();
    if status == StatusCode::OK {
        return Ok(response);
    }
    let text = response.text().await.unwrap_or_default();
    Err(AnnotationError::Status {
        status,
        body: bounded_body(&text),
    })
}

impl AnnotationSink for GrafanaSink {
    fn create<'a>(&'a self, request: &'a AnnotationRequest) -> SinkFuture<'a, AnnotationId> {
        Box::pin(metrics::observe_sink_request(
            SinkOperation::Create,
            self.post_annotation(request),
        ))
    }

    fn extend_to_region<'a>(&'a self, request: &'a RegionRequest) -> SinkFuture<'a, ()> {
        Box::pin(metrics::observe_sink_request(
            SinkOperation::Region,
            self.patch_region(request),
        ))
    }
}
