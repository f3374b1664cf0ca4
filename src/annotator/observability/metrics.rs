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

use std::error::Error;
use std::future::Future;
use std::sync::OnceLock;
use std::time::Instant;

use prometheus::core::Collector;
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};

static REGISTRY: OnceLock<Registry> = OnceLock::new();
static CONTROLLER_RECONCILES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static ANNOTATIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static METADATA_PATCH_CONFLICTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static SINK_REQUEST_DURATION: OnceLock<HistogramVec> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(|| {
        Registry::new_custom(Some("annotator".to_string()), None)
            .expect("failed to initialise annotator metrics registry")
    })
}

fn register_collector<C>(collector: C) -> C
where
    C: Clone + Collector + Send + Sync + 'static,
{
    registry()
        .register(Box::new(collector.clone()))
        .expect("failed to register annotator metric collector");
    collector
}

fn controller_reconciles_total() -> &'static IntCounterVec {
    CONTROLLER_RECONCILES_TOTAL.get_or_init(|| {
        let opts = Opts::new(
            "controller_reconciles_total",
            "Controller reconciliation attempts grouped by result",
        );
        let counter = IntCounterVec::new(opts, &["controller", "result"])
            .expect("failed to build controller reconcile counter");
        register_collector(counter)
    })
}

fn annotations_total() -> &'static IntCounterVec {
    ANNOTATIONS_TOTAL.get_or_init(|| {
        let opts = Opts::new(
            "annotations_total",
            "Lifecycle annotations written grouped by workload kind, phase, and result",
        );
        let counter = IntCounterVec::new(opts, &["kind", "phase", "result"])
            .expect("failed to build annotations counter");
        register_collector(counter)
    })
}

fn metadata_patch_conflicts_total() -> &'static IntCounterVec {
    METADATA_PATCH_CONFLICTS_TOTAL.get_or_init(|| {
        let opts = Opts::new(
            "metadata_patch_conflicts_total",
            "Workload metadata patches rejected by a stale resource version",
        );
        let counter = IntCounterVec::new(opts, &["kind"])
            .expect("failed to build metadata conflict counter");
        register_collector(counter)
    })
}

fn sink_request_duration() -> &'static HistogramVec {
    SINK_REQUEST_DURATION.get_or_init(|| {
        let opts = HistogramOpts::new(
            "sink_request_duration_seconds",
            "Latency distribution for annotation service requests",
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 20.0]);
        let histogram = HistogramVec::new(opts, &["operation", "result"])
            .expect("failed to build sink request histogram");
        register_collector(histogram)
    })
}

#[derive(Copy, Clone, Debug)]
pub enum ControllerReconcileResult {
    Success,
    Requeue,
    Error,
}

impl ControllerReconcileResult {
    fn as_label(self) -> &'static str {
        match self {
            ControllerReconcileResult::Success => "success",
            ControllerReconcileResult::Requeue => "requeue",
            ControllerReconcileResult::Error => "error",
        }
    }
}

#[derive(Copy, Clone, Debug)]
pub enum SinkOperation {
    Create,
    Region,
}

impl SinkOperation {
    fn as_label(self) -> &'static str {
        match self {
            SinkOperation::Create => "create",
            SinkOperation::Region => "region",
        }
    }
}

#[derive(Copy, Clone, Debug)]
pub enum OperationOutcome {
    Success,
    Error,
}

impl OperationOutcome {
    fn as_label(self) -> &'static str {
        match self {
            OperationOutcome::Success => "success",
            OperationOutcome::Error => "error",
        }
    }
}

pub fn record_controller_reconcile(controller: &str, result: ControllerReconcileResult) {
    controller_reconciles_total()
        .with_label_values(&[controller, result.as_label()])
        .inc();
}

pub fn record_annotation(kind: &str, phase: &str, outcome: OperationOutcome) {
    annotations_total()
        .with_label_values(&[kind, phase, outcome.as_label()])
        .inc();
}

pub fn record_metadata_patch_conflict(kind: &str) {
    metadata_patch_conflicts_total()
        .with_label_values(&[kind])
        .inc();
}

/// Wraps an annotation service call and records its latency by outcome.
pub async fn observe_sink_request<F, T, E>(operation: SinkOperation, future: F) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
{
    let start = Instant::now();
    let result = future.await;
    let outcome = if result.is_ok() {
        OperationOutcome::Success
    } else {
        OperationOutcome::Error
    };
    sink_request_duration()
        .with_label_values(&[operation.as_label(), outcome.as_label()])
        .observe(start.elapsed().as_secs_f64());
    result
}

/// Encodes all registered metrics using the Prometheus text exposition
/// format.
pub fn gather() -> Result<Vec<u8>, Box<dyn Error + Send + Sync>> {
    let metric_families = registry().gather();
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|err| Box::new(err) as Box<dyn Error + Send + Sync>)?;
    Ok(buffer)
}
