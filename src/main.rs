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

use annotator::annotator::annotation::grafana::GrafanaSink;
use annotator::annotator::cluster::{
    spawn_child_watch, spawn_namespace_watch, spawn_workload_watch, KubeMetadataStore,
};
use annotator::annotator::config::{AnnotatorConfig, Config};
use annotator::annotator::controller::dispatch::Dispatcher;
use annotator::annotator::controller::reconcile::WorkloadReconciler;
use annotator::annotator::controller::runtime::ControllerRuntime;
use annotator::annotator::k8s::WorkloadKind;
use annotator::annotator::logger::{log_error, log_info, set_log_format, set_min_level};
use annotator::annotator::observability::tracing as trace;
use annotator::annotator::server;
use annotator::annotator::store::MetadataStore;
use clap::Parser;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use std::env;
use std::error::Error;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const COMPONENT: &str = "main";

/// Flags override the matching environment variables.
#[derive(Parser, Debug)]
#[command(name = env!("CARGO_PKG_NAME"))]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = env!("CARGO_PKG_DESCRIPTION"))]
struct Cli {
    #[arg(long)]
    grafana_url: Option<String>,

    #[arg(long)]
    grafana_api_key: Option<String>,

    #[arg(long)]
    max_concurrent_reconciles: Option<String>,

    /// Seconds.
    #[arg(long)]
    http_timeout: Option<String>,

    /// Seconds.
    #[arg(long)]
    sink_timeout: Option<String>,

    /// Seconds.
    #[arg(long)]
    requeue_delay: Option<String>,

    #[arg(long)]
    metrics_bind_address: Option<String>,

    #[arg(long)]
    health_probe_bind_address: Option<String>,

    #[arg(long)]
    log_level: Option<String>,

    /// `text` or `json`.
    #[arg(long)]
    log_format: Option<String>,

    #[arg(long)]
    log_development: Option<String>,

    /// Comma separated list of deployment, statefulset, daemonset.
    #[arg(long)]
    watch_kinds: Option<String>,
}

impl Cli {
    fn value_for(&self, name: &str) -> Option<String> {
        let value = match name {
            n if n == Config::GrafanaUrl.env_var() => &self.grafana_url,
            n if n == Config::GrafanaApiKey.env_var() => &self.grafana_api_key,
            n if n == Config::MaxConcurrentReconciles.env_var() => &self.max_concurrent_reconciles,
            n if n == Config::HttpTimeout.env_var() => &self.http_timeout,
            n if n == Config::SinkTimeout.env_var() => &self.sink_timeout,
            n if n == Config::RequeueDelay.env_var() => &self.requeue_delay,
            n if n == Config::MetricsBindAddress.env_var() => &self.metrics_bind_address,
            n if n == Config::HealthProbeBindAddress.env_var() => &self.health_probe_bind_address,
            n if n == Config::LogLevel.env_var() => &self.log_level,
            n if n == Config::LogFormat.env_var() => &self.log_format,
            n if n == Config::LogDevelopment.env_var() => &self.log_development,
            n if n == Config::WatchKinds.env_var() => &self.watch_kinds,
            _ => return None,
        };
        value.clone()
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    let cli = Cli::parse();
    let config =
        AnnotatorConfig::from_lookup(|name| cli.value_for(name).or_else(|| env::var(name).ok()))?;

    trace::init();
    set_log_format(config.log_format);
    set_min_level(config.log_level);

    let kinds = config
        .watch_kinds
        .iter()
        .map(|kind| kind.marker())
        .collect::<Vec<_>>()
        .join(",");
    let concurrency = config.max_concurrent_reconciles.to_string();
    log_info(
        COMPONENT,
        "Starting annotator",
        &[
            ("version", env!("CARGO_PKG_VERSION")),
            ("os", env::consts::OS),
            ("arch", env::consts::ARCH),
            ("grafana_url", config.grafana_url.as_str()),
            ("watch_kinds", kinds.as_str()),
            ("max_concurrent_reconciles", concurrency.as_str()),
        ],
    );

    let sink = Arc::new(GrafanaSink::new(
        &config.grafana_url,
        config.grafana_api_key.clone(),
        config.http_timeout,
        config.sink_timeout,
    )?);
    let client = kube::Client::try_default().await?;
    let store: Arc<dyn MetadataStore> =
        Arc::new(KubeMetadataStore::new(client.clone(), config.http_timeout));

    let runtime = ControllerRuntime::new();
    runtime.register_store(Arc::clone(&store));
    runtime.register_sink(sink);

    let shutdown = CancellationToken::new();
    let mut handles: Vec<JoinHandle<()>> = Vec::new();
    let mut dispatchers = Vec::new();

    for &kind in &config.watch_kinds {
        let reconciler = Arc::new(WorkloadReconciler::new(kind, config.requeue_delay));
        let worker_runtime = Arc::clone(&runtime);
        handles.extend(runtime.spawn_workers(
            kind,
            config.max_concurrent_reconciles,
            shutdown.clone(),
            move |key| {
                let reconciler = Arc::clone(&reconciler);
                let runtime = Arc::clone(&worker_runtime);
                async move { reconciler.reconcile(&runtime.context(), &key).await }
            },
        ));

        let dispatcher = Arc::new(Dispatcher::new(kind, Arc::clone(&runtime), Arc::clone(&store)));
        handles.push(match kind {
            WorkloadKind::Deployment => spawn_workload_watch::<Deployment>(
                client.clone(),
                Arc::clone(&dispatcher),
                shutdown.clone(),
            ),
            WorkloadKind::StatefulSet => spawn_workload_watch::<StatefulSet>(
                client.clone(),
                Arc::clone(&dispatcher),
                shutdown.clone(),
            ),
            WorkloadKind::DaemonSet => spawn_workload_watch::<DaemonSet>(
                client.clone(),
                Arc::clone(&dispatcher),
                shutdown.clone(),
            ),
        });
        if kind.uses_child_controllers() {
            handles.push(spawn_child_watch(
                client.clone(),
                Arc::clone(&dispatcher),
                shutdown.clone(),
            ));
        }
        dispatchers.push(dispatcher);
    }
    handles.push(spawn_namespace_watch(client, dispatchers, shutdown.clone()));

    handles.push(spawn_server(
        "metrics",
        config.metrics_bind_address,
        server::metrics_router(),
        shutdown.clone(),
    ));
    handles.push(spawn_server(
        "probes",
        config.health_probe_bind_address,
        server::probe_router(),
        shutdown.clone(),
    ));

    tokio::select! {
        result = wait_for_signal() => result?,
        _ = shutdown.cancelled() => {}
    }
    log_info(COMPONENT, "Shutting down", &[]);
    shutdown.cancel();
    runtime.close_queues();
    futures_util::future::join_all(handles).await;
    log_info(COMPONENT, "Stopped", &[]);
    Ok(())
}

/// A listener that fails to bind takes the whole process down.
fn spawn_server(
    name: &'static str,
    addr: std::net::SocketAddr,
    router: axum::Router,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(err) = server::serve(name, addr, router, shutdown.clone()).await {
            let error = err.to_string();
            log_error(
                COMPONENT,
                "HTTP listener failed",
                &[("listener", name), ("error", error.as_str())],
            );
            shutdown.cancel();
        }
    })
}

async fn wait_for_signal() -> std::io::Result<()> {
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}
