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

//! Watch streams feeding the dispatchers. Each stream registers with the
//! health registry before it starts so readiness waits for its first list.

use super::convert::{child_snapshot, namespace_snapshot, workload_snapshot, WorkloadResource};
use crate::annotator::controller::dispatch::{Dispatcher, WatchEvent};
use crate::annotator::k8s::TEMPLATE_HASH_LABEL;
use crate::annotator::logger::{log_info, log_warn};
use crate::annotator::observability::health::HealthRegistry;
use futures_util::{Stream, StreamExt};
use k8s_openapi::api::apps::v1::ReplicaSet;
use k8s_openapi::api::core::v1::Namespace;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const COMPONENT: &str = "watch";

pub fn spawn_workload_watch<R: WorkloadResource>(
    client: Client,
    dispatcher: Arc<Dispatcher>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    let name = format!("watch/{}", R::KIND.marker());
    HealthRegistry::global().register_watch(&name);
    let api: Api<R> = Api::all(client);
    let stream = watcher(api, watcher::Config::default()).default_backoff();
    tokio::spawn(drive(name, stream, shutdown, move |event| {
        let dispatcher = Arc::clone(&dispatcher);
        async move {
            let event = match event {
                watcher::Event::Init => WatchEvent::RelistStarted,
                watcher::Event::InitDone => WatchEvent::RelistDone,
                watcher::Event::Apply(obj) | watcher::Event::InitApply(obj) => {
                    match workload_snapshot(&obj) {
                        Some(snapshot) => WatchEvent::Applied(snapshot),
                        None => return,
                    }
                }
                watcher::Event::Delete(obj) => match workload_snapshot(&obj) {
                    Some(snapshot) => WatchEvent::Deleted(snapshot),
                    None => return,
                },
            };
            dispatcher.on_workload(event);
        }
    }))
}

/// ReplicaSet changes re-trigger their controlling Deployment.
pub fn spawn_child_watch(
    client: Client,
    dispatcher: Arc<Dispatcher>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    let name = "watch/replicasets".to_string();
    HealthRegistry::global().register_watch(&name);
    let api: Api<ReplicaSet> = Api::all(client);
    let config = watcher::Config::default().labels(TEMPLATE_HASH_LABEL);
    let stream = watcher(api, config).default_backoff();
    tokio::spawn(drive(name, stream, shutdown, move |event| {
        let dispatcher = Arc::clone(&dispatcher);
        async move {
            let event = match event {
                watcher::Event::Apply(obj) | watcher::Event::InitApply(obj) => {
                    child_snapshot(&obj).map(WatchEvent::Applied)
                }
                watcher::Event::Delete(obj) => child_snapshot(&obj).map(WatchEvent::Deleted),
                watcher::Event::Init | watcher::Event::InitDone => None,
            };
            if let Some(event) = event {
                dispatcher.on_child(event);
            }
        }
    }))
}

/// Namespace label changes fan out to every dispatcher.
pub fn spawn_namespace_watch(
    client: Client,
    dispatchers: Vec<Arc<Dispatcher>>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    let name = "watch/namespaces".to_string();
    HealthRegistry::global().register_watch(&name);
    let api: Api<Namespace> = Api::all(client);
    let stream = watcher(api, watcher::Config::default()).default_backoff();
    let dispatchers = Arc::new(dispatchers);
    tokio::spawn(drive(name, stream, shutdown, move |event| {
        let dispatchers = Arc::clone(&dispatchers);
        async move {
            let event = match event {
                watcher::Event::Apply(obj) | watcher::Event::InitApply(obj) => {
                    namespace_snapshot(&obj).map(WatchEvent::Applied)
                }
                watcher::Event::Delete(obj) => namespace_snapshot(&obj).map(WatchEvent::Deleted),
                watcher::Event::Init | watcher::Event::InitDone => None,
            };
            let Some(event) = event else {
                return;
            };
            for dispatcher in dispatchers.iter() {
                if let Err(err) = dispatcher.on_namespace(event.clone()).await {
                    let error = err.to_string();
                    log_warn(
                        COMPONENT,
                        "Failed to fan out namespace change",
                        &[
                            ("kind", dispatcher.kind().marker()),
                            ("error", error.as_str()),
                        ],
                    );
                }
            }
        }
    }))
}

async fn drive<K, S, H, Fut>(name: String, stream: S, shutdown: CancellationToken, handle: H)
where
    K: Send,
    S: Stream<Item = Result<watcher::Event<K>, watcher::Error>> + Send,
    H: Fn(watcher::Event<K>) -> Fut + Send,
    Fut: std::future::Future<Output = ()> + Send,
{
    let health = HealthRegistry::global();
    futures_util::pin_mut!(stream);
    log_info(COMPONENT, "Watch started", &[("stream", name.as_str())]);
    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = stream.next() => next,
        };
        match next {
            Some(Ok(event)) => {
                let synced = matches!(event, watcher::Event::InitDone);
                handle(event).await;
                if synced {
                    health.mark_synced(&name);
                }
            }
            Some(Err(err)) => {
                let error = err.to_string();
                health.mark_failed(&name, &error);
                log_warn(
                    COMPONENT,
                    "Watch stream error",
                    &[("stream", name.as_str()), ("error", error.as_str())],
                );
            }
            None => break,
        }
    }
    log_info(COMPONENT, "Watch stopped", &[("stream", name.as_str())]);
}
