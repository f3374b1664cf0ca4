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

//! Operational HTTP endpoints. Metrics and probes listen on separate
//! addresses so probe traffic never competes with scrapes.

use axum::routing::get;
use axum::Router;
use std::io;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::annotator::logger::log_info;

mod handlers;

pub fn metrics_router() -> Router {
    Router::new().route("/metrics", get(handlers::metrics))
}

pub fn probe_router() -> Router {
    Router::new()
        .route("/healthz", get(handlers::healthz))
        .route("/readyz", get(handlers::readyz))
}

/// Serves `router` on `addr` until `shutdown` is cancelled.
pub async fn serve(
    name: &'static str,
    addr: SocketAddr,
    router: Router,
    shutdown: CancellationToken,
) -> io::Result<()> {
    let listener = TcpListener::bind(addr).await.map_err(|err| {
        io::Error::new(err.kind(), format!("failed to bind {name} listener at {addr}: {err}"))
    })?;
    let bound = listener.local_addr()?.to_string();
    log_info(
        "server",
        "Listening",
        &[("listener", name), ("address", bound.as_str())],
    );
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}
