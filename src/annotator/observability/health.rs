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

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, OnceLock};

const ERROR_MAX_LEN: usize = 240;

#[derive(Clone, Debug, Serialize)]
pub struct ComponentHealth {
    pub name: String,
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ComponentHealth {
    fn healthy(name: impl Into<String>) -> Self {
        ComponentHealth {
            name: name.into(),
            healthy: true,
            error: None,
        }
    }

    fn unhealthy(name: impl Into<String>, err: impl ToString) -> Self {
        let mut message = err.to_string();
        if message.len() > ERROR_MAX_LEN {
            let mut cut = ERROR_MAX_LEN;
            while !message.is_char_boundary(cut) {
                cut -= 1;
            }
            message.truncate(cut);
        }
        ComponentHealth {
            name: name.into(),
            healthy: false,
            error: Some(message),
        }
    }
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ready,
    Degraded,
}

#[derive(Clone, Debug, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub components: Vec<ComponentHealth>,
}

impl HealthReport {
    pub fn is_ready(&self) -> bool {
        self.status == HealthStatus::Ready
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum WatchState {
    Syncing,
    Synced,
    Failing(String),
}

/// Tracks the initial-list progress of every watch stream. A stream that has
/// synced once stays ready through later reconnects.
#[derive(Default)]
pub struct HealthRegistry {
    watches: Mutex<BTreeMap<String, (WatchState, bool)>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide registry served by `/readyz`.
    pub fn global() -> &'static HealthRegistry {
        static INSTANCE: OnceLock<HealthRegistry> = OnceLock::new();
        INSTANCE.get_or_init(HealthRegistry::new)
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, (WatchState, bool)>> {
        self.watches
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn register_watch(&self, name: &str) {
        self.lock()
            .entry(name.to_string())
            .or_insert((WatchState::Syncing, false));
    }

    pub fn mark_synced(&self, name: &str) {
        self.lock()
            .insert(name.to_string(), (WatchState::Synced, true));
    }

    pub fn mark_failed(&self, name: &str, error: impl ToString) {
        let mut watches = self.lock();
        let synced_once = watches.get(name).map(|(_, synced)| *synced).unwrap_or(false);
        watches.insert(
            name.to_string(),
            (WatchState::Failing(error.to_string()), synced_once),
        );
    }

    /// Readiness assessment used by `/readyz`.
    pub fn readiness_report(&self) -> HealthReport {
        let components: Vec<ComponentHealth> = self
            .lock()
            .iter()
            .map(|(name, (state, synced_once))| match state {
                WatchState::Synced => ComponentHealth::healthy(name.as_str()),
                WatchState::Failing(_) if *synced_once => ComponentHealth::healthy(name.as_str()),
                WatchState::Failing(err) => ComponentHealth::unhealthy(name.as_str(), err),
                WatchState::Syncing => {
                    ComponentHealth::unhealthy(name.as_str(), "waiting for initial list")
                }
            })
            .collect();

        let status = if !components.is_empty() && components.iter().all(|c| c.healthy) {
            HealthStatus::Ready
        } else {
            HealthStatus::Degraded
        };

        HealthReport { status, components }
    }
}

/// Liveness probes check that the process is servicing requests. They do not
/// perform external dependency checks to remain lightweight.
pub fn liveness_report() -> HealthReport {
    HealthReport {
        status: HealthStatus::Ready,
        components: vec![ComponentHealth::healthy("process")],
    }
}
