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

//! Kubernetes adapters: typed API objects in, snapshots and patches out.

pub mod convert;
pub mod store;
pub mod watch;

pub use convert::{child_snapshot, namespace_snapshot, workload_snapshot, WorkloadResource};
pub use store::KubeMetadataStore;
pub use watch::{spawn_child_watch, spawn_namespace_watch, spawn_workload_watch};
