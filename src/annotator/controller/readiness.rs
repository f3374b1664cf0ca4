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

use crate::annotator::k8s::WorkloadSnapshot;

/// Steady state: at least one replica ready, every desired replica ready, and
/// the status reflects the latest spec generation.
pub fn is_ready(snapshot: &WorkloadSnapshot) -> bool {
    snapshot.ready_replicas > 0
        && snapshot.ready_replicas == snapshot.desired_replicas
        && snapshot.observed_generation == snapshot.generation
}
