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

//! Version tokens that change exactly when a new rollout should be reported.

use crate::annotator::k8s::{ChildControllerSnapshot, WorkloadSnapshot};

/// Picks the most recently created child controller owned by `workload`.
/// Ties on creation time resolve to the lexically greatest name so the
/// choice is stable across calls.
pub fn latest_owned_child<'a>(
    workload: &WorkloadSnapshot,
    children: &'a [ChildControllerSnapshot],
) -> Option<&'a ChildControllerSnapshot> {
    children
        .iter()
        .filter(|child| child.is_owned_by(workload))
        .max_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.name.cmp(&b.name))
        })
}

/// `hash-<template hash>-img-<tag>` when the newest owned child exposes a
/// template hash, otherwise `gen-<generation>-img-<tag>`.
pub fn compute_version(
    workload: &WorkloadSnapshot,
    image_tag: &str,
    latest_child: Option<&ChildControllerSnapshot>,
) -> String {
    match latest_child.and_then(ChildControllerSnapshot::template_hash) {
        Some(hash) => format!("hash-{hash}-img-{image_tag}"),
        None => format!("gen-{}-img-{image_tag}", workload.generation),
    }
}
