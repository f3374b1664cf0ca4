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

//! Codec for the private metadata keys the annotator keeps on each workload.

use std::collections::BTreeMap;

pub const VERSION_KEY: &str = "deployment-annotator.io/tracked-version";
pub const START_ANNOTATION_KEY: &str = "deployment-annotator.io/start-annotation-id";
pub const END_ANNOTATION_KEY: &str = "deployment-annotator.io/end-annotation-id";

pub const PERSISTED_KEYS: [&str; 3] = [VERSION_KEY, START_ANNOTATION_KEY, END_ANNOTATION_KEY];

/// Lifecycle state recovered from a workload's annotations. Empty values are
/// read as absent.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PersistedState {
    pub version: Option<String>,
    pub start_annotation_id: Option<String>,
    pub end_annotation_id: Option<String>,
}

impl PersistedState {
    pub fn from_annotations(annotations: &BTreeMap<String, String>) -> Self {
        let read = |key: &str| {
            annotations
                .get(key)
                .filter(|value| !value.is_empty())
                .cloned()
        };
        Self {
            version: read(VERSION_KEY),
            start_annotation_id: read(START_ANNOTATION_KEY),
            end_annotation_id: read(END_ANNOTATION_KEY),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.version.is_none()
            && self.start_annotation_id.is_none()
            && self.end_annotation_id.is_none()
    }

    /// Start annotation id as a number; `None` when absent or unparseable.
    pub fn parsed_start_id(&self) -> Option<i64> {
        self.start_annotation_id
            .as_deref()
            .and_then(|raw| raw.trim().parse::<i64>().ok())
    }
}

/// Partial update of the persisted keys. A `None` value removes the key.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StateChange {
    entries: BTreeMap<&'static str, Option<String>>,
}

impl StateChange {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_version(self, version: impl Into<String>) -> Self {
        self.assign(VERSION_KEY, Some(version.into()))
    }

    pub fn set_start_id(self, id: i64) -> Self {
        self.assign(START_ANNOTATION_KEY, Some(id.to_string()))
    }

    pub fn set_end_id(self, id: i64) -> Self {
        self.assign(END_ANNOTATION_KEY, Some(id.to_string()))
    }

    pub fn clear_end_id(self) -> Self {
        self.assign(END_ANNOTATION_KEY, None)
    }

    pub fn clear_all() -> Self {
        PERSISTED_KEYS
            .iter()
            .fold(Self::new(), |change, key| change.assign(*key, None))
    }

    fn assign(mut self, key: &'static str, value: Option<String>) -> Self {
        let value = value.filter(|value| !value.is_empty());
        self.entries.insert(key, value);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = (&'static str, Option<&str>)> + '_ {
        self.entries
            .iter()
            .map(|(key, value)| (*key, value.as_deref()))
    }

    /// Returns the merge patch needed to bring `current` in line with this
    /// change, containing only keys whose value actually differs.
    pub fn pending_against(&self, current: &BTreeMap<String, String>) -> MetadataPatch {
        let mut patch = MetadataPatch::default();
        for (key, desired) in &self.entries {
            let existing = current.get(*key).filter(|value| !value.is_empty());
            if existing != desired.as_ref() {
                patch.entries.insert((*key).to_string(), desired.clone());
            }
        }
        patch
    }
}

/// Merge patch sent to the metadata store. The optional resource version is
/// a precondition: the write fails with a conflict when the object moved on.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MetadataPatch {
    pub resource_version: Option<String>,
    pub entries: BTreeMap<String, Option<String>>,
}

impl MetadataPatch {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn with_resource_version(mut self, resource_version: Option<String>) -> Self {
        self.resource_version = resource_version;
        self
    }

    /// Applies the patch to an annotation map; removals drop the key.
    pub fn apply_to(&self, annotations: &mut BTreeMap<String, String>) {
        for (key, value) in &self.entries {
            match value {
                Some(value) => {
                    annotations.insert(key.clone(), value.clone());
                }
                None => {
                    annotations.remove(key);
                }
            }
        }
    }

    /// JSON merge patch body: `{"metadata": {"annotations": {...}}}` with
    /// removals encoded as `null`.
    pub fn to_merge_json(&self) -> serde_json::Value {
        let annotations: serde_json::Map<String, serde_json::Value> = self
            .entries
            .iter()
            .map(|(key, value)| {
                let value = value
                    .as_ref()
                    .map(|value| serde_json::Value::String(value.clone()))
                    .unwrap_or(serde_json::Value::Null);
                (key.clone(), value)
            })
            .collect();

        let mut metadata = serde_json::Map::new();
        metadata.insert(
            "annotations".to_string(),
            serde_json::Value::Object(annotations),
        );
        if let Some(resource_version) = &self.resource_version {
            metadata.insert(
                "resourceVersion".to_string(),
                serde_json::Value::String(resource_version.clone()),
            );
        }
        serde_json::json!({ "metadata": metadata })
    }
}
