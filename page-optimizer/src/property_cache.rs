// Copyright 2024 Wladimir Palant
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Per-page persistent observations
//!
//! Every page has a property page stored under its URL, divided into cohorts. The `dom` cohort
//! holds beacon results, the `dependencies` cohort the subresources seen on the page. Cohort
//! values are JSON records carrying a version number; fields unknown to this version are kept
//! when a record is written back.

use crate::content_type::ContentType;
use crate::resource::InputInfo;

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, trace};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Mutex;

/// Current version of the cohort records
pub const COHORT_VERSION: u32 = 1;

/// Property cache cohorts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cohort {
    /// Page layout signals and beacon results
    Dom,
    /// Subresources of the page
    Dependencies,
}

impl Cohort {
    /// Name of the cohort in storage
    pub fn name(self) -> &'static str {
        match self {
            Self::Dom => "dom",
            Self::Dependencies => "dependencies",
        }
    }
}

/// Storage backend of the property cache
#[async_trait]
pub trait PropertyStore: Debug + Send + Sync {
    /// Reads the value of a cohort.
    async fn read(&self, key: &str, cohort: Cohort) -> Option<Bytes>;

    /// Replaces the value of a cohort.
    async fn write(&self, key: &str, cohort: Cohort, value: Bytes);
}

/// In-memory property store
#[derive(Debug, Default)]
pub struct MemoryPropertyStore {
    values: Mutex<HashMap<(String, Cohort), Bytes>>,
}

impl MemoryPropertyStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PropertyStore for MemoryPropertyStore {
    async fn read(&self, key: &str, cohort: Cohort) -> Option<Bytes> {
        let values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        values.get(&(key.to_owned(), cohort)).cloned()
    }

    async fn write(&self, key: &str, cohort: Cohort, value: Bytes) {
        let mut values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        values.insert((key.to_owned(), cohort), value);
    }
}

/// A subresource recorded for a page
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dependency {
    /// Absolute URL as referenced by the rewritten page
    pub url: String,
    /// Content type
    pub content_type: ContentType,
    /// Validity of the inputs the resource was produced from
    #[serde(default)]
    pub validity_info: Vec<InputInfo>,
    /// Sorting key, document order of top-level resources followed by the position within the
    /// parent for nested resources
    #[serde(default)]
    pub order_key: Vec<i32>,
    /// Fields not known to this version
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Value of the `dependencies` cohort
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DependenciesCohort {
    /// Record version
    #[serde(default)]
    pub version: u32,
    /// Dependencies sorted by order key
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
    /// Fields not known to this version
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Kinds of beacons instrumenting a page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BeaconKind {
    /// Images visible without scrolling
    CriticalImages,
    /// CSS selectors used without scrolling
    CriticalCss,
    /// Page panels visible without scrolling
    SplitHtml,
}

impl BeaconKind {
    /// Short name used in beacon URLs
    pub fn id(self) -> &'static str {
        match self {
            Self::CriticalImages => "ci",
            Self::CriticalCss => "cs",
            Self::SplitHtml => "sh",
        }
    }

    /// Parses the short name used in beacon URLs.
    pub fn from_id(id: &str) -> Option<Self> {
        match id {
            "ci" => Some(Self::CriticalImages),
            "cs" => Some(Self::CriticalCss),
            "sh" => Some(Self::SplitHtml),
            _ => None,
        }
    }
}

/// An outstanding beacon nonce
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeaconNonce {
    /// Nonce value
    pub nonce: String,
    /// Time the beacon was injected
    pub timestamp_ms: i64,
}

/// Beacon state of a page for one beacon kind
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeaconMetadata {
    /// Keys the beacon was asked to check
    #[serde(default)]
    pub candidate_keys: Vec<String>,
    /// Keys reported back as critical by the most recent beacon
    #[serde(default)]
    pub critical_keys: Vec<String>,
    /// Nonces of injected beacons that didn’t report back yet
    #[serde(default)]
    pub nonces: Vec<BeaconNonce>,
    /// Time the candidate keys or the critical keys last changed
    #[serde(default)]
    pub last_change_ms: i64,
    /// Fields not known to this version
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Value of the `dom` cohort
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DomCohort {
    /// Record version
    #[serde(default)]
    pub version: u32,
    /// Beacon state per beacon kind
    #[serde(default)]
    pub beacons: HashMap<BeaconKind, BeaconMetadata>,
    /// Fields not known to this version
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The property page of a document, read once when the document is rewritten
#[derive(Debug, Clone, Default)]
pub struct PropertyPage {
    key: String,
    dom: DomCohort,
    dependencies: DependenciesCohort,
    dom_changed: bool,
}

fn decode<T: DeserializeOwned + Default>(key: &str, cohort: Cohort, data: Option<Bytes>) -> T {
    let Some(data) = data else {
        return T::default();
    };
    match serde_json::from_slice(&data) {
        Ok(value) => value,
        Err(err) => {
            debug!(
                "Ignoring corrupt {} cohort of property page {key}: {err}",
                cohort.name()
            );
            T::default()
        }
    }
}

impl PropertyPage {
    /// Reads a property page from the store.
    pub async fn read(store: &dyn PropertyStore, key: &str) -> Self {
        let dom = decode(key, Cohort::Dom, store.read(key, Cohort::Dom).await);
        let dependencies = decode(
            key,
            Cohort::Dependencies,
            store.read(key, Cohort::Dependencies).await,
        );
        trace!("Read property page {key}");
        Self {
            key: key.to_owned(),
            dom,
            dependencies,
            dom_changed: false,
        }
    }

    /// A page without stored properties, used when the store doesn’t respond in time.
    pub fn empty(key: &str) -> Self {
        Self {
            key: key.to_owned(),
            ..Default::default()
        }
    }

    /// Storage key of the page
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Contents of the `dom` cohort
    pub fn dom(&self) -> &DomCohort {
        &self.dom
    }

    /// Modifiable contents of the `dom` cohort, marking the cohort as changed
    pub fn dom_mut(&mut self) -> &mut DomCohort {
        self.dom_changed = true;
        &mut self.dom
    }

    /// Contents of the `dependencies` cohort
    pub fn dependencies(&self) -> &DependenciesCohort {
        &self.dependencies
    }

    /// Writes the `dom` cohort back if it was changed.
    pub async fn write_dom(&mut self, store: &dyn PropertyStore) {
        if !self.dom_changed {
            return;
        }
        self.dom.version = COHORT_VERSION;
        if let Ok(data) = serde_json::to_vec(&self.dom) {
            store.write(&self.key, Cohort::Dom, Bytes::from(data)).await;
        }
        self.dom_changed = false;
    }

    /// Replaces the `dependencies` cohort and writes it to the store in one operation.
    pub async fn write_dependencies(
        &mut self,
        store: &dyn PropertyStore,
        dependencies: DependenciesCohort,
    ) {
        self.dependencies = dependencies;
        self.dependencies.version = COHORT_VERSION;
        if let Ok(data) = serde_json::to_vec(&self.dependencies) {
            store
                .write(&self.key, Cohort::Dependencies, Bytes::from(data))
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;

    #[test(tokio::test)]
    async fn empty_page() {
        let store = MemoryPropertyStore::new();
        let page = PropertyPage::read(&store, "http://example.com/").await;
        assert_eq!(page.key(), "http://example.com/");
        assert!(page.dependencies().dependencies.is_empty());
        assert!(page.dom().beacons.is_empty());
    }

    #[test(tokio::test)]
    async fn unknown_fields_survive() {
        let store = MemoryPropertyStore::new();
        store
            .write(
                "page",
                Cohort::Dependencies,
                Bytes::from_static(
                    concat!(
                        r#"{"version":7,"dependencies":[{"url":"http://example.com/a.css","#,
                        r#""content_type":"css","order_key":[0],"priority":3}],"future":true}"#
                    )
                    .as_bytes(),
                ),
            )
            .await;

        let mut page = PropertyPage::read(&store, "page").await;
        let mut dependencies = page.dependencies().clone();
        assert_eq!(dependencies.dependencies.len(), 1);
        assert_eq!(
            dependencies.dependencies[0].extra.get("priority"),
            Some(&Value::from(3))
        );
        dependencies.dependencies[0].order_key = vec![1];
        page.write_dependencies(&store, dependencies).await;

        let data = store.read("page", Cohort::Dependencies).await.unwrap();
        let value: Value = serde_json::from_slice(&data).unwrap();
        assert_eq!(value["future"], Value::from(true));
        assert_eq!(value["version"], Value::from(COHORT_VERSION));
        assert_eq!(value["dependencies"][0]["priority"], Value::from(3));
        assert_eq!(value["dependencies"][0]["order_key"][0], Value::from(1));
    }

    #[test(tokio::test)]
    async fn corrupt_cohort_ignored() {
        let store = MemoryPropertyStore::new();
        store
            .write("page", Cohort::Dom, Bytes::from_static(b"not json"))
            .await;
        let page = PropertyPage::read(&store, "page").await;
        assert_eq!(page.dom(), &DomCohort::default());
    }

    #[test(tokio::test)]
    async fn dom_written_only_when_changed() {
        let store = MemoryPropertyStore::new();
        let mut page = PropertyPage::read(&store, "page").await;
        page.write_dom(&store).await;
        assert!(store.read("page", Cohort::Dom).await.is_none());

        page.dom_mut()
            .beacons
            .entry(BeaconKind::CriticalImages)
            .or_default()
            .candidate_keys
            .push("abc".to_owned());
        page.write_dom(&store).await;
        let page = PropertyPage::read(&store, "page").await;
        assert_eq!(
            page.dom().beacons[&BeaconKind::CriticalImages].candidate_keys,
            vec!["abc".to_owned()]
        );
    }
}
