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

//! Tracking of the subresources a document references
//!
//! Dependencies are registered when their element is seen, their validity arrives with the
//! outcome of a dependency collection rewrite and their final URL is read from the document
//! right before it is written out, after all other filters changed it.

use log::trace;
use serde_json::Map;
use std::collections::HashMap;
use url::Url;

use crate::cache::PurgeSet;
use crate::content_type::ContentType;
use crate::html::{Document, NodeId};
use crate::property_cache::Dependency;
use crate::resource::InputInfo;
use crate::rewrite::RewriteOutcome;

#[derive(Debug)]
struct TrackedDependency {
    node: NodeId,
    attribute: String,
    content_type: ContentType,
    order: i32,
    url: Option<String>,
    validity: Vec<InputInfo>,
    nested: Vec<Dependency>,
    captured: bool,
}

/// Dependencies of the document currently being rewritten
#[derive(Debug, Default)]
pub(crate) struct DependencyTracker {
    entries: Vec<TrackedDependency>,
}

impl DependencyTracker {
    /// Registers the resource referenced by an element attribute, returns its id.
    pub(crate) fn register(
        &mut self,
        node: NodeId,
        attribute: &str,
        content_type: ContentType,
    ) -> usize {
        let id = self.entries.len();
        self.entries.push(TrackedDependency {
            node,
            attribute: attribute.to_owned(),
            content_type,
            order: id as i32,
            url: None,
            validity: Vec::new(),
            nested: Vec::new(),
            captured: false,
        });
        id
    }

    /// Records the outcome of the dependency collection for a registered resource.
    pub(crate) fn set_result(&mut self, id: usize, outcome: Option<&RewriteOutcome>) {
        let Some(entry) = self.entries.get_mut(id) else {
            return;
        };
        match outcome {
            Some(outcome) if outcome.error().is_none() => {
                entry.validity = outcome.result.inputs.clone();
                entry.nested = outcome.result.dependencies.clone();
            }
            _ => {
                entry.validity.clear();
                entry.nested.clear();
            }
        }
    }

    /// Reads the final URLs of dependencies whose elements are about to be written.
    pub(crate) fn capture(&mut self, doc: &Document, base: &Url) {
        for entry in self.entries.iter_mut().filter(|entry| !entry.captured) {
            entry.captured = true;
            if !doc.is_attached(entry.node) {
                trace!("Dependency element removed from the document");
                continue;
            }
            entry.url = doc
                .attribute(entry.node, &entry.attribute)
                .filter(|value| !value.starts_with("data:"))
                .and_then(|value| base.join(value.trim()).ok())
                .map(String::from);
        }
    }

    /// Dependencies with known URL and validity, nested ones following their parent.
    pub(crate) fn dependencies(&self) -> Vec<Dependency> {
        let mut result = Vec::new();
        for entry in &self.entries {
            let Some(url) = &entry.url else {
                continue;
            };
            if entry.validity.is_empty() {
                continue;
            }
            result.push(Dependency {
                url: url.clone(),
                content_type: entry.content_type,
                validity_info: entry.validity.clone(),
                order_key: vec![entry.order],
                extra: Map::new(),
            });
            for nested in &entry.nested {
                let mut nested = nested.clone();
                nested.order_key.insert(0, entry.order);
                result.push(nested);
            }
        }
        result
    }
}

/// Checks whether all inputs a dependency was produced from are still valid.
pub(crate) fn is_valid(dependency: &Dependency, now_ms: i64, purges: &PurgeSet) -> bool {
    !dependency.validity_info.is_empty()
        && dependency
            .validity_info
            .iter()
            .all(|info| info.is_valid(now_ms, purges))
}

/// Combines the stored dependencies with those of the current response. Entries of the
/// current response replace stored entries with the same URL, stored entries that are no
/// longer valid are dropped. The result is sorted by order key.
pub(crate) fn merge(
    previous: &[Dependency],
    current: Vec<Dependency>,
    now_ms: i64,
    purges: &PurgeSet,
) -> Vec<Dependency> {
    let mut by_url = HashMap::new();
    let mut result = Vec::new();
    for dependency in previous.iter().cloned().chain(current) {
        if !is_valid(&dependency, now_ms, purges) {
            continue;
        }
        match by_url.get(&dependency.url) {
            Some(&index) => result[index] = dependency,
            None => {
                by_url.insert(dependency.url.clone(), result.len());
                result.push(dependency);
            }
        }
    }
    result.sort_by(|a, b| a.order_key.cmp(&b.order_key));
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::html::NodeKind;
    use crate::rewrite::CachedResult;

    use test_log::test;

    const NOW: i64 = 1_000_000;

    fn dependency(url: &str, order: i32, expiration: i64) -> Dependency {
        Dependency {
            url: url.to_owned(),
            content_type: ContentType::Css,
            validity_info: vec![InputInfo::cached(url, 0, 1, expiration)],
            order_key: vec![order],
            extra: Map::new(),
        }
    }

    #[test]
    fn capture_reads_final_url() {
        let base = Url::parse("http://example.com/dir/page.html").unwrap();
        let mut doc = Document::new();
        let link = doc.push_node(NodeKind::element("link", &[("href", "a.css")]));
        let gone = doc.push_node(NodeKind::element("link", &[("href", "b.css")]));

        let mut tracker = DependencyTracker::default();
        let first = tracker.register(link, "href", ContentType::Css);
        let second = tracker.register(gone, "href", ContentType::Css);

        let outcome = RewriteOutcome::cached(CachedResult {
            inputs: vec![InputInfo::cached("http://example.com/dir/a.css", 0, 0, NOW * 2)],
            dependencies: vec![dependency("http://example.com/dir/c.css", 0, NOW * 2)],
            ..Default::default()
        });
        tracker.set_result(first, Some(&outcome));
        tracker.set_result(second, Some(&outcome));

        doc.set_attribute(link, "href", "A.a.css.pagespeed.cf.0123456789.css");
        doc.delete_node(gone);
        tracker.capture(&doc, &base);

        let dependencies = tracker.dependencies();
        assert_eq!(dependencies.len(), 2);
        assert_eq!(
            dependencies[0].url,
            "http://example.com/dir/A.a.css.pagespeed.cf.0123456789.css"
        );
        assert_eq!(dependencies[1].url, "http://example.com/dir/c.css");
        assert_eq!(dependencies[1].order_key, vec![0, 0]);
    }

    #[test]
    fn missing_results_dropped() {
        let base = Url::parse("http://example.com/").unwrap();
        let mut doc = Document::new();
        let script = doc.push_node(NodeKind::element("script", &[("src", "a.js")]));

        let mut tracker = DependencyTracker::default();
        let id = tracker.register(script, "src", ContentType::Javascript);
        tracker.set_result(id, None);
        tracker.capture(&doc, &base);
        assert!(tracker.dependencies().is_empty());
    }

    #[test]
    fn merging() {
        let purges = PurgeSet::new();
        let previous = vec![
            dependency("http://example.com/old.css", 5, NOW * 2),
            dependency("http://example.com/expired.css", 0, NOW - 1),
            dependency("http://example.com/a.css", 3, NOW * 2),
        ];
        let current = vec![dependency("http://example.com/a.css", 1, NOW * 2)];

        let merged = merge(&previous, current, NOW, &purges);
        let urls = merged.iter().map(|d| d.url.as_str()).collect::<Vec<_>>();
        assert_eq!(
            urls,
            vec!["http://example.com/a.css", "http://example.com/old.css"]
        );
        assert_eq!(merged[0].order_key, vec![1]);

        purges.purge_all(NOW);
        assert!(merge(&merged, Vec::new(), NOW + 1, &purges).is_empty());
    }
}
