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

//! Resource rewriting
//!
//! A rewrite takes one or more input resources and produces an optimized output resource
//! (published under a `.pagespeed.` URL) or data to be inlined into the document. Results are
//! kept in the metadata cache under a key derived from the inputs, the rewriter and the options
//! signature, so that identical rewrites are only performed once.

mod combining;
mod context;
mod images;
mod passthrough;
mod scripts;
mod slot;
mod stylesheets;

pub(crate) use context::{initiate, initiate_fresh, load_input, RewriteHandle};
pub(crate) use slot::{parse_srcset, serialize_srcset, Slot, SlotLocation};

use crate::configuration::{NestedDeadlinePolicy, RewriteOptions};
use crate::content_type::ContentType;
use crate::error::RewriteError;
use crate::hasher::hash_parts;
use crate::image::Dimensions;
use crate::property_cache::Dependency;
use crate::registry::Filter;
use crate::resource::{InputInfo, Resource};
use crate::server_context::ServerContext;
use crate::url_namer::ImageDims;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout_at, Instant};
use url::Url;

/// Format version of [`CachedResult`]
pub(crate) const RESULT_VERSION: u32 = 1;

/// Resource transformations, identified by the id in rewritten URLs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RewriterId {
    /// Image recompression, resizing, conversion and inlining
    Image,
    /// CSS minification and rewriting of nested images
    Css,
    /// JavaScript minification
    Javascript,
    /// Combining multiple stylesheets
    CombineCss,
    /// Combining multiple scripts
    CombineJavascript,
    /// Renaming for long caching without changes
    CacheExtend,
    /// Inlining a stylesheet into the document
    InlineCss,
    /// Inlining a script into the document
    InlineJavascript,
    /// Loading a resource to record it as a dependency of the document
    CollectDependency,
}

impl RewriterId {
    /// Id used in rewritten URLs and cache keys
    pub fn id(self) -> &'static str {
        match self {
            Self::Image => "ic",
            Self::Css => "cf",
            Self::Javascript => "jm",
            Self::CombineCss => "cc",
            Self::CombineJavascript => "jc",
            Self::CacheExtend => "ce",
            Self::InlineCss => "ci",
            Self::InlineJavascript => "ji",
            Self::CollectDependency => "cd",
        }
    }

    /// Finds the rewriter producing URLs with the given id. Only rewriters publishing
    /// resources are found.
    pub fn from_id(id: &str) -> Option<Self> {
        [
            Self::Image,
            Self::Css,
            Self::Javascript,
            Self::CombineCss,
            Self::CombineJavascript,
            Self::CacheExtend,
        ]
        .into_iter()
        .find(|rewriter| rewriter.id() == id)
    }

    /// Filters whose activity enables this rewriter
    pub fn filters(self) -> &'static [Filter] {
        match self {
            Self::Image => &[
                Filter::RecompressImages,
                Filter::ResizeImages,
                Filter::ConvertToWebp,
                Filter::InlineImages,
            ],
            Self::Css => &[Filter::RewriteCss],
            Self::Javascript => &[Filter::RewriteJavascript],
            Self::CombineCss => &[Filter::CombineCss],
            Self::CombineJavascript => &[Filter::CombineJavascript],
            Self::CacheExtend => &[Filter::CacheExtendImages],
            Self::InlineCss => &[Filter::InlineCss],
            Self::InlineJavascript => &[Filter::InlineJavascript],
            Self::CollectDependency => &[Filter::CollectDependencies],
        }
    }

    /// Checks whether any filter enabling this rewriter is active.
    pub fn is_enabled(self, options: &RewriteOptions) -> bool {
        self.filters().iter().any(|filter| options.is_enabled(*filter))
    }

    fn is_order_sensitive(self) -> bool {
        matches!(self, Self::CombineCss | Self::CombineJavascript)
    }
}

/// Request properties changing the rewrite result
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct RewriteParams {
    /// Dimensions the image is displayed with
    pub dims: ImageDims,
    /// Client accepts WebP images
    pub webp: bool,
    /// Client asked to save data
    pub save_data: bool,
    /// Result may be inlined into the document
    pub inline: bool,
}

impl RewriteParams {
    fn fingerprint(&self) -> String {
        format!(
            "{}{}{}{}",
            self.dims.encode_prefix(),
            u8::from(self.webp),
            u8::from(self.save_data),
            u8::from(self.inline)
        )
    }
}

/// A rewrite to be performed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewriteRequest {
    /// Transformation
    pub id: RewriterId,
    /// Absolute input URLs, in document order
    pub inputs: Vec<Url>,
    /// Request dependent parameters
    pub params: RewriteParams,
    /// URL of the document or resource referencing the inputs, for authorization
    pub base: Url,
}

impl RewriteRequest {
    /// Creates a request with default parameters.
    pub fn new(id: RewriterId, inputs: Vec<Url>, base: Url) -> Self {
        Self {
            id,
            inputs,
            params: RewriteParams::default(),
            base,
        }
    }

    /// Replaces the request parameters.
    pub fn with_params(mut self, params: RewriteParams) -> Self {
        self.params = params;
        self
    }

    /// Metadata cache key: rewriter id, options signature and a hash of the sorted input URLs
    /// and parameters. Combiners also hash the input order.
    pub fn metadata_key(&self, options: &RewriteOptions) -> String {
        let mut inputs = self.inputs.iter().map(Url::as_str).collect::<Vec<_>>();
        let order = if self.id.is_order_sensitive() {
            inputs.join("\n")
        } else {
            String::new()
        };
        inputs.sort_unstable();

        let params = self.params.fingerprint();
        let mut parts = inputs;
        parts.push(&params);
        parts.push(&order);

        let key = format!(
            "MD.{}.{}.{}",
            self.id.id(),
            options.signature(),
            hash_parts(&parts)
        );
        if options.cache_fragment.is_empty() {
            key
        } else {
            format!("{}/{key}", options.cache_fragment)
        }
    }
}

/// Rewrite result as stored in the metadata cache
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CachedResult {
    /// Format version
    #[serde(default)]
    pub version: u32,
    /// Whether the output should replace the input
    #[serde(default)]
    pub optimizable: bool,
    /// URL of the published output
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Content hash of the published output
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    /// Content type of the output
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<ContentType>,
    /// Data to be placed into the document instead of a URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inlined_data: Option<String>,
    /// Reason the rewrite failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RewriteError>,
    /// Validity of every input, including those of nested rewrites
    #[serde(default)]
    pub inputs: Vec<InputInfo>,
    /// Dimensions of the original image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dims: Option<Dimensions>,
    /// Resources the input itself depends on
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<Dependency>,
    /// Request headers the output depends on
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub vary: Vec<String>,
    /// Fields unknown to this version
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Outcome of a rewrite as delivered to whoever waits for it
#[derive(Debug, Clone, Default)]
pub struct RewriteOutcome {
    /// The (possibly cached) result
    pub result: CachedResult,
    /// Output bytes, only present if the rewrite was performed just now
    pub contents: Option<Bytes>,
}

impl RewriteOutcome {
    pub(crate) fn failed(error: RewriteError) -> Self {
        Self {
            result: CachedResult {
                version: RESULT_VERSION,
                error: Some(error),
                ..Default::default()
            },
            contents: None,
        }
    }

    pub(crate) fn cached(result: CachedResult) -> Self {
        Self {
            result,
            contents: None,
        }
    }

    /// URL replacing the input URL, if the rewrite succeeded
    pub fn url(&self) -> Option<&str> {
        self.result
            .url
            .as_deref()
            .filter(|_| self.result.optimizable)
    }

    /// Data replacing the input reference, if the result should be inlined
    pub fn inlined_data(&self) -> Option<&str> {
        self.result.inlined_data.as_deref()
    }

    /// Failure reason
    pub fn error(&self) -> Option<&RewriteError> {
        self.result.error.as_ref()
    }
}

/// What a rewriter produced
#[derive(Debug, Default)]
pub(crate) struct RewriteOutput {
    pub(crate) contents: Bytes,
    pub(crate) content_type: Option<ContentType>,
    /// Output should replace the input
    pub(crate) optimizable: bool,
    /// Output gets its own URL
    pub(crate) publish: bool,
    /// Leaf name without id, hash and extension, derived from the inputs if missing
    pub(crate) name: Option<String>,
    pub(crate) inlined_data: Option<String>,
    pub(crate) dims: Option<Dimensions>,
    pub(crate) dependencies: Vec<Dependency>,
    pub(crate) vary: Vec<String>,
}

/// A resource transformation
#[async_trait]
pub(crate) trait ResourceRewriter: Send + Sync {
    /// Transforms the loaded inputs of a job.
    async fn rewrite(&self, job: &mut RewriteJob) -> Result<RewriteOutput, RewriteError>;
}

pub(crate) fn rewriter_for(id: RewriterId) -> &'static dyn ResourceRewriter {
    match id {
        RewriterId::Image => &images::ImageRewriter,
        RewriterId::Css => &stylesheets::CssRewriter,
        RewriterId::Javascript => &scripts::JavascriptRewriter,
        RewriterId::CombineCss => &combining::CssCombiner,
        RewriterId::CombineJavascript => &combining::JavascriptCombiner,
        RewriterId::CacheExtend => &passthrough::CacheExtender,
        RewriterId::InlineCss => &passthrough::CssInliner,
        RewriterId::InlineJavascript => &passthrough::JavascriptInliner,
        RewriterId::CollectDependency => &passthrough::DependencyCollector,
    }
}

/// A rewrite with its inputs loaded
pub(crate) struct RewriteJob {
    pub(crate) server: Arc<ServerContext>,
    pub(crate) options: Arc<RewriteOptions>,
    pub(crate) request: RewriteRequest,
    pub(crate) inputs: Vec<Resource>,
    nested_inputs: Vec<InputInfo>,
    children_abandoned: bool,
}

impl RewriteJob {
    pub(crate) fn new(
        server: Arc<ServerContext>,
        options: Arc<RewriteOptions>,
        request: RewriteRequest,
        inputs: Vec<Resource>,
    ) -> Self {
        Self {
            server,
            options,
            request,
            inputs,
            nested_inputs: Vec::new(),
            children_abandoned: false,
        }
    }

    /// Runs rewrites of resources referenced by the inputs. Depending on the nested deadline
    /// policy, either waits for all of them or gives each the rewrite deadline. Nested rewrites
    /// exceeding their deadline produce `None`, and the result of this job won’t be cached.
    pub(crate) async fn rewrite_nested(
        &mut self,
        requests: Vec<RewriteRequest>,
    ) -> Vec<Option<Arc<RewriteOutcome>>> {
        let handles = requests
            .into_iter()
            .map(|request| initiate(&self.server, &self.options, request, false))
            .collect::<Vec<_>>();
        let deadline = match self.options.nested_deadline_policy {
            NestedDeadlinePolicy::Parent => None,
            NestedDeadlinePolicy::Child => {
                Some(Instant::now() + Duration::from_millis(self.options.rewrite_deadline_ms))
            }
        };

        let mut outcomes = Vec::with_capacity(handles.len());
        for handle in handles {
            let outcome = match deadline {
                Some(deadline) => timeout_at(deadline, handle.wait()).await.ok(),
                None => Some(handle.wait().await),
            };
            match &outcome {
                Some(outcome) => {
                    for info in &outcome.result.inputs {
                        let mut info = info.clone();
                        info.index = (self.inputs.len() + self.nested_inputs.len()) as u32;
                        self.nested_inputs.push(info);
                    }
                }
                None => self.children_abandoned = true,
            }
            outcomes.push(outcome);
        }
        outcomes
    }

    /// Splits the job into request, inputs, validity of nested inputs and whether nested
    /// rewrites were abandoned.
    pub(crate) fn into_parts(self) -> (RewriteRequest, Vec<Resource>, Vec<InputInfo>, bool) {
        (
            self.request,
            self.inputs,
            self.nested_inputs,
            self.children_abandoned,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn rewriter_ids() {
        assert_eq!(RewriterId::from_id("cf"), Some(RewriterId::Css));
        assert_eq!(RewriterId::from_id("ic"), Some(RewriterId::Image));
        assert_eq!(RewriterId::from_id("ci"), None);
        assert_eq!(RewriterId::from_id("xx"), None);
    }

    #[test]
    fn metadata_keys() {
        let options = RewriteOptions::default();
        let base = url("http://example.com/");
        let a = url("http://example.com/a.css");
        let b = url("http://example.com/b.css");

        let request = RewriteRequest::new(RewriterId::Css, vec![a.clone()], base.clone());
        let key = request.metadata_key(&options);
        assert!(key.starts_with(&format!("MD.cf.{}.", options.signature())));
        assert_eq!(key, request.metadata_key(&options));

        let other = RewriteRequest::new(RewriterId::Javascript, vec![a.clone()], base.clone());
        assert_ne!(key, other.metadata_key(&options));

        let params = RewriteParams {
            save_data: true,
            ..Default::default()
        };
        assert_ne!(key, request.clone().with_params(params).metadata_key(&options));

        let ab = RewriteRequest::new(
            RewriterId::CombineCss,
            vec![a.clone(), b.clone()],
            base.clone(),
        );
        let ba = RewriteRequest::new(RewriterId::CombineCss, vec![b, a], base);
        assert_ne!(ab.metadata_key(&options), ba.metadata_key(&options));

        let options = RewriteOptions {
            cache_fragment: "shard".to_owned(),
            ..Default::default()
        };
        assert!(request.metadata_key(&options).starts_with("shard/MD.cf."));
    }

    #[test]
    fn result_keeps_unknown_fields() {
        let json = concat!(
            r#"{"version":1,"optimizable":true,"#,
            r#""url":"http://example.com/a.css.pagespeed.cf.0123456789.css","#,
            r#""inputs":[],"future":42}"#
        );
        let result: CachedResult = serde_json::from_str(json).unwrap();
        assert!(result.optimizable);
        assert_eq!(result.extra.get("future"), Some(&Value::from(42)));
        let serialized = serde_json::to_string(&result).unwrap();
        assert!(serialized.contains("\"future\":42"));
    }
}
