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

//! Input resources and the validity information recorded for them

use crate::cache::PurgeSet;
use crate::content_type::ContentType;
use crate::error::RewriteError;
use crate::headers::{has_cache_control_directive, CachingInfo};

use bytes::Bytes;
use http::header::{self, HeaderMap};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use url::Url;

/// How validity of an input is determined
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputType {
    /// Valid until the expiration time of the cached response
    Cached,
    /// Valid as long as the file wasn’t modified
    FileSystem,
    /// Never expires
    AlwaysValid,
}

/// Validity information for one input of a rewrite
///
/// Stored as part of cached results and dependency records. Unknown fields written by newer
/// versions are preserved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputInfo {
    /// Validity type
    #[serde(rename = "type")]
    pub input_type: InputType,
    /// Input URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Time the input expires
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration_time_ms: Option<i64>,
    /// Time the input was last modified
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified_ms: Option<i64>,
    /// Time the input was fetched, used for purge checks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_ms: Option<i64>,
    /// Position of the input among the rewrite’s inputs
    #[serde(default)]
    pub index: u32,
    /// Fields not known to this version
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl InputInfo {
    /// Creates validity information for an input that expires at the given time.
    pub fn cached(url: &str, index: u32, date_ms: i64, expiration_time_ms: i64) -> Self {
        Self {
            input_type: InputType::Cached,
            url: Some(url.to_owned()),
            expiration_time_ms: Some(expiration_time_ms),
            last_modified_ms: None,
            date_ms: Some(date_ms),
            index,
            extra: Map::new(),
        }
    }

    /// Checks whether the input is still valid at `now_ms`.
    pub fn is_valid(&self, now_ms: i64, purges: &PurgeSet) -> bool {
        match self.input_type {
            InputType::AlwaysValid => true,
            InputType::FileSystem | InputType::Cached => {
                if let (Some(url), Some(date_ms)) = (&self.url, self.date_ms) {
                    if !purges.is_valid(url, date_ms) {
                        return false;
                    }
                }
                self.expiration_time_ms
                    .map_or(self.input_type == InputType::FileSystem, |expiration| {
                        expiration > now_ms
                    })
            }
        }
    }

    /// Checks whether the input expired less than `threshold_ms` ago and hasn’t been purged.
    pub fn is_stale_within(&self, now_ms: i64, threshold_ms: i64, purges: &PurgeSet) -> bool {
        if threshold_ms <= 0 {
            return false;
        }
        let mut later = self.clone();
        later.expiration_time_ms = self
            .expiration_time_ms
            .map(|expiration| expiration + threshold_ms);
        later.is_valid(now_ms, purges)
    }
}

/// Outcome of loading a resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Not loaded yet
    NotYetLoaded,
    /// Taken from the HTTP cache
    Cached,
    /// Fetched from the origin
    Fetched,
    /// Loading failed
    Failed(RewriteError),
    /// The domain isn’t authorized
    Unauthorized,
}

/// An input resource of a rewrite. Immutable once loaded.
#[derive(Debug, Clone)]
pub struct Resource {
    url: Url,
    content_type: ContentType,
    outcome: FetchOutcome,
    contents: Bytes,
    headers: HeaderMap,
    caching: Option<CachingInfo>,
}

impl Resource {
    /// Creates a resource that hasn’t been loaded yet.
    pub fn new(url: Url) -> Self {
        let content_type = ContentType::from_path(url.path());
        Self {
            url,
            content_type,
            outcome: FetchOutcome::NotYetLoaded,
            contents: Bytes::new(),
            headers: HeaderMap::new(),
            caching: None,
        }
    }

    /// Creates a loaded resource. The content type is taken from the headers, falling back to
    /// the URL.
    pub fn loaded(
        url: Url,
        outcome: FetchOutcome,
        headers: HeaderMap,
        contents: Bytes,
        caching: CachingInfo,
    ) -> Self {
        let content_type = headers
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(ContentType::from_mime_type)
            .filter(|content_type| *content_type != ContentType::Other)
            .unwrap_or_else(|| ContentType::from_path(url.path()));
        Self {
            url,
            content_type,
            outcome,
            contents,
            headers,
            caching: Some(caching),
        }
    }

    /// Creates a resource that failed to load.
    pub fn failed(url: Url, outcome: FetchOutcome) -> Self {
        let mut resource = Self::new(url);
        resource.outcome = outcome;
        resource
    }

    /// Resource URL
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Content type
    pub fn content_type(&self) -> ContentType {
        self.content_type
    }

    /// Outcome of loading the resource
    pub fn outcome(&self) -> &FetchOutcome {
        &self.outcome
    }

    /// Checks whether contents are available.
    pub fn is_loaded(&self) -> bool {
        matches!(self.outcome, FetchOutcome::Cached | FetchOutcome::Fetched)
    }

    /// Resource contents, empty unless loaded
    pub fn contents(&self) -> &Bytes {
        &self.contents
    }

    /// Contents as text, invalid UTF-8 replaced
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.contents).into_owned()
    }

    /// Origin response headers
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Caching properties of the origin response
    pub fn caching(&self) -> Option<&CachingInfo> {
        self.caching.as_ref()
    }

    /// Checks whether the origin asked for the resource not to be transformed.
    pub fn has_no_transform(&self) -> bool {
        has_cache_control_directive(&self.headers, "no-transform")
    }

    /// Validity information for the rewrite input at position `index`
    pub fn input_info(&self, index: u32) -> InputInfo {
        let mut info = match &self.caching {
            Some(caching) => InputInfo::cached(
                self.url.as_str(),
                index,
                caching.date_ms,
                caching.expiration_ms,
            ),
            None => InputInfo::cached(self.url.as_str(), index, 0, 0),
        };
        info.last_modified_ms = self.caching.and_then(|caching| caching.last_modified_ms);
        info
    }
}
