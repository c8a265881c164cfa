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

//! Error types

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Errors surfaced to the host application
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A configuration file could not be opened
    #[error("failed opening configuration file {path:?}: {source}")]
    ConfigOpen {
        /// Path of the configuration file
        path: PathBuf,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// A configuration file could not be parsed
    #[error("failed reading configuration file: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// Configuration was parsed but contains values outside the permitted range
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// I/O error, typically produced by the file system fetcher or the writer
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Processing of the current response was aborted, remaining input is passed through
    /// unmodified
    #[error("response processing aborted: {0}")]
    Aborted(String),
}

/// Reasons a resource rewrite did not produce optimized output
///
/// Each of these results in the original URL being kept in the document. Some of them are
/// recorded in the metadata cache so that the next request doesn’t repeat the work.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "snake_case")]
pub enum RewriteError {
    /// Input resource (URL given) is on a domain that isn’t authorized for rewriting
    #[error("input resource {0} not authorized")]
    NotAuthorized(String),
    /// Input resource (URL given) could not be fetched, for the reason given
    #[error("fetching input resource {0} failed: {1}")]
    FetchFailed(String, String),
    /// Input resource cannot be cached and therefore cannot be rewritten
    #[error("input resource is not cacheable")]
    NotCacheable,
    /// Input resource could not be parsed or transformed
    #[error("input resource could not be parsed")]
    ParseFailed,
    /// Too many concurrent rewrites, the rewrite was dropped
    #[error("too many concurrent rewrites")]
    Overload,
    /// Rewrite was dropped randomly to spread load
    #[error("rewrite dropped")]
    Dropped,
    /// Rewrite did not complete in time
    #[error("rewrite deadline exceeded")]
    DeadlineExceeded,
    /// A `.pagespeed.` URL could not be decoded
    #[error("corrupt rewritten URL")]
    CorruptUrl,
    /// Input or output exceeds a configured size limit
    #[error("size limit exceeded")]
    SizeLimitExceeded,
    /// Origin asked for content not to be transformed
    #[error("origin requested no-transform")]
    NoTransformRequested,
}

impl RewriteError {
    /// Determines whether this failure should be remembered in the metadata cache.
    ///
    /// Failures that depend on momentary conditions (load, deadlines, randomness) must not be
    /// cached, otherwise a single busy moment would disable the rewrite until the inputs expire.
    pub fn is_cacheable(&self) -> bool {
        matches!(
            self,
            Self::FetchFailed(..)
                | Self::NotCacheable
                | Self::ParseFailed
                | Self::SizeLimitExceeded
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_failures_not_cached() {
        assert!(!RewriteError::Overload.is_cacheable());
        assert!(!RewriteError::Dropped.is_cacheable());
        assert!(!RewriteError::DeadlineExceeded.is_cacheable());
        assert!(!RewriteError::NotAuthorized("http://example.net/".to_owned()).is_cacheable());
        assert!(RewriteError::FetchFailed(
            "http://example.com/a.css".to_owned(),
            "status 404 Not Found".to_owned()
        )
        .is_cacheable());
        assert!(RewriteError::ParseFailed.is_cacheable());
    }

    #[test]
    fn serialized_names() {
        assert_eq!(
            serde_json::to_string(&RewriteError::ParseFailed).unwrap(),
            "\"parse_failed\""
        );
        let error = RewriteError::FetchFailed(
            "http://example.com/a.css".to_owned(),
            "timed out".to_owned(),
        );
        assert_eq!(
            serde_json::to_string(&error).unwrap(),
            "{\"fetch_failed\":[\"http://example.com/a.css\",\"timed out\"]}"
        );
        assert_eq!(
            error.to_string(),
            "fetching input resource http://example.com/a.css failed: timed out"
        );
        assert_eq!(
            serde_json::from_str::<RewriteError>("\"overload\"").unwrap(),
            RewriteError::Overload
        );
    }
}
