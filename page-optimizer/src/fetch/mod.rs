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

//! Fetching input resources from the origin
//!
//! The optimizer doesn’t come with an HTTP client. Hosts provide an implementation of
//! [`UrlAsyncFetcher`], failures are reported as values rather than errors escaping the
//! rewriting machinery.

mod domain_lawyer;
mod file_fetcher;
mod rate_controller;

pub use domain_lawyer::DomainLawyer;
pub use file_fetcher::FileSystemFetcher;
pub use rate_controller::RateControllingFetcher;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use std::fmt::Debug;
use url::Url;

/// A request to the origin
#[derive(Debug, Clone)]
pub struct FetchRequest {
    /// Request method, `GET` unless this is a purge request
    pub method: Method,
    /// Absolute URL to be requested
    pub url: Url,
    /// Request headers to be sent
    pub headers: HeaderMap,
}

impl FetchRequest {
    /// Creates a `GET` request without any headers.
    pub fn get(url: Url) -> Self {
        Self {
            method: Method::GET,
            url,
            headers: HeaderMap::new(),
        }
    }
}

/// A complete origin response
#[derive(Debug, Clone)]
pub struct FetchResponse {
    /// Response status
    pub status: StatusCode,
    /// Response headers
    pub headers: HeaderMap,
    /// Response body
    pub body: Bytes,
}

impl FetchResponse {
    /// Creates a response with an empty body.
    pub fn empty(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }
}

/// Reasons a fetch didn’t produce a response
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    /// Connecting to the origin or reading the response failed
    #[error("fetch failed: {0}")]
    Failed(String),
    /// The origin didn’t respond in time
    #[error("fetch timed out")]
    Timeout,
    /// Too many requests to the same host are in progress
    #[error("too many concurrent fetches for {0}")]
    Overload(String),
}

/// Retrieves resources from the origin
#[async_trait]
pub trait UrlAsyncFetcher: Debug + Send + Sync {
    /// Performs a request. Responses with any status code are returned as `Ok`.
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, FetchError>;
}
