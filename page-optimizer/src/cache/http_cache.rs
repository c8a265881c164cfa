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

//! HTTP response cache on top of a [`CacheInterface`]
//!
//! Stores origin responses of input resources as well as the rewritten resources themselves.
//! Failed fetches and uncacheable responses are remembered for a while so that they aren’t
//! retried on every request.

use super::{CacheInterface, PurgeSet};
use crate::timer::Timer;

use bytes::{BufMut, Bytes, BytesMut};
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::StatusCode;
use log::{debug, trace};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// How long failed fetches are remembered
pub const REMEMBER_FETCH_FAILED_TTL_MS: i64 = 300_000;

/// How long uncacheable responses are remembered
pub const REMEMBER_NOT_CACHEABLE_TTL_MS: i64 = 300_000;

/// A cached HTTP response
#[derive(Debug, Clone, PartialEq)]
pub struct HttpValue {
    /// Response status
    pub status: StatusCode,
    /// Response headers
    pub headers: HeaderMap,
    /// Response body
    pub body: Bytes,
    /// Time the response was produced
    pub date_ms: i64,
    /// Time the response expires
    pub expiration_ms: i64,
}

/// Result of a cache lookup
#[derive(Debug, Clone, PartialEq)]
pub enum FindResult {
    /// A valid response was found
    Found(HttpValue),
    /// Nothing usable in the cache
    NotFound,
    /// Fetching this URL failed recently
    RecentFetchFailed,
    /// This URL was recently found to be uncacheable
    RecentNotCacheable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum EntryKind {
    Response,
    FetchFailed,
    NotCacheable,
}

#[derive(Debug, Serialize, Deserialize)]
struct EntryMeta {
    kind: EntryKind,
    status: u16,
    headers: Vec<(String, String)>,
    date_ms: i64,
    expiration_ms: i64,
}

fn encode(meta: &EntryMeta, body: &[u8]) -> Option<Bytes> {
    let meta = serde_json::to_vec(meta).ok()?;
    let meta_len = u32::try_from(meta.len()).ok()?;
    let mut buffer = BytesMut::with_capacity(4 + meta.len() + body.len());
    buffer.put_u32(meta_len);
    buffer.put_slice(&meta);
    buffer.put_slice(body);
    Some(buffer.freeze())
}

fn decode(data: Bytes) -> Option<(EntryMeta, Bytes)> {
    let len_bytes = data.get(0..4)?;
    let meta_len = u32::from_be_bytes(len_bytes.try_into().ok()?) as usize;
    let meta = serde_json::from_slice(data.get(4..4 + meta_len)?).ok()?;
    Some((meta, data.slice(4 + meta_len..)))
}

/// HTTP cache keyed by URL and cache fragment
#[derive(Debug, Clone)]
pub struct HttpCache {
    cache: Arc<dyn CacheInterface>,
    timer: Arc<dyn Timer>,
    purges: Arc<PurgeSet>,
}

impl HttpCache {
    /// Creates a new HTTP cache.
    pub fn new(
        cache: Arc<dyn CacheInterface>,
        timer: Arc<dyn Timer>,
        purges: Arc<PurgeSet>,
    ) -> Self {
        Self {
            cache,
            timer,
            purges,
        }
    }

    fn key(url: &str, fragment: &str) -> String {
        if fragment.is_empty() {
            url.to_owned()
        } else {
            format!("{fragment}/{url}")
        }
    }

    /// Looks up a URL.
    pub async fn find(&self, url: &str, fragment: &str) -> FindResult {
        let key = Self::key(url, fragment);
        let Some(data) = self.cache.get(&key).await else {
            trace!("HTTP cache miss for {key}");
            return FindResult::NotFound;
        };

        let Some((meta, body)) = decode(data) else {
            debug!("Corrupt HTTP cache entry for {key}, ignoring");
            return FindResult::NotFound;
        };

        let now_ms = self.timer.now_ms();
        if meta.expiration_ms <= now_ms || !self.purges.is_valid(url, meta.date_ms) {
            trace!("HTTP cache entry for {key} expired");
            return FindResult::NotFound;
        }

        match meta.kind {
            EntryKind::FetchFailed => FindResult::RecentFetchFailed,
            EntryKind::NotCacheable => FindResult::RecentNotCacheable,
            EntryKind::Response => {
                let mut headers = HeaderMap::new();
                for (name, value) in meta.headers {
                    if let (Ok(name), Ok(value)) = (
                        HeaderName::from_bytes(name.as_bytes()),
                        HeaderValue::from_str(&value),
                    ) {
                        headers.append(name, value);
                    }
                }
                FindResult::Found(HttpValue {
                    status: StatusCode::from_u16(meta.status).unwrap_or(StatusCode::OK),
                    headers,
                    body,
                    date_ms: meta.date_ms,
                    expiration_ms: meta.expiration_ms,
                })
            }
        }
    }

    async fn store(&self, url: &str, fragment: &str, meta: EntryMeta, body: &[u8]) {
        let key = Self::key(url, fragment);
        if let Some(data) = encode(&meta, body) {
            trace!("Storing {:?} in HTTP cache for {key}", meta.kind);
            self.cache.put(&key, data).await;
        }
    }

    /// Stores a response.
    pub async fn put(&self, url: &str, fragment: &str, value: &HttpValue) {
        let meta = EntryMeta {
            kind: EntryKind::Response,
            status: value.status.as_u16(),
            headers: value
                .headers
                .iter()
                .filter_map(|(name, value)| {
                    Some((name.as_str().to_owned(), value.to_str().ok()?.to_owned()))
                })
                .collect(),
            date_ms: value.date_ms,
            expiration_ms: value.expiration_ms,
        };
        self.store(url, fragment, meta, &value.body).await;
    }

    async fn remember(&self, url: &str, fragment: &str, kind: EntryKind, ttl_ms: i64) {
        let now_ms = self.timer.now_ms();
        let meta = EntryMeta {
            kind,
            status: 0,
            headers: Vec::new(),
            date_ms: now_ms,
            expiration_ms: now_ms + ttl_ms,
        };
        self.store(url, fragment, meta, &[]).await;
    }

    /// Records that fetching a URL failed.
    pub async fn remember_fetch_failed(&self, url: &str, fragment: &str) {
        self.remember(url, fragment, EntryKind::FetchFailed, REMEMBER_FETCH_FAILED_TTL_MS)
            .await;
    }

    /// Records that a URL cannot be cached.
    pub async fn remember_not_cacheable(&self, url: &str, fragment: &str) {
        self.remember(
            url,
            fragment,
            EntryKind::NotCacheable,
            REMEMBER_NOT_CACHEABLE_TTL_MS,
        )
        .await;
    }
}
