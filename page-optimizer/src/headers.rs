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

//! Response header handling and caching semantics

use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::StatusCode;
use httpdate::parse_http_date;
use log::warn;
use std::time::{Duration, UNIX_EPOCH};

/// Response headers that can no longer be changed once sent
///
/// Every mutation after [`ResponseHeaders::commit`] is dropped with a warning and reported as
/// unsuccessful.
#[derive(Debug, Clone)]
pub struct ResponseHeaders {
    status: StatusCode,
    headers: HeaderMap,
    committed: bool,
}

impl Default for ResponseHeaders {
    fn default() -> Self {
        Self::new(StatusCode::OK)
    }
}

impl ResponseHeaders {
    /// Creates an empty header set with the given status code.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            committed: false,
        }
    }

    /// Wraps existing headers.
    pub fn from_headers(status: StatusCode, headers: HeaderMap) -> Self {
        Self {
            status,
            headers,
            committed: false,
        }
    }

    /// Response status
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Read-only access to the headers
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Retrieves the value of a header if it is present and valid UTF-8. If the header is
    /// present multiple times, the first value is returned.
    pub fn get_str(&self, name: impl header::AsHeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    /// Checks whether a header is present.
    pub fn contains(&self, name: impl header::AsHeaderName) -> bool {
        self.headers.contains_key(name)
    }

    /// Marks headers as sent. Further changes will be rejected.
    pub fn commit(&mut self) {
        self.committed = true;
    }

    /// Checks whether the headers were sent already.
    pub fn is_committed(&self) -> bool {
        self.committed
    }

    fn check_mutable(&self, name: &HeaderName) -> bool {
        if self.committed {
            warn!("Dropping change to response header {name}, headers already sent");
            false
        } else {
            true
        }
    }

    fn parse_value(name: &HeaderName, value: &str) -> Option<HeaderValue> {
        match HeaderValue::from_str(value) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!("Dropping invalid value for response header {name}: {err}");
                None
            }
        }
    }

    /// Replaces all values of a header. Returns `false` if the change was dropped.
    pub fn set(&mut self, name: HeaderName, value: &str) -> bool {
        if !self.check_mutable(&name) {
            return false;
        }
        let Some(value) = Self::parse_value(&name, value) else {
            return false;
        };
        self.headers.insert(name, value);
        true
    }

    /// Adds another value for a header. Returns `false` if the change was dropped.
    pub fn add(&mut self, name: HeaderName, value: &str) -> bool {
        if !self.check_mutable(&name) {
            return false;
        }
        let Some(value) = Self::parse_value(&name, value) else {
            return false;
        };
        self.headers.append(name, value);
        true
    }

    /// Removes a header. Returns `false` if the change was dropped.
    pub fn remove(&mut self, name: HeaderName) -> bool {
        if !self.check_mutable(&name) {
            return false;
        }
        self.headers.remove(name);
        true
    }

    /// Adds a value to the `Vary` header unless already listed. `Vary` is always treated as
    /// additive, existing values are kept.
    pub fn add_vary(&mut self, value: &str) -> bool {
        let mut values = self
            .headers
            .get_all(header::VARY)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(','))
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(ToOwned::to_owned)
            .collect::<Vec<_>>();
        if values.iter().any(|v| v.eq_ignore_ascii_case(value)) {
            return true;
        }
        values.push(value.to_owned());
        self.set(header::VARY, &values.join(", "))
    }

    /// Checks whether the `Cache-Control` header contains the given directive.
    pub fn has_cache_control_directive(&self, directive: &str) -> bool {
        has_cache_control_directive(&self.headers, directive)
    }
}

/// Iterates over all directives of all `Cache-Control` headers, directive names lowercased.
fn cache_control_directives(
    headers: &HeaderMap,
) -> impl Iterator<Item = (String, Option<String>)> + '_ {
    headers
        .get_all(header::CACHE_CONTROL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|directive| {
            let directive = directive.trim();
            if directive.is_empty() {
                return None;
            }
            let (name, value) = match directive.split_once('=') {
                Some((name, value)) => (name.trim(), Some(value.trim().trim_matches('"'))),
                None => (directive, None),
            };
            Some((name.to_ascii_lowercase(), value.map(ToOwned::to_owned)))
        })
}

/// Checks whether the `Cache-Control` header contains the given directive.
pub fn has_cache_control_directive(headers: &HeaderMap, directive: &str) -> bool {
    cache_control_directives(headers).any(|(name, _)| name == directive)
}

fn parse_date_ms(headers: &HeaderMap, name: HeaderName) -> Option<i64> {
    let value = headers.get(name)?.to_str().ok()?;
    let time = parse_http_date(value).ok()?;
    let millis = time.duration_since(UNIX_EPOCH).ok()?.as_millis();
    i64::try_from(millis).ok()
}

/// Formats milliseconds since the Unix epoch as an HTTP date.
pub fn format_http_date_ms(time_ms: i64) -> String {
    let time = UNIX_EPOCH + Duration::from_millis(u64::try_from(time_ms).unwrap_or(0));
    httpdate::fmt_http_date(time)
}

/// Caching properties derived from origin response headers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachingInfo {
    /// Whether the response may be stored and reused
    pub cacheable: bool,
    /// Whether only private caches may store the response
    pub private: bool,
    /// `Cache-Control: no-transform` is present
    pub no_transform: bool,
    /// Time the response was produced
    pub date_ms: i64,
    /// Time the response expires
    pub expiration_ms: i64,
    /// Value of the `Last-Modified` header if any
    pub last_modified_ms: Option<i64>,
}

impl CachingInfo {
    /// Computes caching properties. Responses without explicit freshness information are
    /// considered fresh for `implicit_ttl_ms`.
    pub fn from_headers(
        status: StatusCode,
        headers: &HeaderMap,
        now_ms: i64,
        implicit_ttl_ms: i64,
    ) -> Self {
        let date_ms = parse_date_ms(headers, header::DATE).unwrap_or(now_ms);
        let last_modified_ms = parse_date_ms(headers, header::LAST_MODIFIED);

        let mut cacheable = status == StatusCode::OK;
        let mut private = false;
        let mut no_transform = false;
        let mut max_age = None;
        for (name, value) in cache_control_directives(headers) {
            match name.as_str() {
                "no-store" | "no-cache" => cacheable = false,
                "private" => private = true,
                "no-transform" => no_transform = true,
                "max-age" => {
                    max_age = value
                        .and_then(|value| value.parse::<i64>().ok())
                        .or(Some(0));
                }
                _ => {}
            }
        }

        let expiration_ms = if let Some(max_age) = max_age {
            date_ms.saturating_add(max_age.saturating_mul(1000))
        } else if let Some(expires) = parse_date_ms(headers, header::EXPIRES) {
            expires
        } else if headers.contains_key(header::EXPIRES) {
            // Invalid dates mean "already expired"
            date_ms
        } else {
            date_ms.saturating_add(implicit_ttl_ms)
        };

        if expiration_ms <= date_ms {
            cacheable = false;
        }

        Self {
            cacheable,
            private,
            no_transform,
            date_ms,
            expiration_ms,
            last_modified_ms,
        }
    }

    /// Remaining freshness lifetime in milliseconds
    pub fn ttl_ms(&self, now_ms: i64) -> i64 {
        (self.expiration_ms - now_ms).max(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(list: &[(&str, &str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in list {
            headers.append(
                HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        headers
    }

    #[test]
    fn commit_rejects_changes() {
        let mut response = ResponseHeaders::default();
        assert!(response.set(header::CONTENT_TYPE, "text/html"));
        assert!(response.add(header::LINK, "<a.css>; rel=preload"));
        response.commit();
        assert!(!response.add(header::LINK, "<b.css>; rel=preload"));
        assert!(!response.remove(header::CONTENT_TYPE));
        assert_eq!(response.get_str(header::CONTENT_TYPE), Some("text/html"));
        assert_eq!(response.headers().get_all(header::LINK).iter().count(), 1);
    }

    #[test]
    fn vary_is_additive() {
        let mut response = ResponseHeaders::default();
        response.add(header::VARY, "Accept-Encoding");
        response.add_vary("Accept");
        response.add_vary("accept");
        response.add_vary("Save-Data");
        assert_eq!(
            response.get_str(header::VARY),
            Some("Accept-Encoding, Accept, Save-Data")
        );
    }

    #[test]
    fn caching_max_age() {
        let now = 1_000_000_000;
        let info = CachingInfo::from_headers(
            StatusCode::OK,
            &headers(&[("cache-control", "public, max-age=600, no-transform")]),
            now,
            300_000,
        );
        assert!(info.cacheable);
        assert!(info.no_transform);
        assert!(!info.private);
        assert_eq!(info.expiration_ms, now + 600_000);
        assert_eq!(info.ttl_ms(now + 100_000), 500_000);
    }

    #[test]
    fn caching_implicit_and_uncacheable() {
        let now = 1_000_000_000;
        let info = CachingInfo::from_headers(StatusCode::OK, &HeaderMap::new(), now, 300_000);
        assert!(info.cacheable);
        assert_eq!(info.expiration_ms, now + 300_000);

        let info = CachingInfo::from_headers(
            StatusCode::OK,
            &headers(&[("cache-control", "no-store")]),
            now,
            300_000,
        );
        assert!(!info.cacheable);

        let info = CachingInfo::from_headers(
            StatusCode::OK,
            &headers(&[("cache-control", "max-age=0")]),
            now,
            300_000,
        );
        assert!(!info.cacheable);

        let info = CachingInfo::from_headers(StatusCode::NOT_FOUND, &HeaderMap::new(), now, 1000);
        assert!(!info.cacheable);
    }

    #[test]
    fn caching_expires_header() {
        let info = CachingInfo::from_headers(
            StatusCode::OK,
            &headers(&[
                ("date", "Fri, 02 Feb 2024 10:00:00 GMT"),
                ("expires", "Fri, 02 Feb 2024 11:00:00 GMT"),
                ("last-modified", "Thu, 01 Feb 2024 10:00:00 GMT"),
            ]),
            0,
            300_000,
        );
        assert!(info.cacheable);
        assert_eq!(info.expiration_ms - info.date_ms, 3_600_000);
        assert_eq!(info.last_modified_ms, Some(info.date_ms - 86_400_000));
        assert_eq!(
            format_http_date_ms(info.date_ms),
            "Fri, 02 Feb 2024 10:00:00 GMT"
        );
    }
}
