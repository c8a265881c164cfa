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

use super::{FetchError, FetchRequest, FetchResponse, UrlAsyncFetcher};
use crate::error::Error;

use async_trait::async_trait;
use bytes::Bytes;
use http::{header, HeaderValue, Method, StatusCode};
use log::{debug, trace};
use percent_encoding::percent_decode_str;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use url::Url;

#[cfg(unix)]
fn path_from_bytes(bytes: &[u8]) -> &std::ffi::OsStr {
    use std::ffi::OsStr;
    use std::os::unix::ffi::OsStrExt;

    OsStr::from_bytes(bytes)
}

#[cfg(not(unix))]
fn path_from_bytes(bytes: &[u8]) -> String {
    // Non-Unicode file names cannot be resolved on other platforms and will result in 404.
    String::from_utf8_lossy(bytes).into_owned()
}

/// Resolves a URL path against the path to a root directory.
///
/// This will return an error under the following conditions:
///
/// * Invalid path, not starting with a slash (/): results in [`ErrorKind::InvalidInput`]
/// * Resolved path outside the root directory: results in [`ErrorKind::InvalidData`]
/// * [`std::fs::canonicalize()`] failed: results in [`ErrorKind::NotFound`],
///   [`ErrorKind::PermissionDenied`] and other errors
fn resolve_path(url_path: &str, root: &Path) -> Result<PathBuf, std::io::Error> {
    let url_path = url_path.strip_prefix('/').ok_or(ErrorKind::InvalidInput)?;

    let mut path = root.to_path_buf();
    for component in url_path.split('/') {
        let decoded = percent_decode_str(component).collect::<Vec<_>>();
        path.push(path_from_bytes(&decoded))
    }

    let path = path.canonicalize()?;

    if path.starts_with(root) {
        Ok(path)
    } else {
        Err(ErrorKind::InvalidData.into())
    }
}

/// Fetcher serving resources from a directory
///
/// URLs below `origin` are mapped to files below `root`. The content type is guessed from the
/// file extension, `Last-Modified` reflects the file modification time. Anything else results in
/// a 404 response.
#[derive(Debug, Clone)]
pub struct FileSystemFetcher {
    origin: Url,
    root: PathBuf,
    max_age_sec: u64,
}

impl FileSystemFetcher {
    /// Creates a fetcher for files in `root`, served under `origin` and cacheable for
    /// `max_age_sec` seconds.
    pub fn new(origin: Url, root: &Path, max_age_sec: u64) -> Result<Self, Error> {
        let root = root.canonicalize()?;
        if !root.is_dir() {
            return Err(Error::InvalidConfig(format!("{root:?} is not a directory")));
        }
        let mut origin = origin;
        if !origin.path().ends_with('/') {
            origin.set_path(&format!("{}/", origin.path()));
        }
        Ok(Self {
            origin,
            root,
            max_age_sec,
        })
    }

    /// Maps a URL to a file path if it is located below the origin.
    pub fn path_for(&self, url: &Url) -> Option<PathBuf> {
        let relative = url.as_str().strip_prefix(self.origin.as_str())?;
        let relative = relative.split(['?', '#']).next().unwrap_or("");
        resolve_path(&format!("/{relative}"), &self.root)
            .map_err(|err| trace!("Could not resolve {url}: {err}"))
            .ok()
    }
}

#[async_trait]
impl UrlAsyncFetcher for FileSystemFetcher {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, FetchError> {
        if request.method != Method::GET {
            debug!("Ignoring {} request for {}", request.method, request.url);
            return Ok(FetchResponse::empty(StatusCode::METHOD_NOT_ALLOWED));
        }

        let Some(path) = self.path_for(&request.url) else {
            return Ok(FetchResponse::empty(StatusCode::NOT_FOUND));
        };
        if path.is_dir() {
            return Ok(FetchResponse::empty(StatusCode::NOT_FOUND));
        }

        let body = match tokio::fs::read(&path).await {
            Ok(body) => body,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Ok(FetchResponse::empty(StatusCode::NOT_FOUND))
            }
            Err(err) if err.kind() == ErrorKind::PermissionDenied => {
                return Ok(FetchResponse::empty(StatusCode::FORBIDDEN))
            }
            Err(err) => return Err(FetchError::Failed(err.to_string())),
        };

        let mut response = FetchResponse::empty(StatusCode::OK);
        let headers = &mut response.headers;
        let mime = mime_guess::from_path(&path).first_or_octet_stream();
        if let Ok(value) = HeaderValue::from_str(mime.as_ref()) {
            headers.insert(header::CONTENT_TYPE, value);
        }
        if let Ok(modified) = tokio::fs::metadata(&path)
            .await
            .and_then(|meta| meta.modified())
        {
            if let Ok(value) = HeaderValue::from_str(&httpdate::fmt_http_date(modified)) {
                headers.insert(header::LAST_MODIFIED, value);
            }
        }
        if let Ok(value) = HeaderValue::from_str(&format!("max-age={}", self.max_age_sec)) {
            headers.insert(header::CACHE_CONTROL, value);
        }
        response.body = Bytes::from(body);
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::fs;
    use test_log::test;

    fn temp_root(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "page-optimizer-file-fetcher-{name}-{}",
            std::process::id()
        ));
        fs::create_dir_all(dir.join("css")).unwrap();
        fs::write(dir.join("css").join("a.css"), "a { color: red }").unwrap();
        dir
    }

    #[test(tokio::test)]
    async fn serves_files() {
        let root = temp_root("serve");
        let fetcher =
            FileSystemFetcher::new(Url::parse("http://example.com/").unwrap(), &root, 600)
                .unwrap();

        let response = fetcher
            .fetch(FetchRequest::get(
                Url::parse("http://example.com/css/a.css?v=1").unwrap(),
            ))
            .await
            .unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.body, Bytes::from_static(b"a { color: red }"));
        assert_eq!(
            response.headers.get(header::CONTENT_TYPE).unwrap(),
            "text/css"
        );
        assert_eq!(
            response.headers.get(header::CACHE_CONTROL).unwrap(),
            "max-age=600"
        );
        assert!(response.headers.contains_key(header::LAST_MODIFIED));

        for missing in [
            "http://example.com/css/b.css",
            "http://example.com/css/",
            "http://example.com/../etc/passwd",
            "http://other.example.com/css/a.css",
        ] {
            let response = fetcher
                .fetch(FetchRequest::get(Url::parse(missing).unwrap()))
                .await
                .unwrap();
            assert_eq!(response.status, StatusCode::NOT_FOUND, "{missing}");
        }

        fs::remove_dir_all(root).unwrap();
    }

    #[test]
    fn path_traversal() {
        let root = temp_root("traversal");
        let fetcher =
            FileSystemFetcher::new(Url::parse("http://example.com/static").unwrap(), &root, 0)
                .unwrap();
        assert!(fetcher
            .path_for(&Url::parse("http://example.com/static/css/a.css").unwrap())
            .is_some());
        assert!(fetcher
            .path_for(&Url::parse("http://example.com/static/css/%2E%2E/%2E%2E/x").unwrap())
            .is_none());
        assert!(fetcher
            .path_for(&Url::parse("http://example.com/other/css/a.css").unwrap())
            .is_none());
        fs::remove_dir_all(root).unwrap();
    }
}
