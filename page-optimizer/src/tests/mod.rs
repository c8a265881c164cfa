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

mod filters;
mod scenarios;

use crate::headers::ResponseHeaders;
use crate::testing::{MockTimer, MockUrlFetcher, StringWriter, TestImageOptimizer};
use crate::{Filter, RewriteDriver, RewriteLevel, RewriteOptions, ServerContext};

use bytes::Bytes;
use http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use std::sync::Arc;
use url::Url;

const ORIGIN: &str = "http://example.com/";

fn url(path: &str) -> Url {
    Url::parse(ORIGIN).unwrap().join(path).unwrap()
}

fn options(filters: &[Filter]) -> RewriteOptions {
    RewriteOptions {
        rewrite_level: RewriteLevel::PassThrough,
        enabled_filters: filters.iter().copied().collect(),
        ..Default::default()
    }
}

struct TestServer {
    server: Arc<ServerContext>,
    fetcher: Arc<MockUrlFetcher>,
    timer: Arc<MockTimer>,
}

impl TestServer {
    fn new(options: RewriteOptions) -> Self {
        let fetcher = Arc::new(MockUrlFetcher::new());
        let timer = Arc::new(MockTimer::new());
        let server = ServerContext::builder(options, fetcher.clone())
            .timer(timer.clone())
            .image_optimizer(Arc::new(TestImageOptimizer::new()))
            .build()
            .unwrap();
        Self {
            server,
            fetcher,
            timer,
        }
    }

    /// Adds a resource cacheable for five minutes.
    fn add(&self, path: &str, content_type: &str, body: impl Into<Bytes>) {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_str(content_type).unwrap(),
        );
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("max-age=300"));
        self.fetcher
            .add_response(url(path).as_str(), StatusCode::OK, headers, body);
    }

    async fn rewrite(&self, path: &str, html: &str) -> (String, ResponseHeaders) {
        self.rewrite_with(path, HeaderMap::new(), ResponseHeaders::default(), &[html])
            .await
    }

    async fn rewrite_with(
        &self,
        path: &str,
        request_headers: HeaderMap,
        response_headers: ResponseHeaders,
        chunks: &[&str],
    ) -> (String, ResponseHeaders) {
        let mut driver = RewriteDriver::new(self.server.clone(), StringWriter::default());
        driver.set_request_headers(Method::GET, request_headers);
        driver.set_response_headers(response_headers);
        driver.start_parse(url(path)).await.unwrap();
        for chunk in chunks {
            driver.parse_text(chunk.as_bytes()).await.unwrap();
        }
        driver.finish_parse().await.unwrap();
        let headers = driver.writer().headers().cloned().unwrap_or_default();
        (driver.writer().text(), headers)
    }
}
