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

//! Serving rewritten resources and receiving beacons
//!
//! A rewritten URL contains everything needed to recreate the resource: the rewriter, the input
//! names and the parameters. If the output is no longer cached, it is recomputed. If the inputs
//! changed in the meantime, the result is served with a short cache lifetime. If rewriting
//! fails, the original input is served instead.

use crate::cache::{FindResult, HttpValue};
use crate::configuration::RewriteOptions;
use crate::content_type::ContentType;
use crate::headers::{format_http_date_ms, has_cache_control_directive, ResponseHeaders};
use crate::property_cache::{BeaconKind, PropertyPage};
use crate::registry::{EnabledAt, Filter};
use crate::rewrite::{
    initiate, initiate_fresh, load_input, RewriteOutcome, RewriteParams, RewriteRequest,
    RewriterId,
};
use crate::server_context::{page_key, ServerContext};
use crate::statistics::Stat;
use crate::url_namer::DecodedUrl;
use crate::BEACON_PATH;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use bytes::Bytes;
use http::{header, HeaderMap, HeaderName, StatusCode};
use log::{debug, info, trace};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use url::{form_urlencoded, Url};

/// Cache lifetime of resources whose content matches the hash in their URL
const IMMUTABLE_TTL_MS: i64 = 365 * 24 * 60 * 60 * 1000;

/// Cache lifetime of resources not matching the hash in their URL
const MISMATCH_TTL_MS: i64 = 5 * 60 * 1000;

const X_CONTENT_TYPE_OPTIONS: HeaderName = HeaderName::from_static("x-content-type-options");

/// Response produced for a resource or beacon request
#[derive(Debug, Clone)]
pub struct ResourceResponse {
    /// Status code and headers
    pub headers: ResponseHeaders,
    /// Response body
    pub body: Bytes,
}

impl ResourceResponse {
    /// Response status
    pub fn status(&self) -> StatusCode {
        self.headers.status()
    }
}

/// Bytes about to be served along with what determines their headers
#[derive(Debug)]
struct Served {
    body: Bytes,
    content_type: ContentType,
    vary: Vec<String>,
    private: bool,
    /// Result of image optimization rather than original bytes
    optimized: bool,
}

fn is_private(headers: &HeaderMap) -> bool {
    has_cache_control_directive(headers, "private")
}

fn vary_of(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(header::VARY)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
        .collect()
}

fn content_type_of(value: &HttpValue) -> Option<ContentType> {
    value
        .headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(ContentType::from_mime_type)
}

fn etag() -> String {
    let mut buffer = [0; 9];
    let nonce = match getrandom::getrandom(&mut buffer) {
        Ok(()) => URL_SAFE_NO_PAD.encode(buffer),
        Err(_) => "0".to_owned(),
    };
    format!("W/\"PSA-{nonce}\"")
}

/// Checks whether resources produced by this rewriter can be requested by URL.
fn serves_fetches(id: RewriterId) -> bool {
    id.filters()
        .iter()
        .any(|filter| filter.enabled_at() != EnabledAt::HtmlRewrite)
}

/// Whether the client asked for reduced data usage
fn wants_save_data(headers: &HeaderMap) -> bool {
    headers
        .get("save-data")
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.trim().eq_ignore_ascii_case("on"))
}

fn accepts_webp(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::ACCEPT)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .any(|value| value.contains("image/webp"))
}

/// Answers requests for rewritten resources, original resources optimized in place and
/// beacon reports
#[derive(Debug, Clone)]
pub struct ResourceFetchHandler {
    server: Arc<ServerContext>,
}

impl ResourceFetchHandler {
    /// Creates a handler using the caches and options of the server context.
    pub fn new(server: Arc<ServerContext>) -> Self {
        Self { server }
    }

    fn options(&self) -> &Arc<RewriteOptions> {
        self.server.options()
    }

    /// Checks whether the URL has the format of a rewritten resource.
    pub fn is_rewritten_url(&self, url: &Url) -> bool {
        let options = self.options();
        DecodedUrl::decode(url, options.max_url_size, options.max_url_segment_size).is_some()
    }

    /// Checks whether the URL is the beacon endpoint.
    pub fn is_beacon_url(&self, url: &Url) -> bool {
        url.path() == BEACON_PATH
    }

    fn not_found(&self) -> ResourceResponse {
        let body = Bytes::from_static(b"Not found\n");
        let mut headers = ResponseHeaders::new(StatusCode::NOT_FOUND);
        headers.set(header::CONTENT_TYPE, "text/plain");
        headers.set(X_CONTENT_TYPE_OPTIONS, "nosniff");
        headers.set(header::CONTENT_LENGTH, &body.len().to_string());
        ResourceResponse { headers, body }
    }

    fn corrupt(&self, url: &Url) -> ResourceResponse {
        info!("Request for corrupt rewritten URL {url}");
        self.server.statistics().increment(Stat::CorruptUrlFetches);
        self.not_found()
    }

    fn respond(
        &self,
        served: Served,
        ttl_ms: i64,
        immutable: bool,
        canonical: Option<&Url>,
    ) -> ResourceResponse {
        let options = self.options();
        let now = self.server.now_ms();

        let mut headers = ResponseHeaders::new(StatusCode::OK);
        headers.set(header::CONTENT_TYPE, served.content_type.mime_type());
        let mut cache_control = format!(
            "max-age={}, {}",
            ttl_ms / 1000,
            if served.private { "private" } else { "public" }
        );
        if immutable {
            cache_control.push_str(", immutable");
        }
        if served.optimized
            && served.content_type.is_image()
            && options.no_transform_optimized_images
        {
            cache_control.push_str(", no-transform");
        }
        headers.set(header::CACHE_CONTROL, &cache_control);
        headers.set(header::EXPIRES, &format_http_date_ms(now + ttl_ms));
        headers.set(header::DATE, &format_http_date_ms(now));
        for value in &served.vary {
            headers.add_vary(value);
        }
        headers.set(header::ETAG, &etag());
        headers.set(X_CONTENT_TYPE_OPTIONS, "nosniff");
        headers.set(header::CONTENT_LENGTH, &served.body.len().to_string());
        if options.add_canonical_link {
            if let Some(canonical) = canonical {
                headers.add(header::LINK, &format!("<{canonical}>; rel=canonical"));
            }
        }

        ResourceResponse {
            headers,
            body: served.body,
        }
    }

    /// Serves a rewritten resource. The response is never an error: anything that cannot be
    /// served results in a 404 response that browsers won’t interpret as HTML.
    pub async fn fetch(&self, url: &Url) -> ResourceResponse {
        let options = self.options().clone();
        let Some(decoded) =
            DecodedUrl::decode(url, options.max_url_size, options.max_url_segment_size)
        else {
            return self.corrupt(url);
        };
        let Some(id) = RewriterId::from_id(&decoded.namer.id).filter(|id| serves_fetches(*id))
        else {
            return self.corrupt(url);
        };
        let Some((dims, inputs)) = decoded.input_urls() else {
            return self.corrupt(url);
        };
        if let Some(input) = inputs
            .iter()
            .find(|input| !self.server.lawyer().is_authorized(input, url))
        {
            debug!("Not serving {url}: input {input} is not authorized");
            return self.not_found();
        }
        let canonical = if inputs.len() == 1 {
            inputs.first()
        } else {
            None
        };

        let fragment = &options.cache_fragment;
        let cached = self.server.http_cache().find(url.as_str(), fragment).await;
        if let FindResult::Found(value) = cached {
            trace!("Serving {url} from cache");
            let served = Served {
                content_type: content_type_of(&value)
                    .unwrap_or_else(|| ContentType::from_path(url.path())),
                vary: vary_of(&value.headers),
                private: is_private(&value.headers),
                optimized: true,
                body: value.body,
            };
            return self.respond(served, IMMUTABLE_TTL_MS, true, canonical);
        }

        let webp = id == RewriterId::Image
            && decoded.namer.ext == ContentType::Webp.extension()
            && inputs
                .first()
                .is_some_and(|input| ContentType::from_path(input.path()) != ContentType::Webp);
        let params = RewriteParams {
            dims,
            webp,
            save_data: false,
            inline: false,
        };
        let request = RewriteRequest::new(id, inputs.clone(), url.clone()).with_params(params);

        let deadline = Duration::from_millis(options.fetch_deadline_ms);
        let handle = initiate(&self.server, &options, request.clone(), true);
        if let Ok(outcome) = timeout(deadline, handle.wait()).await {
            if let Some(response) = self.serve_outcome(&decoded, &outcome, canonical).await {
                return response;
            }
            if outcome.url().is_some() {
                debug!("Output of {url} is no longer cached, recomputing");
                let handle = initiate_fresh(&self.server, &options, request);
                if let Ok(outcome) = timeout(deadline, handle.wait()).await {
                    if let Some(response) = self.serve_outcome(&decoded, &outcome, canonical).await
                    {
                        return response;
                    }
                }
            }
        } else {
            debug!("Rewriting {url} timed out");
        }

        self.fallback(url, id, &inputs, canonical).await
    }

    async fn serve_outcome(
        &self,
        decoded: &DecodedUrl,
        outcome: &RewriteOutcome,
        canonical: Option<&Url>,
    ) -> Option<ResourceResponse> {
        let output = outcome.url()?;
        let fragment = &self.options().cache_fragment;
        let (body, private) = match self.server.http_cache().find(output, fragment).await {
            FindResult::Found(value) => (value.body, is_private(&value.headers)),
            _ => (outcome.contents.clone()?, false),
        };
        let content_type = outcome
            .result
            .content_type
            .or_else(|| ContentType::from_extension(&decoded.namer.ext))
            .unwrap_or(ContentType::Other);

        let matches = outcome.result.hash.as_deref() == Some(decoded.namer.hash.as_str());
        if !matches {
            debug!("Hash of {output} doesn’t match the requested URL, short cache lifetime");
            self.server.statistics().increment(Stat::HashMismatchFetches);
        }
        let served = Served {
            body,
            content_type,
            vary: outcome.result.vary.clone(),
            private,
            optimized: true,
        };
        let ttl_ms = if matches {
            IMMUTABLE_TTL_MS
        } else {
            MISMATCH_TTL_MS
        };
        Some(self.respond(served, ttl_ms, matches, canonical))
    }

    /// Serves the original inputs, concatenated if there are multiple.
    async fn fallback(
        &self,
        url: &Url,
        id: RewriterId,
        inputs: &[Url],
        canonical: Option<&Url>,
    ) -> ResourceResponse {
        let options = self.options();
        let mut body = Vec::new();
        let mut content_type = None;
        let mut private = false;
        for input in inputs {
            let resource = match load_input(&self.server, options, input).await {
                Ok(resource) => resource,
                Err(err) => {
                    debug!("Not serving {url}: loading input {input} failed: {err}");
                    return self.not_found();
                }
            };
            if !body.is_empty() {
                match id {
                    RewriterId::CombineJavascript => body.extend_from_slice(b";\n"),
                    _ => body.push(b'\n'),
                }
            }
            body.extend_from_slice(resource.contents());
            content_type.get_or_insert(resource.content_type());
            private |= resource.caching().is_some_and(|caching| caching.private);
        }

        debug!("Serving original contents for {url}");
        self.server.statistics().increment(Stat::FallbackResponses);
        let served = Served {
            body: Bytes::from(body),
            content_type: content_type.unwrap_or(ContentType::Other),
            vary: Vec::new(),
            private,
            optimized: false,
        };
        self.respond(served, MISMATCH_TTL_MS, false, canonical)
    }

    /// Serves an original resource URL with optimized contents if these are available already.
    /// Otherwise the original contents are served and the rewrite continues in the background.
    ///
    /// Returns `None` if in-place optimization is off or doesn’t apply to this URL, the request
    /// should be passed to the origin then.
    pub async fn fetch_in_place(
        &self,
        url: &Url,
        request_headers: &HeaderMap,
    ) -> Option<ResourceResponse> {
        let options = self.options().clone();
        if !options.in_place_rewriting_enabled || self.is_rewritten_url(url) {
            return None;
        }
        let id = match ContentType::from_path(url.path()) {
            ContentType::Css => RewriterId::Css,
            ContentType::Javascript => RewriterId::Javascript,
            content_type if content_type.is_image() => RewriterId::Image,
            _ => return None,
        };
        if !id.is_enabled(&options) {
            return None;
        }

        let mut params = RewriteParams::default();
        let mut vary = Vec::new();
        if id == RewriterId::Image {
            if options.is_enabled(Filter::ConvertToWebp) && options.allow_vary_on.allows_accept()
            {
                params.webp = accepts_webp(request_headers);
                vary.push("Accept".to_owned());
            }
            if options.allow_vary_on.allows_save_data() {
                params.save_data = wants_save_data(request_headers);
                vary.push("Save-Data".to_owned());
            }
        }
        let request = RewriteRequest::new(id, vec![url.clone()], url.clone()).with_params(params);

        let deadline = Duration::from_millis(options.rewrite_deadline_ms);
        let handle = initiate(&self.server, &options, request, true);
        let optimized = match timeout(deadline, handle.wait()).await {
            Ok(outcome) => match outcome.url() {
                Some(output) => match self
                    .server
                    .http_cache()
                    .find(output, &options.cache_fragment)
                    .await
                {
                    FindResult::Found(value) => Some((value, outcome.result.content_type)),
                    _ => None,
                },
                None => None,
            },
            Err(_) => {
                debug!("Optimized version of {url} not ready, serving original");
                None
            }
        };

        let resource = match load_input(&self.server, &options, url).await {
            Ok(resource) => resource,
            Err(err) => {
                debug!("Not serving {url} in place: {err}");
                return None;
            }
        };
        let now = self.server.now_ms();
        let ttl_ms = resource.caching().map_or(0, |caching| caching.ttl_ms(now));
        let private = resource.caching().is_some_and(|caching| caching.private);

        let served = match optimized {
            Some((value, content_type)) => {
                trace!("Serving optimized version of {url} in place");
                Served {
                    content_type: content_type.unwrap_or_else(|| resource.content_type()),
                    body: value.body,
                    vary,
                    private,
                    optimized: true,
                }
            }
            None => Served {
                body: resource.contents().clone(),
                content_type: resource.content_type(),
                vary,
                private,
                optimized: false,
            },
        };
        Some(self.respond(served, ttl_ms, false, None))
    }

    /// Records a beacon report. The request URL carries the page, the beacon kind and the
    /// nonce, the body lists the keys found to be critical. Reports with an unknown nonce are
    /// rejected.
    pub async fn handle_beacon(&self, url: &Url, body: &[u8]) -> StatusCode {
        let mut page = None;
        let mut kind = None;
        let mut nonce = None;
        for (name, value) in url.query_pairs() {
            match name.as_ref() {
                "url" => page = Url::parse(&value).ok(),
                "id" => kind = BeaconKind::from_id(&value),
                "n" => nonce = Some(value.into_owned()),
                _ => {}
            }
        }
        let (Some(page), Some(kind), Some(nonce)) = (page, kind, nonce) else {
            debug!("Rejecting malformed beacon {url}");
            self.server.statistics().increment(Stat::BeaconsRejected);
            return StatusCode::BAD_REQUEST;
        };

        let store = self.server.property_store();
        let key = page_key(self.options(), &page);
        let mut property_page = PropertyPage::read(store, &key).await;
        let expected = property_page
            .dom()
            .beacons
            .get(&kind)
            .is_some_and(|metadata| metadata.nonces.iter().any(|n| n.nonce == nonce));
        if !expected {
            debug!("Rejecting {} beacon for {page}: unknown nonce", kind.id());
            self.server.statistics().increment(Stat::BeaconsRejected);
            return StatusCode::FORBIDDEN;
        }

        let reported = form_urlencoded::parse(body)
            .filter(|(name, _)| name == kind.id())
            .flat_map(|(_, value)| {
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|key| !key.is_empty())
                    .map(ToOwned::to_owned)
                    .collect::<Vec<_>>()
            })
            .collect::<Vec<_>>();

        let now = self.server.now_ms();
        let metadata = property_page.dom_mut().beacons.entry(kind).or_default();
        metadata.nonces.retain(|n| n.nonce != nonce);
        let mut critical = reported
            .into_iter()
            .filter(|key| metadata.candidate_keys.contains(key))
            .collect::<Vec<_>>();
        critical.sort();
        critical.dedup();
        if metadata.critical_keys != critical {
            metadata.critical_keys = critical;
            metadata.last_change_ms = now;
        }
        property_page.write_dom(store).await;

        trace!("Recorded {} beacon for {page}", kind.id());
        self.server.statistics().increment(Stat::BeaconsReceived);
        StatusCode::NO_CONTENT
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hasher::hash_bytes;
    use crate::property_cache::{BeaconMetadata, BeaconNonce, DomCohort};
    use crate::testing::{jpeg_image, MockTimer, MockUrlFetcher, TestImageOptimizer};

    use test_log::test;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn handler(options: RewriteOptions) -> (ResourceFetchHandler, Arc<MockUrlFetcher>) {
        let fetcher = Arc::new(MockUrlFetcher::new());
        fetcher.add_text("http://example.com/a.css", "text/css", "a {\n  color: red;\n}\n");
        fetcher.add_text("http://example.com/b.js", "application/javascript", "var a = 1;  // x\n");
        fetcher.add_text("http://example.com/c.js", "application/javascript", "var c = 2;\n");
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, http::HeaderValue::from_static("image/jpeg"));
        fetcher.add_response(
            "http://example.com/foo.jpg",
            StatusCode::OK,
            headers,
            jpeg_image(100, 100, 2000),
        );
        let server = ServerContext::builder(options, fetcher.clone())
            .timer(Arc::new(MockTimer::new()))
            .image_optimizer(Arc::new(TestImageOptimizer::new()))
            .build()
            .unwrap();
        (ResourceFetchHandler::new(server), fetcher)
    }

    fn options(filters: &[Filter]) -> RewriteOptions {
        RewriteOptions {
            rewrite_level: crate::RewriteLevel::PassThrough,
            enabled_filters: filters.iter().copied().collect(),
            ..Default::default()
        }
    }

    fn header_value<'a>(response: &'a ResourceResponse, name: HeaderName) -> &'a str {
        response.headers.get_str(name).unwrap_or("")
    }

    #[test(tokio::test)]
    async fn hash_match_served_immutable() {
        let (handler, _) = handler(options(&[Filter::RewriteCss]));
        let wrong = url("http://example.com/A.a.css.pagespeed.cf.0123456789.css");
        let response = handler.fetch(&wrong).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.body, "a{color:red}");
        assert_eq!(header_value(&response, header::CACHE_CONTROL), "max-age=300, public");

        let hash = hash_bytes(b"a{color:red}");
        let right = url(&format!("http://example.com/A.a.css.pagespeed.cf.{hash}.css"));
        let response = handler.fetch(&right).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.body, "a{color:red}");
        assert_eq!(
            header_value(&response, header::CACHE_CONTROL),
            "max-age=31536000, public, immutable"
        );
        assert_eq!(header_value(&response, header::CONTENT_TYPE), "text/css");
        assert_eq!(header_value(&response, header::CONTENT_LENGTH), "12");
        assert_eq!(header_value(&response, X_CONTENT_TYPE_OPTIONS), "nosniff");
        assert!(header_value(&response, header::ETAG).starts_with("W/\"PSA-"));
        assert!(response.headers.contains(header::EXPIRES));
        assert!(response.headers.contains(header::DATE));
    }

    #[test(tokio::test)]
    async fn missing_input_is_not_found() {
        let (handler, _) = handler(options(&[Filter::RecompressImages]));
        let response = handler
            .fetch(&url("http://example.com/missing.pagespeed.ic.0123456789.jpg"))
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(header_value(&response, header::CONTENT_TYPE), "text/plain");
        assert_eq!(header_value(&response, X_CONTENT_TYPE_OPTIONS), "nosniff");
        assert!(!response.headers.contains(header::CACHE_CONTROL));
    }

    #[test(tokio::test)]
    async fn corrupt_and_unauthorized_urls() {
        let (handler, fetcher) = handler(options(&[Filter::RewriteCss]));
        for target in [
            "http://example.com/a.css.pagespeed.cf.!!!.css",
            "http://example.com/a.css.pagespeed.zz.0123456789.css",
            "http://example.com/a.css.pagespeed.ci.0123456789.css",
        ] {
            let response = handler.fetch(&url(target)).await;
            assert_eq!(response.status(), StatusCode::NOT_FOUND, "{target}");
        }

        let evil = "http://example.com/A.http:,_,_evil.com,_a.css.pagespeed.cf.0123456789.css";
        let response = handler.fetch(&url(evil)).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(fetcher.requests().is_empty());
    }

    #[test(tokio::test)]
    async fn failed_rewrite_serves_original() {
        let (handler, fetcher) = handler(options(&[Filter::RecompressImages]));
        fetcher.add_text("http://example.com/broken.jpg", "image/jpeg", "not an image");
        let response = handler
            .fetch(&url("http://example.com/broken.jpg.pagespeed.ic.0123456789.jpg"))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.body, "not an image");
        assert_eq!(header_value(&response, header::CONTENT_TYPE), "image/jpeg");
        assert_eq!(header_value(&response, header::CACHE_CONTROL), "max-age=300, public");
        assert_eq!(handler.server.statistics().get(Stat::FallbackResponses), 1);
    }

    #[test(tokio::test)]
    async fn combined_fallback_concatenates() {
        let (handler, fetcher) = handler(options(&[Filter::CombineJavascript]));
        let response = handler
            .fetch(&url("http://example.com/b.js+missing.js.pagespeed.jc.0123456789.js"))
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = handler
            .fetch(&url("http://example.com/b.js+c.js.pagespeed.jc.0123456789.js"))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.body.starts_with(b"var a"));
        assert_eq!(response.body, "var a = 1;  // x\n;\nvar c = 2;\n");
    }

    #[test(tokio::test)]
    async fn webp_conversion_from_url() {
        let mut options = options(&[Filter::ConvertToWebp]);
        options.add_canonical_link = true;
        options.no_transform_optimized_images = true;
        let (handler, _) = handler(options);
        let response = handler
            .fetch(&url("http://example.com/foo.jpg.pagespeed.ic.0123456789.webp"))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(header_value(&response, header::CONTENT_TYPE), "image/webp");
        assert_eq!(response.body.len(), 1000);
        assert_eq!(header_value(&response, header::VARY), "Accept");
        assert_eq!(
            header_value(&response, header::CACHE_CONTROL),
            "max-age=300, public, no-transform"
        );
        assert_eq!(
            header_value(&response, header::LINK),
            "<http://example.com/foo.jpg>; rel=canonical"
        );
    }

    #[test(tokio::test(start_paused = true))]
    async fn in_place_optimization() {
        let mut options = options(&[Filter::RewriteCss]);
        options.in_place_rewriting_enabled = true;
        let (handler, fetcher) = handler(options);
        let original = url("http://example.com/a.css");

        let response = handler
            .fetch_in_place(&original, &HeaderMap::new())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.body, "a{color:red}");
        assert!(header_value(&response, header::CACHE_CONTROL).starts_with("max-age=300, public"));
        assert_eq!(fetcher.request_count("http://example.com/a.css"), 1);

        assert!(handler
            .fetch_in_place(&url("http://example.com/index.html"), &HeaderMap::new())
            .await
            .is_none());
        assert!(handler
            .fetch_in_place(&url("http://example.com/b.js"), &HeaderMap::new())
            .await
            .is_none());
    }

    #[test(tokio::test)]
    async fn in_place_disabled() {
        let (handler, _) = handler(options(&[Filter::RewriteCss]));
        assert!(handler
            .fetch_in_place(&url("http://example.com/a.css"), &HeaderMap::new())
            .await
            .is_none());
    }

    async fn prepare_beacon(handler: &ResourceFetchHandler, page: &Url) {
        let store = handler.server.property_store();
        let key = page_key(handler.options(), page);
        let mut property_page = PropertyPage::read(store, &key).await;
        *property_page.dom_mut() = DomCohort {
            beacons: [(
                BeaconKind::CriticalImages,
                BeaconMetadata {
                    candidate_keys: vec!["h1".to_owned(), "h2".to_owned()],
                    nonces: vec![BeaconNonce {
                        nonce: "abc".to_owned(),
                        timestamp_ms: MockTimer::START_MS,
                    }],
                    ..Default::default()
                },
            )]
            .into(),
            ..Default::default()
        };
        property_page.write_dom(store).await;
    }

    #[test(tokio::test)]
    async fn beacons_recorded() {
        let (handler, _) = handler(options(&[Filter::CriticalImagesBeacon]));
        let page = url("http://example.com/index.html");
        prepare_beacon(&handler, &page).await;

        let beacon = url(
            "http://example.com/pagespeed_beacon?url=http%3A%2F%2Fexample.com%2Findex.html\
            &id=ci&n=abc",
        );
        assert!(handler.is_beacon_url(&beacon));
        assert_eq!(
            handler.handle_beacon(&beacon, b"ci=h2,unknown").await,
            StatusCode::NO_CONTENT
        );

        let key = page_key(handler.options(), &page);
        let property_page = PropertyPage::read(handler.server.property_store(), &key).await;
        let metadata = &property_page.dom().beacons[&BeaconKind::CriticalImages];
        assert_eq!(metadata.critical_keys, vec!["h2".to_owned()]);
        assert!(metadata.nonces.is_empty());
        assert_eq!(metadata.last_change_ms, MockTimer::START_MS);

        // Nonces are single use
        assert_eq!(
            handler.handle_beacon(&beacon, b"ci=h1").await,
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            handler
                .handle_beacon(&url("http://example.com/pagespeed_beacon?id=ci"), b"")
                .await,
            StatusCode::BAD_REQUEST
        );
        assert_eq!(handler.server.statistics().get(Stat::BeaconsReceived), 1);
        assert_eq!(handler.server.statistics().get(Stat::BeaconsRejected), 2);
    }
}
