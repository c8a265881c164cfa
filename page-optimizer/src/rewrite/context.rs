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

//! Lifecycle of a single rewrite
//!
//! Each rewrite runs in its own task. Whoever initiated it gets a [`RewriteHandle`] and may stop
//! waiting at any point, the task still completes and caches its result so that a later request
//! can use it. Identical rewrites running at the same time are merged into one.

use super::{
    rewriter_for, CachedResult, RewriteJob, RewriteOutcome, RewriteOutput, RewriteRequest,
    RESULT_VERSION,
};
use crate::cache::{FindResult, HttpValue, REMEMBER_FETCH_FAILED_TTL_MS};
use crate::configuration::RewriteOptions;
use crate::content_type::ContentType;
use crate::error::RewriteError;
use crate::fetch::{FetchError, FetchRequest};
use crate::hasher::hash_bytes;
use crate::headers::CachingInfo;
use crate::resource::{FetchOutcome, InputInfo, Resource};
use crate::server_context::ServerContext;
use crate::statistics::Stat;
use crate::url_namer::{directory_of, escape_leaf, leaf_of, output_url, ResourceNamer};

use bytes::Bytes;
use http::{header, HeaderMap, HeaderValue, StatusCode};
use log::{debug, trace};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::timeout;
use url::Url;

/// Published outputs are addressed by content hash and never change.
const OUTPUT_TTL_MS: i64 = 365 * 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Created,
    AwaitingMetadata,
    AwaitingInputs,
    Rewriting,
    Publishing,
    Ready,
}

fn enter(key: &str, state: State) {
    trace!("Rewrite {key}: {state:?}");
}

/// Allows waiting for the outcome of a running rewrite
#[derive(Debug, Clone)]
pub(crate) struct RewriteHandle {
    receiver: watch::Receiver<Option<Arc<RewriteOutcome>>>,
}

impl RewriteHandle {
    /// Waits until the rewrite completes. Dropping the future detaches from the rewrite
    /// without stopping it.
    pub(crate) async fn wait(mut self) -> Arc<RewriteOutcome> {
        let outcome = self
            .receiver
            .wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|value| value.clone());
        outcome.unwrap_or_else(|| Arc::new(RewriteOutcome::failed(RewriteError::Dropped)))
    }
}

/// Starts a rewrite or attaches to an identical one already running. Only outermost rewrites
/// (those initiated by a document) may use stale cached results.
pub(crate) fn initiate(
    server: &Arc<ServerContext>,
    options: &Arc<RewriteOptions>,
    request: RewriteRequest,
    outermost: bool,
) -> RewriteHandle {
    start(server, options, request, outermost, false)
}

/// Starts a rewrite ignoring any cached result. The outcome replaces the cached result.
pub(crate) fn initiate_fresh(
    server: &Arc<ServerContext>,
    options: &Arc<RewriteOptions>,
    request: RewriteRequest,
) -> RewriteHandle {
    start(server, options, request, true, true)
}

fn start(
    server: &Arc<ServerContext>,
    options: &Arc<RewriteOptions>,
    request: RewriteRequest,
    outermost: bool,
    fresh: bool,
) -> RewriteHandle {
    let key = request.metadata_key(options);
    let running_key = if fresh {
        format!("{key}#fresh")
    } else {
        key.clone()
    };

    let mut inflight = server.inflight.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(receiver) = inflight.get(&running_key) {
        trace!("Attaching to running rewrite {running_key}");
        server.statistics().increment(Stat::RewritesDeduplicated);
        return RewriteHandle {
            receiver: receiver.clone(),
        };
    }
    let (sender, receiver) = watch::channel(None);
    inflight.insert(running_key.clone(), receiver.clone());
    drop(inflight);

    server.statistics().increment(Stat::RewritesInitiated);
    enter(&key, State::Created);

    let server = server.clone();
    let options = options.clone();
    tokio::spawn(async move {
        let outcome = execute(&server, &options, &key, request, outermost, fresh).await;
        sender.send_replace(Some(Arc::new(outcome)));
        server
            .inflight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&running_key);
    });

    RewriteHandle { receiver }
}

fn random_percentage() -> u8 {
    let mut buffer = [0; 2];
    match getrandom::getrandom(&mut buffer) {
        Ok(()) => (u16::from_le_bytes(buffer) % 100) as u8,
        Err(_) => 99,
    }
}

async fn execute(
    server: &Arc<ServerContext>,
    options: &Arc<RewriteOptions>,
    key: &str,
    request: RewriteRequest,
    outermost: bool,
    fresh: bool,
) -> RewriteOutcome {
    if let Some(url) = request
        .inputs
        .iter()
        .find(|url| !server.lawyer().is_authorized(url, &request.base))
    {
        debug!("Not rewriting {url}: domain not authorized");
        return RewriteOutcome::failed(RewriteError::NotAuthorized(url.to_string()));
    }

    if !fresh {
        enter(key, State::AwaitingMetadata);
        match lookup(server, options, key).await {
            Lookup::Hit(result) => {
                server.statistics().increment(Stat::CachedOutputHits);
                enter(key, State::Ready);
                return RewriteOutcome::cached(result);
            }
            Lookup::Stale(result) if outermost => {
                debug!("Using stale result for {key}, refreshing in background");
                server.statistics().increment(Stat::CachedOutputStaleHits);
                drop(initiate_fresh(server, options, request));
                enter(key, State::Ready);
                return RewriteOutcome::cached(result);
            }
            Lookup::Stale(_) | Lookup::Miss => {
                server.statistics().increment(Stat::CachedOutputMisses);
            }
        }
    }

    if options.rewrite_random_drop_percentage > 0
        && random_percentage() < options.rewrite_random_drop_percentage
    {
        debug!("Randomly dropping rewrite {key}");
        server.statistics().increment(Stat::RewritesDroppedRandomly);
        return RewriteOutcome::failed(RewriteError::Dropped);
    }

    enter(key, State::AwaitingInputs);
    let mut inputs = Vec::with_capacity(request.inputs.len());
    for (index, url) in request.inputs.iter().enumerate() {
        match load_input(server, options, url).await {
            Ok(resource) => inputs.push(resource),
            Err(error) => {
                let now = server.now_ms();
                let info = InputInfo::cached(
                    url.as_str(),
                    index as u32,
                    now,
                    now + REMEMBER_FETCH_FAILED_TTL_MS,
                );
                return fail(server, key, error, vec![info], false).await;
            }
        }
    }

    if options.respect_no_transform && inputs.iter().any(Resource::has_no_transform) {
        debug!("Not rewriting {key}: origin requested no-transform");
        return RewriteOutcome::failed(RewriteError::NoTransformRequested);
    }

    enter(key, State::Rewriting);
    let mut infos = inputs
        .iter()
        .enumerate()
        .map(|(index, input)| input.input_info(index as u32))
        .collect::<Vec<_>>();
    let id = request.id;
    let mut job = RewriteJob::new(server.clone(), options.clone(), request, inputs);
    let result = rewriter_for(id).rewrite(&mut job).await;
    server.statistics().increment(Stat::RewritesExecuted);

    let (request, inputs, nested, abandoned) = job.into_parts();
    infos.extend(nested);
    match result {
        Ok(output) => {
            publish(
                server, options, key, &request, &inputs, output, infos, abandoned,
            )
            .await
        }
        Err(error) => fail(server, key, error, infos, abandoned).await,
    }
}

enum Lookup {
    Hit(CachedResult),
    Stale(CachedResult),
    Miss,
}

async fn lookup(server: &ServerContext, options: &RewriteOptions, key: &str) -> Lookup {
    let Some(data) = server.metadata_cache().get(key).await else {
        return Lookup::Miss;
    };
    let result: CachedResult = match serde_json::from_slice(&data) {
        Ok(result) => result,
        Err(err) => {
            debug!("Ignoring corrupt metadata entry {key}: {err}");
            return Lookup::Miss;
        }
    };

    let now = server.now_ms();
    let purges = server.purges();
    if result.inputs.iter().all(|info| info.is_valid(now, purges)) {
        return Lookup::Hit(result);
    }

    server.statistics().increment(Stat::CachedOutputInvalid);
    let threshold = options.metadata_cache_staleness_threshold_ms;
    if result.error.is_none()
        && result
            .inputs
            .iter()
            .all(|info| info.is_stale_within(now, threshold, purges))
    {
        Lookup::Stale(result)
    } else {
        Lookup::Miss
    }
}

async fn store(server: &ServerContext, key: &str, result: &CachedResult) {
    match serde_json::to_vec(result) {
        Ok(data) => server.metadata_cache().put(key, Bytes::from(data)).await,
        Err(err) => debug!("Failed serializing result of {key}: {err}"),
    }
}

async fn fail(
    server: &ServerContext,
    key: &str,
    error: RewriteError,
    inputs: Vec<InputInfo>,
    abandoned: bool,
) -> RewriteOutcome {
    debug!("Rewrite {key} failed: {error}");
    let cacheable = error.is_cacheable();
    let mut outcome = RewriteOutcome::failed(error);
    outcome.result.inputs = inputs;
    if cacheable && !abandoned {
        store(server, key, &outcome.result).await;
    }
    enter(key, State::Ready);
    outcome
}

fn output_location(
    options: &RewriteOptions,
    request: &RewriteRequest,
    content_type: ContentType,
    name: Option<String>,
    contents: &[u8],
) -> Option<(Url, String)> {
    let first = request.inputs.first()?;
    let name = name.unwrap_or_else(|| {
        request
            .inputs
            .iter()
            .map(|url| escape_leaf(&leaf_of(url)))
            .collect::<Vec<_>>()
            .join("+")
    });
    let hash = hash_bytes(contents);
    let namer = ResourceNamer {
        name,
        id: request.id.id().to_owned(),
        hash: hash.clone(),
        ext: content_type.extension().to_owned(),
    };
    if namer.encode().len() > options.max_url_segment_size {
        return None;
    }
    let url = output_url(&directory_of(first), &namer)?;
    if url.as_str().len() > options.max_url_size {
        return None;
    }
    Some((url, hash))
}

#[allow(clippy::too_many_arguments)]
async fn publish(
    server: &ServerContext,
    options: &RewriteOptions,
    key: &str,
    request: &RewriteRequest,
    inputs: &[Resource],
    output: RewriteOutput,
    infos: Vec<InputInfo>,
    abandoned: bool,
) -> RewriteOutcome {
    enter(key, State::Publishing);
    let content_type = output.content_type.unwrap_or_else(|| {
        inputs
            .first()
            .map_or(ContentType::Other, Resource::content_type)
    });
    let mut result = CachedResult {
        version: RESULT_VERSION,
        optimizable: output.optimizable,
        content_type: Some(content_type),
        inlined_data: output.inlined_data,
        inputs: infos,
        dims: output.dims,
        dependencies: output.dependencies,
        vary: output.vary,
        ..Default::default()
    };

    let mut contents = None;
    if output.optimizable && output.publish {
        match output_location(options, request, content_type, output.name, &output.contents) {
            Some((url, hash)) => {
                let now = server.now_ms();
                let mut headers = HeaderMap::new();
                if let Ok(value) = HeaderValue::from_str(content_type.mime_type()) {
                    headers.insert(header::CONTENT_TYPE, value);
                }
                let private = inputs
                    .iter()
                    .any(|input| input.caching().is_some_and(|caching| caching.private));
                if private {
                    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("private"));
                }
                if !result.vary.is_empty() {
                    if let Ok(value) = HeaderValue::from_str(&result.vary.join(", ")) {
                        headers.insert(header::VARY, value);
                    }
                }
                let value = HttpValue {
                    status: StatusCode::OK,
                    headers,
                    body: output.contents.clone(),
                    date_ms: now,
                    expiration_ms: now + OUTPUT_TTL_MS,
                };
                server
                    .http_cache()
                    .put(url.as_str(), &options.cache_fragment, &value)
                    .await;
                trace!("Published {url}");
                result.url = Some(url.to_string());
                result.hash = Some(hash);
                contents = Some(output.contents);
            }
            None => {
                debug!("Output name of {key} exceeds URL size limits, keeping input");
                result.optimizable = false;
            }
        }
    }

    if abandoned {
        debug!("Not caching result of {key}: nested rewrites did not complete in time");
    } else {
        store(server, key, &result).await;
    }
    enter(key, State::Ready);
    RewriteOutcome { result, contents }
}

/// Loads an input from the HTTP cache or the origin.
pub(crate) async fn load_input(
    server: &ServerContext,
    options: &RewriteOptions,
    url: &Url,
) -> Result<Resource, RewriteError> {
    server.statistics().increment(Stat::ResourceRequests);
    match server
        .http_cache()
        .find(url.as_str(), &options.cache_fragment)
        .await
    {
        FindResult::Found(value) => {
            server.statistics().increment(Stat::ResourceCacheHits);
            let mut caching = CachingInfo::from_headers(
                value.status,
                &value.headers,
                value.date_ms,
                options.implicit_cache_ttl_ms,
            );
            caching.date_ms = value.date_ms;
            caching.expiration_ms = value.expiration_ms;
            Ok(Resource::loaded(
                url.clone(),
                FetchOutcome::Cached,
                value.headers,
                value.body,
                caching,
            ))
        }
        FindResult::RecentFetchFailed => Err(RewriteError::FetchFailed(
            url.to_string(),
            "failed recently".to_owned(),
        )),
        FindResult::RecentNotCacheable => Err(RewriteError::NotCacheable),
        FindResult::NotFound => fetch_input(server, options, url).await,
    }
}

async fn fetch_input(
    server: &ServerContext,
    options: &RewriteOptions,
    url: &Url,
) -> Result<Resource, RewriteError> {
    let cache = server.http_cache();
    let fragment = &options.cache_fragment;
    server.statistics().increment(Stat::ResourceFetches);

    let deadline = Duration::from_millis(options.fetch_deadline_ms);
    let response = match timeout(deadline, server.fetcher().fetch(FetchRequest::get(url.clone())))
        .await
    {
        Ok(Ok(response)) => response,
        Ok(Err(FetchError::Overload(host))) => {
            debug!("Not fetching {url}: too many requests to {host}");
            server.statistics().increment(Stat::RewritesDroppedOverload);
            return Err(RewriteError::Overload);
        }
        Ok(Err(err)) => {
            debug!("Fetching {url} failed: {err}");
            server.statistics().increment(Stat::ResourceFetchFailures);
            cache.remember_fetch_failed(url.as_str(), fragment).await;
            return Err(RewriteError::FetchFailed(url.to_string(), err.to_string()));
        }
        Err(_) => {
            debug!("Fetching {url} timed out");
            server.statistics().increment(Stat::ResourceFetchFailures);
            cache.remember_fetch_failed(url.as_str(), fragment).await;
            return Err(RewriteError::FetchFailed(
                url.to_string(),
                "timed out".to_owned(),
            ));
        }
    };

    if response.status != StatusCode::OK {
        debug!("Fetching {url} produced status {}", response.status);
        server.statistics().increment(Stat::ResourceFetchFailures);
        cache.remember_fetch_failed(url.as_str(), fragment).await;
        return Err(RewriteError::FetchFailed(
            url.to_string(),
            format!("status {}", response.status),
        ));
    }

    let now = server.now_ms();
    let mut caching = CachingInfo::from_headers(
        response.status,
        &response.headers,
        now,
        options.implicit_cache_ttl_ms,
    );
    if !caching.cacheable || caching.expiration_ms <= now {
        debug!("Not rewriting {url}: response is not cacheable");
        cache.remember_not_cacheable(url.as_str(), fragment).await;
        return Err(RewriteError::NotCacheable);
    }
    caching.date_ms = now;

    cache
        .put(
            url.as_str(),
            fragment,
            &HttpValue {
                status: response.status,
                headers: response.headers.clone(),
                body: response.body.clone(),
                date_ms: caching.date_ms,
                expiration_ms: caching.expiration_ms,
            },
        )
        .await;
    Ok(Resource::loaded(
        url.clone(),
        FetchOutcome::Fetched,
        response.headers,
        response.body,
        caching,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configuration::NestedDeadlinePolicy;
    use crate::registry::Filter;
    use crate::rewrite::RewriterId;
    use crate::testing::{MockTimer, MockUrlFetcher};

    use test_log::test;

    const CSS: &str = "body {\n  color: red;\n}\n";

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn setup(
        options: RewriteOptions,
    ) -> (Arc<ServerContext>, Arc<MockUrlFetcher>, Arc<MockTimer>) {
        let fetcher = Arc::new(MockUrlFetcher::new());
        fetcher.add_text("http://example.com/a.css", "text/css", CSS);
        let timer = Arc::new(MockTimer::new());
        let server = ServerContext::builder(options, fetcher.clone())
            .timer(timer.clone())
            .build()
            .unwrap();
        (server, fetcher, timer)
    }

    fn css_options() -> RewriteOptions {
        RewriteOptions {
            enabled_filters: [Filter::RewriteCss].into(),
            ..Default::default()
        }
    }

    fn css_request() -> RewriteRequest {
        RewriteRequest::new(
            RewriterId::Css,
            vec![url("http://example.com/a.css")],
            url("http://example.com/index.html"),
        )
    }

    #[test(tokio::test)]
    async fn rewrite_published_and_cached() {
        let (server, fetcher, _) = setup(css_options());
        let options = server.options().clone();

        let outcome = initiate(&server, &options, css_request(), true).wait().await;
        let rewritten = outcome.url().unwrap().to_owned();
        assert!(rewritten.starts_with("http://example.com/A.a.css.pagespeed.cf."));
        assert!(rewritten.ends_with(".css"));
        assert_eq!(outcome.contents.as_deref(), Some(&b"body{color:red}"[..]));

        let outcome = initiate(&server, &options, css_request(), true).wait().await;
        assert_eq!(outcome.url(), Some(rewritten.as_str()));
        assert!(outcome.contents.is_none());
        assert_eq!(fetcher.requests().len(), 1);
        assert_eq!(server.statistics().get(Stat::CachedOutputHits), 1);
        assert_eq!(server.statistics().get(Stat::RewritesExecuted), 1);
    }

    #[test(tokio::test)]
    async fn identical_rewrites_merged() {
        let (server, fetcher, _) = setup(css_options());
        fetcher.set_delay("http://example.com/a.css", Duration::from_millis(10));
        let options = server.options().clone();

        let first = initiate(&server, &options, css_request(), true);
        let second = initiate(&server, &options, css_request(), true);
        assert_eq!(server.inflight_rewrites(), 1);
        let (first, second) = tokio::join!(first.wait(), second.wait());
        assert_eq!(first.url(), second.url());
        assert_eq!(fetcher.requests().len(), 1);
        assert_eq!(server.statistics().get(Stat::RewritesDeduplicated), 1);
    }

    #[test(tokio::test)]
    async fn expired_input_invalidates_result() {
        let (server, fetcher, timer) = setup(css_options());
        let options = server.options().clone();

        initiate(&server, &options, css_request(), true).wait().await;
        timer.advance_ms(options.implicit_cache_ttl_ms + 1);
        initiate(&server, &options, css_request(), true).wait().await;
        assert_eq!(fetcher.requests().len(), 2);
        assert_eq!(server.statistics().get(Stat::CachedOutputInvalid), 1);
    }

    #[test(tokio::test)]
    async fn stale_result_served_while_refreshing() {
        let (server, fetcher, timer) = setup(RewriteOptions {
            metadata_cache_staleness_threshold_ms: 60_000,
            ..css_options()
        });
        let options = server.options().clone();

        let fresh = initiate(&server, &options, css_request(), true).wait().await;
        timer.advance_ms(options.implicit_cache_ttl_ms + 1000);
        let stale = initiate(&server, &options, css_request(), true).wait().await;
        assert_eq!(stale.url(), fresh.url());
        assert_eq!(server.statistics().get(Stat::CachedOutputStaleHits), 1);

        // Background refresh
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(fetcher.requests().len(), 2);

        // Nested rewrites never use stale results
        timer.advance_ms(options.implicit_cache_ttl_ms + 1000);
        initiate(&server, &options, css_request(), false).wait().await;
        assert_eq!(server.statistics().get(Stat::CachedOutputStaleHits), 1);
    }

    #[test(tokio::test)]
    async fn failures_remembered() {
        let (server, fetcher, _) = setup(css_options());
        let options = server.options().clone();
        let request = RewriteRequest::new(
            RewriterId::Css,
            vec![url("http://example.com/missing.css")],
            url("http://example.com/"),
        );

        let outcome = initiate(&server, &options, request.clone(), true).wait().await;
        assert_eq!(
            outcome.error(),
            Some(&RewriteError::FetchFailed(
                "http://example.com/missing.css".to_owned(),
                "status 404 Not Found".to_owned()
            ))
        );
        assert!(outcome.url().is_none());

        // The cached failure keeps its details
        let outcome = initiate(&server, &options, request, true).wait().await;
        assert!(matches!(
            outcome.error(),
            Some(RewriteError::FetchFailed(url, reason))
                if url == "http://example.com/missing.css" && reason == "status 404 Not Found"
        ));
        assert_eq!(fetcher.requests().len(), 1);
        assert_eq!(server.statistics().get(Stat::CachedOutputHits), 1);
    }

    #[test(tokio::test)]
    async fn unauthorized_not_fetched() {
        let (server, fetcher, _) = setup(css_options());
        let options = server.options().clone();
        let request = RewriteRequest::new(
            RewriterId::Css,
            vec![url("http://cdn.example.net/a.css")],
            url("http://example.com/"),
        );
        let outcome = initiate(&server, &options, request, true).wait().await;
        assert_eq!(
            outcome.error(),
            Some(&RewriteError::NotAuthorized(
                "http://cdn.example.net/a.css".to_owned()
            ))
        );
        assert!(fetcher.requests().is_empty());
    }

    #[test(tokio::test)]
    async fn uncacheable_inputs_not_rewritten() {
        let (server, fetcher, _) = setup(css_options());
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/css"));
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
        fetcher.add_response("http://example.com/a.css", StatusCode::OK, headers, CSS);
        let options = server.options().clone();

        let outcome = initiate(&server, &options, css_request(), true).wait().await;
        assert_eq!(outcome.error(), Some(&RewriteError::NotCacheable));
    }

    #[test(tokio::test)]
    async fn no_transform_respected() {
        let (server, fetcher, _) = setup(css_options());
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/css"));
        headers.insert(
            header::CACHE_CONTROL,
            HeaderValue::from_static("max-age=600, no-transform"),
        );
        fetcher.add_response("http://example.com/a.css", StatusCode::OK, headers, CSS);
        let options = server.options().clone();

        let outcome = initiate(&server, &options, css_request(), true).wait().await;
        assert_eq!(outcome.error(), Some(&RewriteError::NoTransformRequested));
        initiate(&server, &options, css_request(), true).wait().await;
        assert_eq!(server.statistics().get(Stat::CachedOutputHits), 0);
    }

    #[test(tokio::test)]
    async fn random_drop() {
        let (server, fetcher, _) = setup(RewriteOptions {
            rewrite_random_drop_percentage: 100,
            ..css_options()
        });
        let options = server.options().clone();
        let outcome = initiate(&server, &options, css_request(), true).wait().await;
        assert_eq!(outcome.error(), Some(&RewriteError::Dropped));
        assert!(fetcher.requests().is_empty());
        assert_eq!(server.statistics().get(Stat::RewritesDroppedRandomly), 1);
    }

    #[test(tokio::test(start_paused = true))]
    async fn abandoned_children_prevent_caching() {
        let (server, fetcher, _) = setup(RewriteOptions {
            enabled_filters: [Filter::RewriteCss, Filter::RecompressImages].into(),
            nested_deadline_policy: NestedDeadlinePolicy::Child,
            ..Default::default()
        });
        fetcher.add_text(
            "http://example.com/a.css",
            "text/css",
            "div { background: url(bg.png) }",
        );
        fetcher.add_response(
            "http://example.com/bg.png",
            StatusCode::OK,
            {
                let mut headers = HeaderMap::new();
                headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("image/png"));
                headers
            },
            crate::testing::png_image(10, 10, 1000),
        );
        fetcher.set_delay("http://example.com/bg.png", Duration::from_secs(1));
        let options = server.options().clone();

        let outcome = initiate(&server, &options, css_request(), true).wait().await;
        let contents = outcome.contents.clone().unwrap();
        assert_eq!(&contents[..], b"div{background:url(bg.png)}");

        let key = css_request().metadata_key(&options);
        assert!(server.metadata_cache().get(&key).await.is_none());
    }
}
