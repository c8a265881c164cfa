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

use super::{options, url, TestServer};
use crate::cache::FindResult;
use crate::content_type::ContentType;
use crate::hasher::hash_bytes;
use crate::headers::ResponseHeaders;
use crate::property_cache::PropertyPage;
use crate::rewrite::{CachedResult, RewriteRequest, RewriterId};
use crate::server_context::page_key;
use crate::statistics::Stat;
use crate::testing::{gif_image, jpeg_image, png_image, MockTimer, StringWriter};
use crate::{
    css, js, AllowVaryOn, Error, Filter, PurgeMethod, ResourceFetchHandler, RewriteDriver,
    PURGE_REQUEST_HEADER,
};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use std::time::Duration;
use test_log::test;

const SCRIPT: &str = "var a = 1;  // increment later\n";

#[test(tokio::test(start_paused = true))]
async fn small_animated_gif_inlined() {
    let mut options = options(&[
        Filter::InlineImages,
        Filter::RecompressImages,
        Filter::ResizeImages,
    ]);
    options.image_inline_max_bytes = 10000;
    options.allow_vary_on = AllowVaryOn::try_from("accept").unwrap();
    let server = TestServer::new(options);
    let image = gif_image(48, 64, 3, 200);
    server.add("small.gif", "image/gif", image.clone());

    let mut response_headers = ResponseHeaders::new(StatusCode::OK);
    response_headers.set(header::VARY, "Accept-Encoding");
    let (html, headers) = server
        .rewrite_with(
            "index.html",
            HeaderMap::new(),
            response_headers,
            &["<img src=small.gif width=48 height=64>"],
        )
        .await;
    assert_eq!(
        html,
        format!(
            "<img width=48 height=64 src=\"data:image/gif;base64,{}\">",
            STANDARD.encode(&image)
        )
    );
    assert_eq!(headers.get_str(header::VARY), Some("Accept-Encoding"));
    assert_eq!(server.server.statistics().get(Stat::ResourcesInlined), 1);
}

#[test(tokio::test(start_paused = true))]
async fn stylesheet_with_nested_image() {
    let options = options(&[Filter::RewriteCss, Filter::RecompressImages]);
    let server = TestServer::new(options);
    let source = "body { background: url(bg.png) }\n";
    server.add("a.css", "text/css", source);
    server.add("bg.png", "image/png", png_image(10, 10, 1000));

    let image = format!("bg.pagespeed.ic.{}.png", hash_bytes(&png_image(10, 10, 500)));
    let expected_css = css::minify(&format!(
        "body {{ background: url({}) }}\n",
        css::quote_url(&image)
    ));
    let stylesheet = format!("A.a.css.pagespeed.cf.{}.css", hash_bytes(expected_css.as_bytes()));

    let (html, _) = server
        .rewrite("index.html", "<link rel=stylesheet href=a.css>")
        .await;
    assert_eq!(html, format!("<link rel=stylesheet href=\"{stylesheet}\">"));

    let FindResult::Found(value) = server
        .server
        .http_cache()
        .find(url(&stylesheet).as_str(), "")
        .await
    else {
        panic!("rewritten stylesheet not cached");
    };
    assert_eq!(value.body, expected_css);

    let request = RewriteRequest::new(RewriterId::Css, vec![url("a.css")], url("index.html"));
    let key = request.metadata_key(server.server.options());
    let data = server.server.metadata_cache().get(&key).await.unwrap();
    let result: CachedResult = serde_json::from_slice(&data).unwrap();
    let inputs = result
        .inputs
        .iter()
        .filter_map(|info| info.url.clone())
        .collect::<Vec<_>>();
    assert_eq!(
        inputs,
        vec![url("a.css").to_string(), url("bg.png").to_string()]
    );
}

#[test(tokio::test(start_paused = true))]
async fn dependencies_preloaded_on_next_request() {
    let options = options(&[
        Filter::RewriteJavascript,
        Filter::CollectDependencies,
        Filter::PushPreload,
    ]);
    let server = TestServer::new(options);
    server.add("b.js", "application/javascript", SCRIPT);
    let script = format!(
        "b.js.pagespeed.jm.{}.js",
        hash_bytes(js::minify(SCRIPT).as_bytes())
    );

    let (html, headers) = server
        .rewrite("index.html", "<script src=b.js></script>")
        .await;
    assert_eq!(html, format!("<script src=\"{script}\"></script>"));
    assert!(!headers.contains(header::LINK));

    let key = page_key(server.server.options(), &url("index.html"));
    let page = PropertyPage::read(server.server.property_store(), &key).await;
    let dependencies = &page.dependencies().dependencies;
    assert_eq!(dependencies.len(), 1);
    assert_eq!(dependencies[0].url, url(&script).to_string());
    assert_eq!(dependencies[0].content_type, ContentType::Javascript);
    assert_eq!(dependencies[0].validity_info.len(), 1);
    assert_eq!(
        dependencies[0].validity_info[0].url.as_deref(),
        Some(url("b.js").as_str())
    );
    assert_eq!(
        dependencies[0].validity_info[0].expiration_time_ms,
        Some(MockTimer::START_MS + 300_000)
    );

    server.timer.advance_ms(100_000);
    let (html, headers) = server
        .rewrite("index.html", "<script src=b.js></script>")
        .await;
    assert_eq!(html, format!("<script src=\"{script}\"></script>"));
    assert_eq!(
        headers.get_str(header::LINK),
        Some(format!("</{script}>; rel=preload; as=script; nopush").as_str())
    );

    // Purged inputs no longer produce hints
    server.timer.advance_ms(1000);
    server.server.purge_url(&url("b.js"));
    server.timer.advance_ms(1000);
    let mut driver = RewriteDriver::new(server.server.clone(), StringWriter::default());
    driver.start_parse(url("index.html")).await.unwrap();
    driver.parse_text(b"<p>x</p>").await.unwrap();
    driver.finish_parse().await.unwrap();
    assert!(!driver.response_headers().contains(header::LINK));
}

#[test(tokio::test(start_paused = true))]
async fn request_with_wrong_hash() {
    let options = options(&[Filter::RecompressImages]);
    let server = TestServer::new(options);
    server.add("foo.jpg", "image/jpeg", jpeg_image(100, 100, 2000));
    let handler = ResourceFetchHandler::new(server.server.clone());

    let response = handler
        .fetch(&url("foo.pagespeed.ic.wrongHash0.jpg"))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.body, jpeg_image(100, 100, 1000));
    assert_eq!(
        response.headers.get_str(header::CACHE_CONTROL),
        Some("max-age=300, public")
    );
    assert_eq!(server.server.statistics().get(Stat::HashMismatchFetches), 1);

    let response = handler
        .fetch(&url("bar.pagespeed.ic.wrongHash0.jpg"))
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(
        response.headers.get_str(header::CONTENT_TYPE),
        Some("text/plain")
    );
    assert_eq!(
        response.headers.get_str("x-content-type-options"),
        Some("nosniff")
    );
}

#[test(tokio::test(start_paused = true))]
async fn slow_rewrite_used_by_next_request() {
    let options = options(&[Filter::RewriteJavascript]);
    let server = TestServer::new(options);
    server.add("b.js", "application/javascript", SCRIPT);
    server
        .fetcher
        .set_delay(url("b.js").as_str(), Duration::from_millis(50));

    let (html, _) = server
        .rewrite("index.html", "<script src=b.js></script>")
        .await;
    assert_eq!(html, "<script src=b.js></script>");
    assert_eq!(server.server.statistics().get(Stat::RewritesAbandoned), 1);

    // The rewrite completes in the background
    tokio::time::sleep(Duration::from_millis(100)).await;

    let (html, _) = server
        .rewrite("index.html", "<script src=b.js></script>")
        .await;
    assert_eq!(
        html,
        format!(
            "<script src=\"b.js.pagespeed.jm.{}.js\"></script>",
            hash_bytes(js::minify(SCRIPT).as_bytes())
        )
    );
    assert_eq!(server.fetcher.request_count(url("b.js").as_str()), 1);
}

#[test(tokio::test(start_paused = true))]
async fn oversized_document_redirects() {
    let mut options = options(&[Filter::RedirectOnSizeLimit, Filter::AddIds]);
    options.max_html_parse_bytes = 1_000_000;
    let server = TestServer::new(options);

    let filler = "x".repeat(1_000_000);
    let (html, _) = server
        .rewrite_with(
            "page.html?a=1",
            HeaderMap::new(),
            ResponseHeaders::default(),
            &["<div><p>", &filler, "</p></div>", "<div>after</div>"],
        )
        .await;
    let expected = format!(
        "<div id=\"PageSpeed-0\"><p>{filler}</p></div>\
        <script>window.location=\"http://example.com/page.html?a=1&ModPagespeed=off\";</script>\
        <div>after</div>"
    );
    assert_eq!(html, expected);
    assert_eq!(
        server.server.statistics().get(Stat::HtmlSizeLimitExceeded),
        1
    );
}

#[test(tokio::test)]
async fn failing_writer() {
    let server = TestServer::new(options(&[Filter::AddIds]));
    let mut driver = RewriteDriver::new(server.server.clone(), StringWriter::failing());
    driver.start_parse(url("index.html")).await.unwrap();
    driver.parse_text(b"<div>x</div>").await.unwrap();
    assert!(matches!(driver.flush().await, Err(Error::Io(_))));

    // Further output is dropped silently
    driver.parse_text(b"<div>y</div>").await.unwrap();
    driver.finish_parse().await.unwrap();
    assert_eq!(driver.writer().text(), "");
}

#[test(tokio::test(start_paused = true))]
async fn incomplete_rewrites_purge_downstream_cache() {
    let mut options = options(&[Filter::RewriteJavascript]);
    options.downstream_cache_purge_location_prefix = "http://cache.example.com/purge/".to_owned();
    options.downstream_cache_purge_method = PurgeMethod::Purge;
    let server = TestServer::new(options);
    server.add("b.js", "application/javascript", SCRIPT);
    server
        .fetcher
        .set_delay(url("b.js").as_str(), Duration::from_millis(50));
    let purge_url = "http://cache.example.com/purge/index.html?a=1";

    let (html, _) = server
        .rewrite("index.html?a=1", "<script src=b.js></script>")
        .await;
    assert_eq!(html, "<script src=b.js></script>");
    let purges = server
        .fetcher
        .requests()
        .into_iter()
        .filter(|request| request.url.as_str() == purge_url)
        .collect::<Vec<_>>();
    assert_eq!(purges.len(), 1);
    assert_eq!(purges[0].method, Method::from_bytes(b"PURGE").unwrap());
    assert!(purges[0].headers.contains_key(PURGE_REQUEST_HEADER));
    assert_eq!(
        server
            .server
            .statistics()
            .get(Stat::DownstreamCachePurgeAttempts),
        1
    );

    // Requests sent by the purge itself don’t trigger another purge
    let mut headers = HeaderMap::new();
    headers.insert(PURGE_REQUEST_HEADER, HeaderValue::from_static("1"));
    let (html, _) = server
        .rewrite_with(
            "index.html?a=1",
            headers,
            ResponseHeaders::default(),
            &["<script src=b.js></script>"],
        )
        .await;
    assert_eq!(html, "<script src=b.js></script>");
    assert_eq!(server.fetcher.request_count(purge_url), 1);

    // Once the rewrite is complete there is nothing to purge
    tokio::time::sleep(Duration::from_millis(100)).await;
    let (html, _) = server
        .rewrite("index.html?a=1", "<script src=b.js></script>")
        .await;
    assert_ne!(html, "<script src=b.js></script>");
    assert_eq!(server.fetcher.request_count(purge_url), 1);
}

#[test(tokio::test(start_paused = true))]
async fn overloaded_image_rewrite_retried() {
    let server = TestServer::new(options(&[Filter::RecompressImages]));
    server.add("b.png", "image/png", png_image(10, 10, 1000));
    let rewritten = format!(
        "<img src=\"b.pagespeed.ic.{}.png\">",
        hash_bytes(&png_image(10, 10, 500))
    );

    let permits = server
        .server
        .image_permits()
        .clone()
        .acquire_many_owned(server.server.options().image_max_rewrites_at_once as u32)
        .await
        .unwrap();
    let (html, _) = server.rewrite("index.html", "<img src=b.png>").await;
    assert_eq!(html, "<img src=b.png>");
    assert_eq!(
        server.server.statistics().get(Stat::RewritesDroppedOverload),
        1
    );

    // The failure isn’t remembered, the next request rewrites the image
    drop(permits);
    let (html, _) = server.rewrite("index.html", "<img src=b.png>").await;
    assert_eq!(html, rewritten);
}
