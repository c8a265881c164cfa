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
use crate::content_type::ContentType;
use crate::hasher::hash_bytes;
use crate::property_cache::PropertyPage;
use crate::server_context::page_key;
use crate::testing::{gif_image, png_image};
use crate::{css, js, Filter};

use http::header;
use test_log::test;

const STYLE_A: &str = "a { color: red }\n";
const STYLE_B: &str = "b { color: blue }\n";
const SCRIPT_B: &str = "var b = 1;  // first\n";
const SCRIPT_C: &str = "var c = 2;\n";

fn server(filters: &[Filter]) -> TestServer {
    let server = TestServer::new(options(filters));
    server.add("a.css", "text/css", STYLE_A);
    server.add("b.css", "text/css", STYLE_B);
    server.add("b.js", "application/javascript", SCRIPT_B);
    server.add("c.js", "application/javascript", SCRIPT_C);
    server
}

#[test(tokio::test(start_paused = true))]
async fn combine_stylesheets() {
    let server = server(&[Filter::CombineCss]);
    let combined = format!("{STYLE_A}\n{STYLE_B}");
    let (html, _) = server
        .rewrite(
            "index.html",
            "<head><link rel=stylesheet href=a.css>\n<link rel=stylesheet href=b.css></head>",
        )
        .await;
    assert_eq!(
        html,
        format!(
            "<head><link rel=stylesheet href=\"a.css+b.css.pagespeed.cc.{}.css\">\n</head>",
            hash_bytes(combined.as_bytes())
        )
    );

    // Different media and other content end a group
    let html = "<link rel=stylesheet href=a.css media=print><link rel=stylesheet href=b.css>\
        <p>x</p><link rel=stylesheet href=a.css>";
    assert_eq!(server.rewrite("index.html", html).await.0, html);

    // Identical groups share a rewrite, both are replaced
    let (html, _) = server
        .rewrite(
            "index.html",
            "<link rel=stylesheet href=a.css><link rel=stylesheet href=b.css><p>x</p>\
            <link rel=stylesheet href=a.css><link rel=stylesheet href=b.css>",
        )
        .await;
    let link = format!(
        "<link rel=stylesheet href=\"a.css+b.css.pagespeed.cc.{}.css\">",
        hash_bytes(combined.as_bytes())
    );
    assert_eq!(html, format!("{link}<p>x</p>{link}"));
}

#[test(tokio::test(start_paused = true))]
async fn combine_scripts() {
    let server = server(&[Filter::CombineJavascript, Filter::RewriteJavascript]);
    let combined = format!("{};\n{}", js::minify(SCRIPT_B), js::minify(SCRIPT_C));
    let (html, _) = server
        .rewrite("index.html", "<script src=b.js></script><script src=c.js></script>")
        .await;
    assert_eq!(
        html,
        format!(
            "<script src=\"b.js+c.js.pagespeed.jc.{}.js\"></script>",
            hash_bytes(combined.as_bytes())
        )
    );

    // Asynchronous scripts aren’t combined, neither are scripts in strict mode
    let server = server_with_strict_script();
    let html = "<script src=b.js async></script><script src=c.js></script>\
        <script src=strict.js></script>";
    assert_eq!(server.rewrite("index.html", html).await.0, html);
}

fn server_with_strict_script() -> TestServer {
    let server = server(&[Filter::CombineJavascript]);
    server.add(
        "strict.js",
        "application/javascript",
        "\"use strict\";\nvar s = 1;\n",
    );
    server
}

#[test(tokio::test(start_paused = true))]
async fn strict_mode_prevents_combining() {
    let server = server_with_strict_script();
    let html = "<script src=c.js></script><script src=strict.js></script>";
    assert_eq!(server.rewrite("index.html", html).await.0, html);
}

#[test(tokio::test(start_paused = true))]
async fn rewrite_stylesheets() {
    let server = server(&[Filter::RewriteCss]);
    let (html, _) = server
        .rewrite(
            "index.html",
            "<link rel=stylesheet href=a.css><style>\n  p  { margin: 0 }\n</style>",
        )
        .await;
    assert_eq!(
        html,
        format!(
            "<link rel=stylesheet href=\"A.a.css.pagespeed.cf.{}.css\"><style>{}</style>",
            hash_bytes(css::minify(STYLE_A).as_bytes()),
            css::minify("\n  p  { margin: 0 }\n")
        )
    );

    // Unparsable inline styles are kept
    let html = "<style>p { margin: 0</style>";
    assert_eq!(server.rewrite("index.html", html).await.0, html);
}

#[test(tokio::test(start_paused = true))]
async fn rewrite_scripts() {
    let server = server(&[Filter::RewriteJavascript]);
    let (html, _) = server
        .rewrite(
            "index.html",
            "<script src=b.js></script><script>var x = 1;  // inline\n</script>",
        )
        .await;
    assert_eq!(
        html,
        format!(
            "<script src=\"b.js.pagespeed.jm.{}.js\"></script><script>{}</script>",
            hash_bytes(js::minify(SCRIPT_B).as_bytes()),
            js::minify("var x = 1;  // inline\n")
        )
    );

    // Other script types and opted out elements stay unchanged
    let html = "<script type=text/template src=b.js></script>\
        <script src=b.js pagespeed_no_transform></script>";
    assert_eq!(server.rewrite("index.html", html).await.0, html);
}

#[test(tokio::test(start_paused = true))]
async fn inline_small_resources() {
    let server = server(&[Filter::InlineCss, Filter::InlineJavascript]);
    server.add("dir/bg.css", "text/css", "p { background: url(bg.png) }");
    let (html, _) = server
        .rewrite(
            "index.html",
            "<link rel=stylesheet href=a.css media=screen><link rel=stylesheet href=dir/bg.css>\
            <script src=c.js></script>",
        )
        .await;
    assert_eq!(
        html,
        format!(
            "<style media=\"screen\">{STYLE_A}</style>\
            <style>p {{ background: url(http://example.com/dir/bg.png) }}</style>\
            <script>{SCRIPT_C}</script>"
        )
    );

    // Print stylesheets and large resources stay external
    let mut options = options(&[Filter::InlineCss, Filter::InlineJavascript]);
    options.js_inline_max_bytes = 5;
    let server = TestServer::new(options);
    server.add("a.css", "text/css", STYLE_A);
    server.add("c.js", "application/javascript", SCRIPT_C);
    let html = "<link rel=stylesheet href=a.css media=print><script src=c.js></script>";
    assert_eq!(server.rewrite("index.html", html).await.0, html);
}

#[test(tokio::test(start_paused = true))]
async fn cache_extend_images() {
    let server = server(&[Filter::CacheExtendImages]);
    let icon = png_image(16, 16, 100);
    let image = gif_image(10, 10, 1, 100);
    server.add("favicon.png", "image/png", icon.clone());
    server.add("img/x.gif", "image/gif", image.clone());
    let (html, _) = server
        .rewrite(
            "index.html",
            "<link rel=icon href=favicon.png><img src=img/x.gif><link rel=stylesheet href=a.css>",
        )
        .await;
    assert_eq!(
        html,
        format!(
            "<link rel=icon href=\"favicon.png.pagespeed.ce.{}.png\">\
            <img src=\"img/x.gif.pagespeed.ce.{}.gif\">\
            <link rel=stylesheet href=a.css>",
            hash_bytes(&icon),
            hash_bytes(&image)
        )
    );
}

#[test(tokio::test(start_paused = true))]
async fn srcset_candidates_rewritten() {
    let server = server(&[Filter::RecompressImages]);
    server.add("b.png", "image/png", png_image(10, 10, 1000));
    server.add("c.png", "image/png", png_image(20, 20, 1000));
    let (html, _) = server
        .rewrite(
            "index.html",
            "<img srcset=\"data:image/png;base64,AAAA 1x,b.png 2x, c.png (x,y) 3x\">",
        )
        .await;
    assert_eq!(
        html,
        format!(
            "<img srcset=\"data:image/png;base64,AAAA 1x, \
            b.pagespeed.ic.{}.png 2x, c.pagespeed.ic.{}.png (x,y) 3x\">",
            hash_bytes(&png_image(10, 10, 500)),
            hash_bytes(&png_image(20, 20, 500))
        )
    );
}

#[test(tokio::test(start_paused = true))]
async fn imported_stylesheets_collected() {
    let server = server(&[Filter::CollectDependencies]);
    server.add("main.css", "text/css", "@import url(b.css);\np { margin: 0 }");
    let (html, _) = server
        .rewrite(
            "index.html",
            "<link rel=stylesheet href=main.css><script src=c.js></script>",
        )
        .await;
    assert_eq!(
        html,
        "<link rel=stylesheet href=main.css><script src=c.js></script>"
    );

    let key = page_key(server.server.options(), &url("index.html"));
    let page = PropertyPage::read(server.server.property_store(), &key).await;
    let dependencies = page
        .dependencies()
        .dependencies
        .iter()
        .map(|dependency| {
            (
                dependency.url.as_str(),
                dependency.content_type,
                dependency.order_key.clone(),
            )
        })
        .collect::<Vec<_>>();
    assert_eq!(
        dependencies,
        vec![
            ("http://example.com/main.css", ContentType::Css, vec![0]),
            ("http://example.com/b.css", ContentType::Css, vec![0, 0]),
            ("http://example.com/c.js", ContentType::Javascript, vec![1]),
        ]
    );
}

#[test(tokio::test(start_paused = true))]
async fn add_ids_to_divs() {
    let server = server(&[Filter::AddIds]);
    let (html, _) = server
        .rewrite(
            "index.html",
            "<div id=main><span></span><div>a</div></div><div>b</div>",
        )
        .await;
    assert_eq!(
        html,
        "<div id=main><span></span><div id=\"PageSpeed-main-1\">a</div></div>\
        <div id=\"PageSpeed-1\">b</div>"
    );
}

#[test(tokio::test(start_paused = true))]
async fn defer_iframes() {
    let server = server(&[Filter::DeferIframe]);
    let (html, _) = server
        .rewrite(
            "index.html",
            "<body><iframe src=frame.html></iframe><p>text</p></body>",
        )
        .await;
    // Injecting scripts enables the noscript fallback
    let redirect = "http://example.com/index.html?PageSpeed=noscript";
    assert!(html.starts_with(&format!(
        "<body><noscript><meta http-equiv=\"refresh\" content=\"0;url='{redirect}'\">"
    )));
    assert!(html.contains(&format!("<a href=\"{redirect}\">here</a>")));
    assert!(html.contains(
        "</noscript><pagespeed_iframe src=frame.html></pagespeed_iframe><p>text</p><script>"
    ));
    assert!(html.contains("getElementsByTagName(\"pagespeed_iframe\")"));
    assert!(html.ends_with("</script></body>"));

    let mut options = options(&[Filter::DeferIframe]);
    options.disabled_filters.insert(Filter::SupportNoscript);
    let server = TestServer::new(options);
    let (html, _) = server
        .rewrite(
            "index.html",
            "<body><iframe src=frame.html></iframe><p>text</p></body>",
        )
        .await;
    assert!(html.starts_with(
        "<body><pagespeed_iframe src=frame.html></pagespeed_iframe><p>text</p><script>"
    ));
    assert!(!html.contains("noscript"));

    let html = "<body><iframe src=frame.html pagespeed_no_transform></iframe></body>";
    assert_eq!(server.rewrite("index.html", html).await.0, html);
}

#[test(tokio::test(start_paused = true))]
async fn meta_tags_become_headers() {
    let server = server(&[Filter::ConvertMetaTags]);
    let html = "<head><meta http-equiv=\"Content-Language\" content=\"de\">\
        <meta http-equiv=refresh content=\"5\"><meta charset=utf-8></head>";
    let (output, headers) = server.rewrite("index.html", html).await;
    assert_eq!(output, html);
    assert_eq!(headers.get_str(header::CONTENT_LANGUAGE), Some("de"));
    assert!(!headers.contains(header::REFRESH));
}
