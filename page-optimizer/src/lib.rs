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

//! # Page Optimizer
//!
//! This crate rewrites HTML responses in flight between an origin server and the browser. A
//! configurable set of filters shrinks, combines, inlines or defers the resources referenced
//! by a page: stylesheets, scripts and images. Optimized resources are published under
//! content-addressed URLs of the form `<name>.pagespeed.<id>.<hash>.<ext>` and can be served
//! with a long cache lifetime.
//!
//! ## Supported functionality
//!
//! * Streaming HTML processing: documents are parsed in arbitrary chunks, everything complete
//!   is written out on each flush.
//! * Resource rewriting with deduplication of identical work, a metadata cache remembering
//!   results (including failures) and a deadline after which the original URLs are kept.
//! * Image recompression, resizing, WebP conversion and inlining through a pluggable
//!   [`ImageOptimizer`](image::ImageOptimizer).
//! * CSS and JavaScript minification, combining and inlining, nested rewriting of images
//!   referenced by stylesheets.
//! * Dependency tracking: resources seen on a page are remembered and announced via
//!   `Link: rel=preload` headers on the next request.
//! * Serving rewritten resources via [`ResourceFetchHandler`], recomputing them if necessary.
//! * Critical resource beacons reporting back what the browser displayed without scrolling.
//!
//! ## Code example
//!
//! The host creates one [`ServerContext`] and a [`RewriteDriver`] per document:
//!
//! ```rust,no_run
//! use page_optimizer::fetch::FileSystemFetcher;
//! use page_optimizer::html::IoWriter;
//! use page_optimizer::{FromYaml, RewriteDriver, RewriteOptions, ServerContext};
//! use std::path::Path;
//! use std::sync::Arc;
//! use url::Url;
//!
//! # async fn run() -> Result<(), page_optimizer::Error> {
//! let options = RewriteOptions::load_from_yaml("optimizer.yaml")?;
//! let origin = Url::parse("http://localhost/").unwrap();
//! let root = Path::new("/var/www/html");
//! let fetcher = Arc::new(FileSystemFetcher::new(origin.clone(), root, 600)?);
//! let server = ServerContext::builder(options, fetcher).build()?;
//!
//! let mut driver = RewriteDriver::new(server, IoWriter::new(std::io::stdout()));
//! driver.start_parse(origin.join("index.html").unwrap()).await?;
//! driver.parse_text(b"<html><head><link rel=stylesheet href=a.css>").await?;
//! driver.parse_text(b"</head><body><img src=logo.png></body></html>").await?;
//! driver.finish_parse().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Configuration
//!
//! [`RewriteOptions`] can be loaded from YAML files via the [`FromYaml`] trait. Filters are
//! selected with the `rewrite_level`, `enabled_filters` and `disabled_filters` settings:
//!
//! ```yaml
//! rewrite_level: core_filters
//! enabled_filters: [inline_images, collect_dependencies, push_preload]
//! disabled_filters: [combine_javascript]
//! domains: ["*.example.com"]
//! image_inline_max_bytes: 4096
//! ```
//!
//! Command line options are available via [`RewriteOpt`] and can be applied with
//! [`RewriteOptions::merge_with_opt`].

pub mod cache;
mod configuration;
pub mod content_type;
pub mod css;
mod dependencies;
mod driver;
mod error;
pub mod fetch;
mod filters;
pub mod hasher;
pub mod headers;
pub mod html;
pub mod image;
pub mod js;
pub mod property_cache;
pub mod registry;
pub mod resource;
mod resource_fetch;
mod rewrite;
mod server_context;
pub mod statistics;
pub mod testing;
pub mod timer;
pub mod url_namer;

#[cfg(test)]
mod tests;

pub use configuration::{
    AllowVaryOn, FromYaml, NestedDeadlinePolicy, PurgeMethod, RequestOptions, RewriteLevel,
    RewriteOpt, RewriteOptions,
};
pub use driver::{RewriteDriver, PURGE_REQUEST_HEADER};
pub use error::{Error, RewriteError};
pub use filters::BEACON_PATH;
pub use registry::Filter;
pub use resource_fetch::{ResourceFetchHandler, ResourceResponse};
pub use rewrite::{CachedResult, RewriteOutcome, RewriteParams, RewriteRequest, RewriterId};
pub use server_context::{ServerContext, ServerContextBuilder};
