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

#![doc = include_str!("../README.md")]

use clap::Parser;
use http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use log::{error, info, warn};
use page_optimizer::fetch::{FetchRequest, FileSystemFetcher};
use page_optimizer::headers::ResponseHeaders;
use page_optimizer::html::IoWriter;
use page_optimizer::{
    Error, FromYaml, ResourceFetchHandler, ResourceResponse, RewriteDriver, RewriteOpt,
    RewriteOptions, ServerContext,
};
use serde::Deserialize;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use url::Url;

/// Size of the chunks documents are fed to the parser in
const CHUNK_SIZE: usize = 4096;

/// Rewrite pages and resources from a document root, writing the results to stdout
#[derive(Debug, Parser)]
struct Opt {
    /// Configuration file to load (can be specified multiple times)
    #[clap(short, long)]
    conf: Vec<PathBuf>,

    /// Directory containing the documents and resources
    #[clap(short, long)]
    root: Option<PathBuf>,

    /// URL the document root is available under
    #[clap(short, long)]
    origin: Option<Url>,

    /// Accept header to send with resource requests
    #[clap(long)]
    accept: Option<String>,

    /// Request body to send when a beacon URL is requested
    #[clap(long)]
    beacon_data: Option<String>,

    #[clap(flatten)]
    rewrite: RewriteOpt,

    /// Paths or URLs to process, in order and sharing all caches
    paths: Vec<String>,
}

/// Configuration file contents
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Conf {
    /// Directory containing the documents and resources
    root: Option<PathBuf>,

    /// URL the document root is available under
    origin: Option<String>,

    /// Lifetime of the origin’s responses in seconds
    max_age: Option<u64>,

    /// Page optimizer settings
    optimizer: RewriteOptions,
}

fn write_response(response: &ResourceResponse) -> std::io::Result<()> {
    let mut stdout = std::io::stdout().lock();
    let status = response.status();
    write!(
        stdout,
        "HTTP/1.1 {} {}\r\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or("")
    )?;
    for (name, value) in response.headers.headers() {
        stdout.write_all(name.as_str().as_bytes())?;
        stdout.write_all(b": ")?;
        stdout.write_all(value.as_bytes())?;
        stdout.write_all(b"\r\n")?;
    }
    stdout.write_all(b"\r\n")?;
    stdout.write_all(&response.body)?;
    stdout.flush()
}

fn is_html(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("text/html"))
}

async fn rewrite_page(
    server: &Arc<ServerContext>,
    url: Url,
    request_headers: HeaderMap,
) -> Result<(), Error> {
    let response = server
        .fetcher()
        .fetch(FetchRequest::get(url.clone()))
        .await
        .map_err(|err| Error::Aborted(format!("could not load {url}: {err}")))?;
    if !is_html(&response.headers) {
        warn!("{url} is not an HTML document, passing it through");
        let response = ResourceResponse {
            headers: ResponseHeaders::from_headers(response.status, response.headers),
            body: response.body,
        };
        write_response(&response)?;
        return Ok(());
    }

    let writer = IoWriter::with_headers(std::io::stdout());
    let mut driver = RewriteDriver::new(server.clone(), writer);
    driver.set_request_headers(Method::GET, request_headers);
    driver.set_response_headers(ResponseHeaders::from_headers(
        response.status,
        response.headers,
    ));
    driver.start_parse(url).await?;
    for chunk in response.body.chunks(CHUNK_SIZE) {
        driver.parse_text(chunk).await?;
    }
    driver.finish_parse().await?;
    std::io::stdout().write_all(b"\n")?;
    Ok(())
}

async fn process(
    server: &Arc<ServerContext>,
    handler: &ResourceFetchHandler,
    url: Url,
    request_headers: &HeaderMap,
    beacon_data: &str,
) -> Result<(), Error> {
    if handler.is_beacon_url(&url) {
        let status = handler.handle_beacon(&url, beacon_data.as_bytes()).await;
        info!("Beacon {url} resulted in {status}");
        return Ok(());
    }

    if handler.is_rewritten_url(&url) {
        let response = handler.fetch(&url).await;
        write_response(&response)?;
        return Ok(());
    }

    if let Some(response) = handler.fetch_in_place(&url, request_headers).await {
        if response.status() != StatusCode::NOT_FOUND {
            write_response(&response)?;
            return Ok(());
        }
    }

    rewrite_page(server, url, request_headers.clone()).await
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let opt = Opt::parse();

    let mut conf = match Conf::load_from_files(opt.conf.as_slice()) {
        Ok(conf) => conf,
        Err(err) => {
            error!("{err}");
            Conf::default()
        }
    };
    conf.optimizer.merge_with_opt(opt.rewrite);

    let root = opt.root.or(conf.root).unwrap_or_else(|| PathBuf::from("."));
    let origin = match opt.origin.map(Ok).unwrap_or_else(|| {
        Url::parse(conf.origin.as_deref().unwrap_or("http://localhost/"))
    }) {
        Ok(origin) => origin,
        Err(err) => {
            error!("Invalid origin: {err}");
            return;
        }
    };

    let mut request_headers = HeaderMap::new();
    if let Some(accept) = opt.accept {
        match HeaderValue::from_str(&accept) {
            Ok(value) => {
                request_headers.insert(header::ACCEPT, value);
            }
            Err(err) => {
                error!("Invalid Accept header: {err}");
                return;
            }
        }
    }
    let beacon_data = opt.beacon_data.unwrap_or_default();

    let server = match FileSystemFetcher::new(origin.clone(), &root, conf.max_age.unwrap_or(600))
        .and_then(|fetcher| ServerContext::builder(conf.optimizer, Arc::new(fetcher)).build())
    {
        Ok(server) => server,
        Err(err) => {
            error!("{err}");
            return;
        }
    };
    let handler = ResourceFetchHandler::new(server.clone());

    for path in &opt.paths {
        let url = match origin.join(path) {
            Ok(url) => url,
            Err(err) => {
                error!("Invalid path {path}: {err}");
                continue;
            }
        };
        if let Err(err) = process(&server, &handler, url, &request_headers, &beacon_data).await {
            error!("Failed processing {path}: {err}");
        }
    }
}
