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

//! Helpers for testing code built on the optimizer
//!
//! [`MockUrlFetcher`] serves canned responses, [`StringWriter`] collects rewritten HTML and
//! [`TestImageOptimizer`] produces predictable image output. The image generators create data
//! with valid headers (so that dimensions can be determined) but without meaningful pixels.

pub use crate::timer::MockTimer;

use crate::content_type::ContentType;
use crate::error::{Error, RewriteError};
use crate::fetch::{FetchError, FetchRequest, FetchResponse, UrlAsyncFetcher};
use crate::headers::ResponseHeaders;
use crate::html::HtmlWriter;
use crate::image::{Dimensions, ImageOptimizer, ImageRequest, OptimizedImage};

use async_trait::async_trait;
use bytes::Bytes;
use http::{header, HeaderMap, HeaderValue, StatusCode};
use log::trace;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone)]
enum Canned {
    Response(Box<FetchResponse>),
    Failure(String),
}

/// Fetcher answering from a set of canned responses
///
/// Unknown URLs produce a 404 response. All requests are recorded, including purge requests.
#[derive(Debug, Default)]
pub struct MockUrlFetcher {
    responses: Mutex<HashMap<String, Canned>>,
    delays: Mutex<HashMap<String, Duration>>,
    requests: Mutex<Vec<FetchRequest>>,
}

impl MockUrlFetcher {
    /// Creates a fetcher without any responses.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a `200 OK` response with the given content type and no caching headers.
    pub fn add_text(&self, url: &str, content_type: &str, body: &str) {
        let mut headers = HeaderMap::new();
        if let Ok(value) = HeaderValue::from_str(content_type) {
            headers.insert(header::CONTENT_TYPE, value);
        }
        self.add_response(
            url,
            StatusCode::OK,
            headers,
            Bytes::copy_from_slice(body.as_bytes()),
        );
    }

    /// Adds an arbitrary response.
    pub fn add_response(
        &self,
        url: &str,
        status: StatusCode,
        headers: HeaderMap,
        body: impl Into<Bytes>,
    ) {
        let response = FetchResponse {
            status,
            headers,
            body: body.into(),
        };
        self.responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(url.to_owned(), Canned::Response(Box::new(response)));
    }

    /// Makes requests for the URL fail without a response.
    pub fn add_failure(&self, url: &str, reason: &str) {
        self.responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(url.to_owned(), Canned::Failure(reason.to_owned()));
    }

    /// Removes the response for a URL, it will produce 404 from now on.
    pub fn remove(&self, url: &str) {
        self.responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(url);
    }

    /// Delays responses for the URL. The delay uses tokio’s clock, so tests with paused time
    /// don’t actually wait.
    pub fn set_delay(&self, url: &str, delay: Duration) {
        self.delays
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(url.to_owned(), delay);
    }

    /// All requests received so far
    pub fn requests(&self) -> Vec<FetchRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Number of requests received for a URL
    pub fn request_count(&self, url: &str) -> usize {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|request| request.url.as_str() == url)
            .count()
    }
}

#[async_trait]
impl UrlAsyncFetcher for MockUrlFetcher {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, FetchError> {
        trace!("Mock fetch: {} {}", request.method, request.url);
        let url = request.url.to_string();
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request);

        let delay = self
            .delays
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&url)
            .copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let canned = self
            .responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&url)
            .cloned();
        match canned {
            Some(Canned::Response(response)) => Ok(*response),
            Some(Canned::Failure(reason)) => Err(FetchError::Failed(reason)),
            None => Ok(FetchResponse::empty(StatusCode::NOT_FOUND)),
        }
    }
}

/// Writer collecting the output in memory
#[derive(Debug, Default)]
pub struct StringWriter {
    headers: Option<ResponseHeaders>,
    text: String,
    fail: bool,
}

impl StringWriter {
    /// A writer rejecting every write, simulating a closed connection.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    /// Everything written so far
    pub fn text(&self) -> String {
        self.text.clone()
    }

    /// Whether the headers were written
    pub fn headers_written(&self) -> bool {
        self.headers.is_some()
    }

    /// The headers as written
    pub fn headers(&self) -> Option<&ResponseHeaders> {
        self.headers.as_ref()
    }

    fn check(&self) -> Result<(), Error> {
        if self.fail {
            Err(Error::Io(std::io::ErrorKind::BrokenPipe.into()))
        } else {
            Ok(())
        }
    }
}

impl HtmlWriter for StringWriter {
    fn write_headers(&mut self, headers: &ResponseHeaders) -> Result<(), Error> {
        self.check()?;
        self.headers = Some(headers.clone());
        Ok(())
    }

    fn write(&mut self, text: &str) -> Result<(), Error> {
        self.check()?;
        self.text.push_str(text);
        Ok(())
    }
}

/// Image optimizer halving the size of every image
///
/// The output is a synthetic image of the requested format and dimensions, so that the result
/// is deterministic and can be recognized by [`crate::image::sniff`].
#[derive(Debug, Default)]
pub struct TestImageOptimizer {
    calls: AtomicUsize,
}

impl TestImageOptimizer {
    /// Creates a new optimizer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of images processed so far
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ImageOptimizer for TestImageOptimizer {
    async fn optimize(
        &self,
        request: &ImageRequest,
        data: Bytes,
    ) -> Result<OptimizedImage, RewriteError> {
        self.calls.fetch_add(1, Ordering::Relaxed);

        let dimensions = request.resize_to.unwrap_or(request.input.dimensions);
        let content_type = if request.convert_to_webp {
            ContentType::Webp
        } else {
            request.input.content_type
        };
        let len = data.len() / 2;
        let Dimensions { width, height } = dimensions;
        let output = match content_type {
            ContentType::Png => png_image(width, height, len),
            ContentType::Gif => gif_image(width, height, 1, len),
            ContentType::Jpeg => jpeg_image(width, height, len),
            ContentType::Webp => webp_image(width, height, len),
            _ => return Err(RewriteError::ParseFailed),
        };
        Ok(OptimizedImage {
            data: Bytes::from(output),
            content_type,
            dimensions,
        })
    }
}

fn pad(data: &mut Vec<u8>, len: usize) {
    if data.len() < len {
        data.resize(len, 0);
    }
}

/// Generates a PNG image header, padded with zeros to `len` bytes.
pub fn png_image(width: u32, height: u32, len: usize) -> Vec<u8> {
    let mut data = b"\x89PNG\r\n\x1a\n".to_vec();
    data.extend_from_slice(&13u32.to_be_bytes());
    data.extend_from_slice(b"IHDR");
    data.extend_from_slice(&width.to_be_bytes());
    data.extend_from_slice(&height.to_be_bytes());
    // Bit depth, color type, compression, filter, interlace, CRC
    data.extend_from_slice(&[8, 6, 0, 0, 0]);
    data.extend_from_slice(&[0; 4]);
    pad(&mut data, len);
    data
}

/// Generates a GIF image with the given number of frames and exactly `len` bytes, unless the
/// structure requires more.
pub fn gif_image(width: u32, height: u32, frames: usize, len: usize) -> Vec<u8> {
    let dim = |value: u32| u16::try_from(value).unwrap_or(u16::MAX).to_le_bytes();

    let mut data = b"GIF89a".to_vec();
    data.extend_from_slice(&dim(width));
    data.extend_from_slice(&dim(height));
    // No global color table, background color, aspect ratio
    data.extend_from_slice(&[0, 0, 0]);

    // Image descriptor, LZW code size, sub-block terminator and trailer
    let frame_len = 10 + 1 + 1;
    let mut padding = len.saturating_sub(data.len() + frames * frame_len + 1);
    for _ in 0..frames {
        data.push(0x2C);
        data.extend_from_slice(&[0; 4]);
        data.extend_from_slice(&dim(width));
        data.extend_from_slice(&dim(height));
        data.push(0);
        data.push(2);
        while padding >= 2 {
            let block = (padding - 1).min(255);
            data.push(block as u8);
            data.extend(std::iter::repeat(0x55).take(block));
            padding -= block + 1;
        }
        data.push(0);
    }
    data.push(0x3B);
    pad(&mut data, len);
    data
}

/// Generates a baseline JPEG image header, padded to `len` bytes.
pub fn jpeg_image(width: u32, height: u32, len: usize) -> Vec<u8> {
    let dim = |value: u32| u16::try_from(value).unwrap_or(u16::MAX).to_be_bytes();

    let mut data = vec![0xFF, 0xD8, 0xFF, 0xC0, 0x00, 0x11, 0x08];
    data.extend_from_slice(&dim(height));
    data.extend_from_slice(&dim(width));
    data.push(3);
    for component in 1..=3 {
        data.extend_from_slice(&[component, 0x11, 0]);
    }
    pad(&mut data, len.saturating_sub(2));
    data.extend_from_slice(&[0xFF, 0xD9]);
    data
}

/// Generates an extended WebP image header, padded to `len` bytes.
pub fn webp_image(width: u32, height: u32, len: usize) -> Vec<u8> {
    let dim = |value: u32| {
        let bytes = value.saturating_sub(1).to_le_bytes();
        [bytes[0], bytes[1], bytes[2]]
    };

    let mut data = b"RIFF\0\0\0\0WEBPVP8X".to_vec();
    data.extend_from_slice(&10u32.to_le_bytes());
    data.extend_from_slice(&[0; 4]);
    data.extend_from_slice(&dim(width));
    data.extend_from_slice(&dim(height));
    pad(&mut data, len);
    let riff_len = u32::try_from(data.len() - 8).unwrap_or(u32::MAX);
    data[4..8].copy_from_slice(&riff_len.to_le_bytes());
    data
}
