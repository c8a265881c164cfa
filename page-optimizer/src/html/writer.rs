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

//! Output side of the HTML pipeline

use crate::error::Error;
use crate::headers::ResponseHeaders;

use std::io::Write;

/// Destination of a rewritten HTML response
///
/// Headers are written exactly once, before the first body chunk. A failing write ends the
/// document: the driver stops dispatching events and passes no further output.
pub trait HtmlWriter: Send {
    /// Sends the response headers.
    fn write_headers(&mut self, headers: &ResponseHeaders) -> Result<(), Error>;

    /// Sends a piece of the response body.
    fn write(&mut self, text: &str) -> Result<(), Error>;

    /// Pushes buffered output to the client.
    fn flush(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

/// Writer producing output on an [`std::io::Write`] implementation
#[derive(Debug)]
pub struct IoWriter<W: Write + Send> {
    inner: W,
    with_headers: bool,
}

impl<W: Write + Send> IoWriter<W> {
    /// Writes the response body only.
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            with_headers: false,
        }
    }

    /// Writes an HTTP/1.1 style header block in front of the body.
    pub fn with_headers(inner: W) -> Self {
        Self {
            inner,
            with_headers: true,
        }
    }

    /// Returns the wrapped writer.
    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write + Send> HtmlWriter for IoWriter<W> {
    fn write_headers(&mut self, headers: &ResponseHeaders) -> Result<(), Error> {
        if !self.with_headers {
            return Ok(());
        }
        let status = headers.status();
        write!(
            self.inner,
            "HTTP/1.1 {} {}\r\n",
            status.as_u16(),
            status.canonical_reason().unwrap_or("")
        )?;
        for (name, value) in headers.headers() {
            self.inner.write_all(name.as_str().as_bytes())?;
            self.inner.write_all(b": ")?;
            self.inner.write_all(value.as_bytes())?;
            self.inner.write_all(b"\r\n")?;
        }
        self.inner.write_all(b"\r\n")?;
        Ok(())
    }

    fn write(&mut self, text: &str) -> Result<(), Error> {
        self.inner.write_all(text.as_bytes())?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), Error> {
        self.inner.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use http::{header, StatusCode};

    #[test]
    fn header_block() {
        let mut headers = ResponseHeaders::new(StatusCode::OK);
        headers.set(header::CONTENT_TYPE, "text/html");
        let mut writer = IoWriter::with_headers(Vec::new());
        writer.write_headers(&headers).unwrap();
        writer.write("<p>").unwrap();
        assert_eq!(
            String::from_utf8(writer.into_inner()).unwrap(),
            "HTTP/1.1 200 OK\r\ncontent-type: text/html\r\n\r\n<p>"
        );

        let mut writer = IoWriter::new(Vec::new());
        writer.write_headers(&headers).unwrap();
        writer.write("<p>").unwrap();
        assert_eq!(writer.into_inner(), b"<p>");
    }
}
