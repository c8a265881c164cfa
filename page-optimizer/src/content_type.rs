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

//! Content types of the resources the optimizer deals with

use serde::{Deserialize, Serialize};

/// The closed set of content types known to the optimizer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    /// HTML documents
    Html,
    /// CSS stylesheets
    Css,
    /// JavaScript
    Javascript,
    /// PNG images
    Png,
    /// GIF images
    Gif,
    /// JPEG images
    Jpeg,
    /// WebP images
    Webp,
    /// Icons
    Ico,
    /// SVG images
    Svg,
    /// WOFF2 fonts
    Woff2,
    /// WOFF fonts
    Woff,
    /// TrueType fonts
    Ttf,
    /// Anything else
    Other,
}

impl ContentType {
    /// The MIME type to be used in `Content-Type` headers
    pub fn mime_type(self) -> &'static str {
        match self {
            Self::Html => "text/html",
            Self::Css => "text/css",
            Self::Javascript => "text/javascript",
            Self::Png => "image/png",
            Self::Gif => "image/gif",
            Self::Jpeg => "image/jpeg",
            Self::Webp => "image/webp",
            Self::Ico => "image/x-icon",
            Self::Svg => "image/svg+xml",
            Self::Woff2 => "font/woff2",
            Self::Woff => "font/woff",
            Self::Ttf => "font/ttf",
            Self::Other => "application/octet-stream",
        }
    }

    /// File extension used in rewritten URLs
    pub fn extension(self) -> &'static str {
        match self {
            Self::Html => "html",
            Self::Css => "css",
            Self::Javascript => "js",
            Self::Png => "png",
            Self::Gif => "gif",
            Self::Jpeg => "jpg",
            Self::Webp => "webp",
            Self::Ico => "ico",
            Self::Svg => "svg",
            Self::Woff2 => "woff2",
            Self::Woff => "woff",
            Self::Ttf => "ttf",
            Self::Other => "bin",
        }
    }

    /// Maps a file extension to a content type. Only extensions that can appear in rewritten
    /// URLs are recognized.
    pub fn from_extension(ext: &str) -> Option<Self> {
        Some(match ext.to_ascii_lowercase().as_str() {
            "html" | "htm" => Self::Html,
            "css" => Self::Css,
            "js" | "mjs" => Self::Javascript,
            "png" => Self::Png,
            "gif" => Self::Gif,
            "jpg" | "jpeg" => Self::Jpeg,
            "webp" => Self::Webp,
            "ico" => Self::Ico,
            "svg" => Self::Svg,
            "woff2" => Self::Woff2,
            "woff" => Self::Woff,
            "ttf" => Self::Ttf,
            _ => return None,
        })
    }

    /// Maps the value of a `Content-Type` header to a content type, ignoring parameters.
    pub fn from_mime_type(value: &str) -> Self {
        let mime = value
            .split(';')
            .next()
            .unwrap_or("")
            .trim()
            .to_ascii_lowercase();
        match mime.as_str() {
            "text/html" | "application/xhtml+xml" => Self::Html,
            "text/css" => Self::Css,
            "text/javascript"
            | "application/javascript"
            | "application/x-javascript"
            | "application/ecmascript"
            | "text/ecmascript" => Self::Javascript,
            "image/png" => Self::Png,
            "image/gif" => Self::Gif,
            "image/jpeg" | "image/jpg" | "image/pjpeg" => Self::Jpeg,
            "image/webp" => Self::Webp,
            "image/x-icon" | "image/vnd.microsoft.icon" => Self::Ico,
            "image/svg+xml" => Self::Svg,
            "font/woff2" | "application/font-woff2" => Self::Woff2,
            "font/woff" | "application/font-woff" => Self::Woff,
            "font/ttf" | "application/x-font-ttf" => Self::Ttf,
            _ => Self::Other,
        }
    }

    /// Guesses the content type from a URL path, using the same guessing logic as the static
    /// files handling.
    pub fn from_path(path: &str) -> Self {
        mime_guess::from_path(path)
            .first_raw()
            .map_or(Self::Other, Self::from_mime_type)
    }

    /// Checks whether this is a raster image type the image rewriter can process.
    pub fn is_image(self) -> bool {
        matches!(self, Self::Png | Self::Gif | Self::Jpeg | Self::Webp)
    }

    /// Value of the `as` attribute when preloading a resource of this type
    pub fn preload_as(self) -> Option<&'static str> {
        match self {
            Self::Css => Some("style"),
            Self::Javascript => Some("script"),
            Self::Png | Self::Gif | Self::Jpeg | Self::Webp | Self::Ico | Self::Svg => {
                Some("image")
            }
            Self::Woff2 | Self::Woff | Self::Ttf => Some("font"),
            Self::Html | Self::Other => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extensions() {
        assert_eq!(ContentType::from_extension("JPEG"), Some(ContentType::Jpeg));
        assert_eq!(ContentType::Jpeg.extension(), "jpg");
        assert_eq!(ContentType::from_extension("exe"), None);
        for ext in ["css", "js", "png", "gif", "jpg", "webp"] {
            assert_eq!(ContentType::from_extension(ext).unwrap().extension(), ext);
        }
    }

    #[test]
    fn mime_types() {
        assert_eq!(
            ContentType::from_mime_type("text/css; charset=utf-8"),
            ContentType::Css
        );
        assert_eq!(
            ContentType::from_mime_type("application/x-javascript"),
            ContentType::Javascript
        );
        assert_eq!(
            ContentType::from_mime_type("text/plain"),
            ContentType::Other
        );
        assert_eq!(ContentType::from_path("/a/b.png"), ContentType::Png);
        assert_eq!(ContentType::from_path("/a/b"), ContentType::Other);
    }

    #[test]
    fn preload_kinds() {
        assert_eq!(ContentType::Css.preload_as(), Some("style"));
        assert_eq!(ContentType::Javascript.preload_as(), Some("script"));
        assert_eq!(ContentType::Woff2.preload_as(), Some("font"));
        assert_eq!(ContentType::Html.preload_as(), None);
    }
}
