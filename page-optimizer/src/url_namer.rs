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

//! Encoding and decoding of rewritten resource URLs
//!
//! A rewritten resource is named `<leaf>.pagespeed.<id>.<hash>.<ext>` and placed in the
//! directory of its (first) input. The leaf encodes everything needed to reconstruct the inputs
//! without any cache access:
//!
//! * single inputs use their escaped file name, e.g. `a.css`
//! * combined resources join the escaped input names with `+`, e.g. `a.css+b.css`
//! * rewritten CSS is prefixed with `A.`
//! * rewritten images are prefixed with the requested dimensions, e.g. `48x64x`. Without
//!   resizing there is no prefix unless the name itself looks like one, e.g. `x1` becomes
//!   `xx1`.

use crate::content_type::ContentType;
use crate::hasher::is_valid_hash;

use url::Url;

/// Separator between the leaf and the rewriting details
pub const PAGESPEED_MARKER: &str = ".pagespeed.";

/// Escapes a string so that it can be used in a leaf name. Characters with special meaning in
/// URLs or in the leaf encoding are replaced by comma sequences.
pub fn escape_leaf(name: &str) -> String {
    let mut result = String::with_capacity(name.len());
    for c in name.chars() {
        match c {
            ',' => result.push_str(",,"),
            '?' => result.push_str(",q"),
            '&' => result.push_str(",a"),
            '=' => result.push_str(",e"),
            '+' => result.push_str(",P"),
            '/' => result.push_str(",_"),
            c if c.is_ascii_alphanumeric() || "._-~!*'()".contains(c) => result.push(c),
            c => {
                let mut buffer = [0; 4];
                for byte in c.encode_utf8(&mut buffer).bytes() {
                    result.push_str(&format!(",{byte:02X}"));
                }
            }
        }
    }
    result
}

/// Reverses [`escape_leaf`]. Returns `None` for invalid escape sequences.
pub fn unescape_leaf(escaped: &str) -> Option<String> {
    let mut bytes = Vec::with_capacity(escaped.len());
    let mut iter = escaped.bytes();
    while let Some(byte) = iter.next() {
        if byte != b',' {
            bytes.push(byte);
            continue;
        }
        match iter.next()? {
            b',' => bytes.push(b','),
            b'q' => bytes.push(b'?'),
            b'a' => bytes.push(b'&'),
            b'e' => bytes.push(b'='),
            b'P' => bytes.push(b'+'),
            b'_' => bytes.push(b'/'),
            high => {
                let low = iter.next()?;
                let hex = [high, low];
                let hex = std::str::from_utf8(&hex).ok()?;
                if !hex.bytes().all(|c| c.is_ascii_digit() || (b'A'..=b'F').contains(&c)) {
                    return None;
                }
                bytes.push(u8::from_str_radix(hex, 16).ok()?);
            }
        }
    }
    String::from_utf8(bytes).ok()
}

/// The name of a rewritten resource, i.e. the last path segment of its URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceNamer {
    /// Encoded name, including any prefix
    pub name: String,
    /// Filter id, e.g. `cf`
    pub id: String,
    /// Content hash of the output
    pub hash: String,
    /// Extension of the output
    pub ext: String,
}

impl ResourceNamer {
    /// Produces the leaf name.
    pub fn encode(&self) -> String {
        format!(
            "{}{PAGESPEED_MARKER}{}.{}.{}",
            self.name, self.id, self.hash, self.ext
        )
    }

    /// Parses a leaf name. Returns `None` if the leaf isn’t a rewritten resource name.
    pub fn decode(leaf: &str) -> Option<Self> {
        let pos = leaf.rfind(PAGESPEED_MARKER)?;
        let name = &leaf[..pos];
        let mut rest = leaf[pos + PAGESPEED_MARKER.len()..].splitn(3, '.');
        let id = rest.next()?;
        let hash = rest.next()?;
        let ext = rest.next()?;

        if name.is_empty()
            || id.len() != 2
            || !id.bytes().all(|c| c.is_ascii_lowercase())
            || !is_valid_hash(hash)
            || ContentType::from_extension(ext).is_none()
        {
            return None;
        }

        Some(Self {
            name: name.to_owned(),
            id: id.to_owned(),
            hash: hash.to_owned(),
            ext: ext.to_owned(),
        })
    }
}

/// Dimensions requested when rewriting an image
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ImageDims {
    /// Target width
    pub width: Option<u32>,
    /// Target height
    pub height: Option<u32>,
}

impl ImageDims {
    fn encode_dim(dim: Option<u32>) -> String {
        dim.map_or_else(|| "N".to_owned(), |dim| dim.to_string())
    }

    fn decode_dim(dim: &str) -> Option<Option<u32>> {
        if dim == "N" {
            Some(None)
        } else if !dim.is_empty() && dim.bytes().all(|c| c.is_ascii_digit()) {
            dim.parse().ok().map(Some)
        } else {
            None
        }
    }

    /// Checks whether any dimension is set.
    pub fn is_set(&self) -> bool {
        self.width.is_some() || self.height.is_some()
    }

    /// Encodes the dimensions as leaf prefix: `48x64x`, `48xNx` or just `x` without any
    /// dimensions.
    pub fn encode_prefix(&self) -> String {
        if self.is_set() {
            format!(
                "{}x{}x",
                Self::encode_dim(self.width),
                Self::encode_dim(self.height)
            )
        } else {
            "x".to_owned()
        }
    }

    /// Splits a leaf name into the dimensions and the remainder. Names without any prefix are
    /// accepted as well, `NxN` is not.
    pub fn decode_prefix(name: &str) -> Option<(Self, &str)> {
        let mut parts = name.splitn(3, 'x');
        if let (Some(width), Some(height), Some(rest)) = (parts.next(), parts.next(), parts.next())
        {
            if let (Some(width), Some(height)) =
                (Self::decode_dim(width), Self::decode_dim(height))
            {
                if width.is_none() && height.is_none() {
                    return None;
                }
                return Some((Self { width, height }, rest));
            }
        }

        Some((Self::default(), name.strip_prefix('x').unwrap_or(name)))
    }
}

/// Resolves `url` against `base` and returns the directory part of the result (everything up
/// to and including the last slash of the path, without query).
pub fn directory_of(url: &Url) -> Url {
    let mut dir = url.clone();
    dir.set_query(None);
    dir.set_fragment(None);
    if let Ok(mut segments) = dir.path_segments_mut() {
        segments.pop();
        segments.push("");
    }
    dir
}

/// The last path segment of a URL including the query string, if any
pub fn leaf_of(url: &Url) -> String {
    let leaf = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .unwrap_or("");
    match url.query() {
        Some(query) => format!("{leaf}?{query}"),
        None => leaf.to_owned(),
    }
}

/// Produces the URL of a rewritten resource placed into the given directory.
pub fn output_url(directory: &Url, namer: &ResourceNamer) -> Option<Url> {
    directory.join(&namer.encode()).ok()
}

/// A decoded rewritten resource URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedUrl {
    /// Directory containing the resource and its inputs
    pub directory: Url,
    /// Name details
    pub namer: ResourceNamer,
}

impl DecodedUrl {
    /// Decodes a rewritten resource URL, enforcing the URL size limits. Returns `None` if this
    /// isn’t a rewritten resource URL.
    pub fn decode(url: &Url, max_url_size: usize, max_segment_size: usize) -> Option<Self> {
        if url.as_str().len() > max_url_size {
            return None;
        }
        let leaf = url.path_segments()?.next_back()?;
        if leaf.len() > max_segment_size {
            return None;
        }
        let namer = ResourceNamer::decode(leaf)?;
        Some(Self {
            directory: directory_of(url),
            namer,
        })
    }

    /// Re-encodes the URL.
    pub fn encode(&self) -> Option<Url> {
        output_url(&self.directory, &self.namer)
    }

    /// Splits the name into the input leaf names, removing the `A.` prefix of rewritten CSS
    /// and the dimensions of rewritten images. A missing extension is taken from the output
    /// extension.
    pub fn input_leaves(&self) -> Option<(ImageDims, Vec<String>)> {
        let mut name = self.namer.name.as_str();
        let mut dims = ImageDims::default();
        match self.namer.id.as_str() {
            "cf" => name = name.strip_prefix("A.").unwrap_or(name),
            "ic" => {
                let (decoded, rest) = ImageDims::decode_prefix(name)?;
                dims = decoded;
                name = rest;
            }
            _ => {}
        }

        let mut leaves = Vec::new();
        for part in name.split('+') {
            let mut leaf = unescape_leaf(part)?;
            if leaf.is_empty() {
                return None;
            }
            let path = leaf.split('?').next().unwrap_or("");
            if !path.contains('.') {
                leaf = format!("{path}.{}", self.namer.ext);
            }
            leaves.push(leaf);
        }
        Some((dims, leaves))
    }

    /// Reconstructs the absolute input URLs.
    pub fn input_urls(&self) -> Option<(ImageDims, Vec<Url>)> {
        let (dims, leaves) = self.input_leaves()?;
        let urls = leaves
            .iter()
            .map(|leaf| self.directory.join(leaf).ok())
            .collect::<Option<Vec<_>>>()?;

        // Inputs have to stay in the same directory, otherwise the leaf encoding was tampered
        // with.
        if urls.iter().any(|url| directory_of(url) != self.directory) {
            return None;
        }
        Some((dims, urls))
    }
}

/// Produces the shortest reasonable reference to `target` from a document at `base`: a
/// relative path if the target is in the base directory or below, an absolute path on the same
/// origin, the full URL otherwise.
pub fn trim_url(target: &Url, base: &Url) -> String {
    if target.origin() != base.origin() {
        return target.to_string();
    }

    let base_dir = directory_of(base);
    let target_str = target.as_str();
    if let Some(relative) = target_str.strip_prefix(base_dir.as_str()) {
        if !relative.is_empty() && !relative.starts_with('/') && !relative.contains(':') {
            return relative.to_owned();
        }
    }

    let mut result = target.path().to_owned();
    if let Some(query) = target.query() {
        result.push('?');
        result.push_str(query);
    }
    result
}

/// Checks whether an attribute value contains a relative URL (no scheme and no host).
pub fn is_relative(value: &str) -> bool {
    let value = value.trim();
    !value.starts_with("//") && Url::parse(value).is_err()
}
