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

//! Streaming HTML processing
//!
//! The [`lexer`] turns arbitrarily split input chunks into tokens, the [`dom`] keeps the part of
//! the document that wasn’t flushed yet and allows filters to modify it, the [`writer`] receives
//! the serialized output.

pub mod dom;
pub mod lexer;
pub mod writer;

pub use dom::{CloseStyle, Document, NodeId, NodeKind};
pub use lexer::{Attribute, Lexer, QuoteStyle, Token};
pub use writer::{HtmlWriter, IoWriter};

use std::borrow::Cow;

/// Elements without content and without end tag
pub const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "keygen", "link", "meta", "param",
    "source", "track", "wbr",
];

/// Elements whose content isn’t parsed as HTML
pub const RAW_TEXT_ELEMENTS: &[&str] = &[
    "script", "style", "textarea", "title", "xmp", "iframe", "noscript",
];

/// Checks whether an element (lowercase name) is a void element.
pub fn is_void_element(name: &str) -> bool {
    VOID_ELEMENTS.contains(&name)
}

/// Checks whether an element (lowercase name) contains raw text.
pub fn is_raw_text_element(name: &str) -> bool {
    RAW_TEXT_ELEMENTS.contains(&name)
}

fn decode_entity(entity: &str) -> Option<char> {
    if let Some(number) = entity.strip_prefix('#') {
        let code = if let Some(hex) = number.strip_prefix(['x', 'X']) {
            u32::from_str_radix(hex, 16).ok()?
        } else {
            number.parse().ok()?
        };
        return char::from_u32(code);
    }
    match entity {
        "amp" => Some('&'),
        "lt" => Some('<'),
        "gt" => Some('>'),
        "quot" => Some('"'),
        "apos" => Some('\''),
        "nbsp" => Some('\u{a0}'),
        _ => None,
    }
}

/// Decodes character references in an attribute value. Unknown references are kept as is.
pub fn unescape(value: &str) -> Cow<'_, str> {
    if !value.contains('&') {
        return Cow::Borrowed(value);
    }

    let mut result = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(pos) = rest.find('&') {
        result.push_str(&rest[..pos]);
        rest = &rest[pos..];
        let decoded = rest.find(';').filter(|&end| end <= 10).and_then(|end| {
            decode_entity(&rest[1..end]).map(|c| (c, end + 1))
        });
        match decoded {
            Some((c, len)) => {
                result.push(c);
                rest = &rest[len..];
            }
            None => {
                result.push('&');
                rest = &rest[1..];
            }
        }
    }
    result.push_str(rest);
    Cow::Owned(result)
}

/// Escapes a value for use in a double-quoted attribute.
pub fn escape_attribute(value: &str) -> String {
    value.replace('&', "&amp;").replace('"', "&quot;")
}

/// Escapes text for use as element content.
pub fn escape_text(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Checks whether text can be placed inside a raw-text element without terminating it early.
pub fn is_safe_raw_text(element: &str, text: &str) -> bool {
    let closing = format!("</{element}");
    !text.to_ascii_lowercase().contains(&closing)
}
