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

//! Minimal CSS scanner
//!
//! This isn’t a CSS parser. It locates URL references (`url()` and `@import`), checks that
//! blocks are balanced and removes comments and insignificant whitespace. Anything it doesn’t
//! understand is passed through unchanged.

use crate::error::RewriteError;

use std::ops::Range;

/// Kinds of URL references in a stylesheet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceKind {
    /// `url(...)` in a declaration
    Url,
    /// `@import` rule
    Import,
}

/// A URL referenced by a stylesheet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CssReference {
    /// Byte range of the reference in the stylesheet, quotes included
    pub range: Range<usize>,
    /// The URL with quotes and escapes removed
    pub url: String,
    /// Where the reference was found
    pub kind: ReferenceKind,
    /// Media list of an `@import` rule, empty if none
    pub media: String,
}

/// Result of scanning a stylesheet
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stylesheet {
    /// URL references in document order
    pub references: Vec<CssReference>,
    /// Selectors of top-level rules
    pub selectors: Vec<String>,
}

struct Scanner<'a> {
    text: &'a str,
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Scanner<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            text,
            bytes: text.as_bytes(),
            pos: 0,
        }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn starts_with_ignore_case(&self, prefix: &str) -> bool {
        self.bytes
            .get(self.pos..self.pos + prefix.len())
            .is_some_and(|slice| slice.eq_ignore_ascii_case(prefix.as_bytes()))
    }

    fn skip_whitespace_and_comments(&mut self) {
        loop {
            match self.peek() {
                Some(c) if c.is_ascii_whitespace() => self.pos += 1,
                Some(b'/') if self.bytes.get(self.pos + 1) == Some(&b'*') => {
                    self.skip_comment();
                }
                _ => break,
            }
        }
    }

    /// Skips a comment starting at the current position. Unterminated comments extend to the
    /// end of the stylesheet.
    fn skip_comment(&mut self) {
        match self.text[self.pos + 2..].find("*/") {
            Some(end) => self.pos += 2 + end + 2,
            None => self.pos = self.bytes.len(),
        }
    }

    /// Skips a string starting at the current position, returns its unescaped contents.
    fn read_string(&mut self) -> Result<String, RewriteError> {
        let quote = self.bytes[self.pos];
        self.pos += 1;
        let start = self.pos;
        while let Some(c) = self.peek() {
            match c {
                b'\\' => {
                    let prefix = self.text[start..self.pos].to_owned();
                    self.pos += 1;
                    return self.read_string_slow(quote, prefix);
                }
                b'\n' => return Err(RewriteError::ParseFailed),
                c if c == quote => {
                    let value = self.text[start..self.pos].to_owned();
                    self.pos += 1;
                    return Ok(value);
                }
                _ => self.pos += 1,
            }
        }
        Err(RewriteError::ParseFailed)
    }

    fn read_string_slow(&mut self, quote: u8, mut result: String) -> Result<String, RewriteError> {
        // Position is right after a backslash
        let text = self.text;
        let mut escaped = true;
        for (offset, c) in text[self.pos..].char_indices() {
            if escaped {
                escaped = false;
                if c != '\n' {
                    result.push(c);
                }
            } else if c == '\\' {
                escaped = true;
            } else if c == char::from(quote) {
                self.pos += offset + 1;
                return Ok(result);
            } else if c == '\n' {
                return Err(RewriteError::ParseFailed);
            } else {
                result.push(c);
            }
        }
        Err(RewriteError::ParseFailed)
    }

    /// Reads a `url(...)` token, the current position being right after the opening
    /// parenthesis.
    fn read_url(&mut self) -> Result<(Range<usize>, String), RewriteError> {
        self.skip_whitespace_and_comments();
        let start = self.pos;
        let url = match self.peek() {
            Some(b'"' | b'\'') => self.read_string()?,
            _ => {
                while let Some(c) = self.peek() {
                    if c == b')' || c.is_ascii_whitespace() {
                        break;
                    }
                    self.pos += 1;
                }
                self.text[start..self.pos].to_owned()
            }
        };
        let end = self.pos;
        self.skip_whitespace_and_comments();
        if self.peek() != Some(b')') {
            return Err(RewriteError::ParseFailed);
        }
        self.pos += 1;
        Ok((start..end, url))
    }
}

/// Scans a stylesheet. Fails on unbalanced blocks or unterminated strings and URLs.
pub fn parse(text: &str) -> Result<Stylesheet, RewriteError> {
    let mut scanner = Scanner::new(text);
    let mut result = Stylesheet::default();
    let mut depth = 0usize;
    let mut rule_start = 0;

    while let Some(c) = scanner.peek() {
        match c {
            b'/' if scanner.bytes.get(scanner.pos + 1) == Some(&b'*') => scanner.skip_comment(),
            b'"' | b'\'' => {
                scanner.read_string()?;
            }
            b'{' => {
                if depth == 0 {
                    let prelude = text[rule_start..scanner.pos].trim();
                    if !prelude.starts_with('@') {
                        result.selectors.extend(
                            strip_comments(prelude)
                                .split(',')
                                .map(str::trim)
                                .filter(|selector| !selector.is_empty())
                                .map(ToOwned::to_owned),
                        );
                    }
                }
                depth += 1;
                scanner.pos += 1;
            }
            b'}' => {
                depth = depth.checked_sub(1).ok_or(RewriteError::ParseFailed)?;
                scanner.pos += 1;
                rule_start = scanner.pos;
            }
            b';' => {
                scanner.pos += 1;
                if depth == 0 {
                    rule_start = scanner.pos;
                }
            }
            b'@' if depth == 0 && scanner.starts_with_ignore_case("@import") => {
                scanner.pos += "@import".len();
                scanner.skip_whitespace_and_comments();
                let (range, url) = match scanner.peek() {
                    Some(b'"' | b'\'') => {
                        let start = scanner.pos;
                        let url = scanner.read_string()?;
                        (start..scanner.pos, url)
                    }
                    _ if scanner.starts_with_ignore_case("url(") => {
                        scanner.pos += "url(".len();
                        scanner.read_url()?
                    }
                    _ => return Err(RewriteError::ParseFailed),
                };
                let media_start = scanner.pos;
                let media_end = text[media_start..]
                    .find(';')
                    .map_or(text.len(), |end| media_start + end);
                let media = text[media_start..media_end].trim().to_owned();
                scanner.pos = (media_end + 1).min(text.len());
                rule_start = scanner.pos;
                result.references.push(CssReference {
                    range,
                    url,
                    kind: ReferenceKind::Import,
                    media,
                });
            }
            b'u' | b'U' if scanner.starts_with_ignore_case("url(") => {
                let is_identifier_start = scanner.pos == 0
                    || !matches!(
                        scanner.bytes[scanner.pos - 1],
                        b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'_'
                    );
                scanner.pos += "url(".len();
                if is_identifier_start {
                    let (range, url) = scanner.read_url()?;
                    result.references.push(CssReference {
                        range,
                        url,
                        kind: ReferenceKind::Url,
                        media: String::new(),
                    });
                }
            }
            _ => scanner.pos += 1,
        }
    }

    if depth != 0 {
        return Err(RewriteError::ParseFailed);
    }
    Ok(result)
}

fn strip_comments(text: &str) -> String {
    let mut result = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("/*") {
        result.push_str(&rest[..start]);
        rest = match rest[start + 2..].find("*/") {
            Some(end) => &rest[start + 2 + end + 2..],
            None => "",
        };
    }
    result.push_str(rest);
    result
}

/// Checks whether an `@import` media list applies to screen rendering.
pub fn media_applies_to_screen(media: &str) -> bool {
    media.is_empty()
        || media.split(',').map(str::trim).any(|medium| {
            medium.eq_ignore_ascii_case("all") || medium.eq_ignore_ascii_case("screen")
        })
}

/// Replaces byte ranges of a stylesheet. Ranges must not overlap.
pub fn apply_edits(text: &str, mut edits: Vec<(Range<usize>, String)>) -> String {
    edits.sort_by_key(|(range, _)| range.start);
    let mut result = String::with_capacity(text.len());
    let mut pos = 0;
    for (range, replacement) in edits {
        if range.start < pos || range.end > text.len() {
            continue;
        }
        result.push_str(&text[pos..range.start]);
        result.push_str(&replacement);
        pos = range.end;
    }
    result.push_str(&text[pos..]);
    result
}

/// Formats a URL for use inside `url()`, quoting it if necessary.
pub fn quote_url(url: &str) -> String {
    if url
        .chars()
        .any(|c| c.is_whitespace() || matches!(c, '(' | ')' | '"' | '\'' | '\\'))
    {
        format!("\"{}\"", url.replace('\\', "\\\\").replace('"', "\\\""))
    } else {
        url.to_owned()
    }
}

/// Removes comments and whitespace that doesn’t affect rendering.
pub fn minify(text: &str) -> String {
    let mut result = String::with_capacity(text.len());
    let mut scanner = Scanner::new(text);
    let mut pending_space = false;

    fn needs_no_space_after(c: Option<char>) -> bool {
        matches!(c, None | Some('{' | '}' | ';' | ':' | ',' | '>'))
    }

    while let Some(c) = scanner.peek() {
        match c {
            b'/' if scanner.bytes.get(scanner.pos + 1) == Some(&b'*') => {
                scanner.skip_comment();
                pending_space = true;
            }
            c if c.is_ascii_whitespace() => {
                scanner.pos += 1;
                pending_space = true;
            }
            b'"' | b'\'' => {
                if pending_space && !needs_no_space_after(result.chars().last()) {
                    result.push(' ');
                }
                pending_space = false;
                let start = scanner.pos;
                if scanner.read_string().is_err() {
                    // Keep the remainder untouched
                    result.push_str(&text[start..]);
                    return result;
                }
                result.push_str(&text[start..scanner.pos]);
            }
            b'u' | b'U' if scanner.starts_with_ignore_case("url(") => {
                if pending_space && !needs_no_space_after(result.chars().last()) {
                    result.push(' ');
                }
                pending_space = false;
                let start = scanner.pos;
                scanner.pos += "url(".len();
                match scanner.read_url() {
                    Ok(_) => result.push_str(&text[start..scanner.pos]),
                    Err(_) => {
                        result.push_str(&text[start..]);
                        return result;
                    }
                }
            }
            _ => {
                let Some(ch) = text[scanner.pos..].chars().next() else {
                    break;
                };
                if ch == '}' && result.ends_with(';') {
                    result.pop();
                }
                if pending_space
                    && !needs_no_space_after(result.chars().last())
                    && !matches!(ch, '{' | '}' | ';' | ',' | '>')
                {
                    result.push(' ');
                }
                pending_space = false;
                result.push(ch);
                scanner.pos += ch.len_utf8();
            }
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn references() {
        let text = r#"@import "base.css" print;
@import url(layout.css);
body { background: url( bg.png ) no-repeat; }
.a { background-image: URL('img/a b.gif') }
.b::after { content: "url(not-a-url.png)"; }"#;
        let sheet = parse(text).unwrap();
        let urls = sheet
            .references
            .iter()
            .map(|r| (r.url.as_str(), r.kind, r.media.as_str()))
            .collect::<Vec<_>>();
        assert_eq!(
            urls,
            vec![
                ("base.css", ReferenceKind::Import, "print"),
                ("layout.css", ReferenceKind::Import, ""),
                ("bg.png", ReferenceKind::Url, ""),
                ("img/a b.gif", ReferenceKind::Url, ""),
            ]
        );
        assert_eq!(&text[sheet.references[2].range.clone()], "bg.png");
        assert_eq!(&text[sheet.references[3].range.clone()], "'img/a b.gif'");
        assert_eq!(sheet.selectors, vec!["body", ".a", ".b::after"]);
    }

    #[test]
    fn unbalanced() {
        assert_eq!(parse("a { color: red"), Err(RewriteError::ParseFailed));
        assert_eq!(parse("a { color: red }}"), Err(RewriteError::ParseFailed));
        assert_eq!(parse("a { background: url(x.png }"), Err(RewriteError::ParseFailed));
        assert!(parse("a { content: '}' }").is_ok());
    }

    #[test]
    fn editing() {
        let text = "a{background:url(bg.png)}b{background:url('c.png')}";
        let sheet = parse(text).unwrap();
        let edits = sheet
            .references
            .iter()
            .map(|r| (r.range.clone(), quote_url(&format!("x{}", r.url))))
            .collect();
        assert_eq!(
            apply_edits(text, edits),
            "a{background:url(xbg.png)}b{background:url(xc.png)}"
        );
        assert_eq!(quote_url("a b.png"), "\"a b.png\"");
    }

    #[test]
    fn minification() {
        assert_eq!(
            minify(
                "/* header */\nbody  {\n  color: red ;\n  margin: 0 auto;\n}\n\n\
                a > b, c { x: url( 'a b.png' ) }\n"
            ),
            "body{color:red;margin:0 auto}a>b,c{x:url( 'a b.png' )}"
        );
        assert_eq!(minify("a:hover  .b{}"), "a:hover .b{}");
        assert_eq!(minify("a{content:\"  x  \"}"), "a{content:\"  x  \"}");
    }

    #[test]
    fn media() {
        assert!(media_applies_to_screen(""));
        assert!(media_applies_to_screen("screen"));
        assert!(media_applies_to_screen("print, ALL"));
        assert!(!media_applies_to_screen("print"));
    }
}
