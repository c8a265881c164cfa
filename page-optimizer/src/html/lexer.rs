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

//! Incremental HTML tokenizer
//!
//! Input can be split at any position. Constructs that aren’t complete yet are kept until more
//! input arrives or the input ends. The lexer is lenient: anything that doesn’t parse as markup
//! becomes character data, so that serializing the tokens reproduces the input.

use super::is_raw_text_element;

/// Quoting of an attribute value in the source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuoteStyle {
    /// Unquoted value or no value at all
    None,
    /// Value in single quotes
    Single,
    /// Value in double quotes
    Double,
}

impl QuoteStyle {
    fn as_str(self) -> &'static str {
        match self {
            Self::None => "",
            Self::Single => "'",
            Self::Double => "\"",
        }
    }
}

/// A tag attribute
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    /// Attribute name as written in the source
    pub name: String,
    /// Value as written in the source, character references not decoded
    pub value: Option<String>,
    /// Quoting of the value
    pub quote: QuoteStyle,
}

impl Attribute {
    /// Checks the attribute name, ignoring case.
    pub fn is(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }

    /// Appends the attribute to serialized HTML, including the leading space.
    pub fn serialize(&self, out: &mut String) {
        out.push(' ');
        out.push_str(&self.name);
        if let Some(value) = &self.value {
            out.push('=');
            out.push_str(self.quote.as_str());
            out.push_str(value);
            out.push_str(self.quote.as_str());
        }
    }
}

/// Lexer output
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    /// Opening tag
    StartTag {
        /// Element name as written in the source
        name: String,
        /// Attributes in source order
        attributes: Vec<Attribute>,
        /// Tag closed with `/>`
        self_closing: bool,
    },
    /// Closing tag
    EndTag {
        /// Element name as written in the source
        name: String,
    },
    /// Character data, not decoded
    Characters(String),
    /// Contents of `<!-- ... -->`
    Comment(String),
    /// Contents of `<![CDATA[ ... ]]>`
    Cdata(String),
    /// Everything between `<` and `>` of `<!DOCTYPE ...>` or `<?...>`
    Directive(String),
}

enum Scan {
    Token(Token, usize),
    Incomplete,
}

/// Incremental HTML tokenizer
#[derive(Debug, Default)]
pub struct Lexer {
    buffer: String,
    raw_text: Option<String>,
}

fn is_space(c: u8) -> bool {
    matches!(c, b' ' | b'\t' | b'\n' | b'\r' | 0x0C)
}

impl Lexer {
    /// Creates a lexer at the start of a document.
    pub fn new() -> Self {
        Self::default()
    }

    /// Forgets all state.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.raw_text = None;
    }

    /// Adds input and returns the tokens that are complete now, each with the number of input
    /// bytes it was produced from.
    pub fn feed(&mut self, text: &str) -> Vec<(Token, usize)> {
        self.buffer.push_str(text);
        let mut tokens = Vec::new();
        let mut pos = 0;
        loop {
            match self.scan(pos) {
                Scan::Token(token, len) => {
                    pos += len;
                    tokens.push((token, len));
                }
                Scan::Incomplete => break,
            }
        }
        self.buffer.drain(..pos);
        tokens
    }

    /// Signals the end of input, returns whatever is left as character data.
    pub fn finish(&mut self) -> Vec<(Token, usize)> {
        self.raw_text = None;
        let rest = std::mem::take(&mut self.buffer);
        if rest.is_empty() {
            Vec::new()
        } else {
            let len = rest.len();
            vec![(Token::Characters(rest), len)]
        }
    }

    fn scan(&mut self, pos: usize) -> Scan {
        let input = &self.buffer[pos..];
        if input.is_empty() {
            return Scan::Incomplete;
        }

        if let Some(element) = &self.raw_text {
            return match find_raw_text_end(input, element) {
                Some(0) => {
                    self.raw_text = None;
                    self.scan(pos)
                }
                Some(end) => {
                    self.raw_text = None;
                    Scan::Token(Token::Characters(input[..end].to_owned()), end)
                }
                None => Scan::Incomplete,
            };
        }

        let bytes = input.as_bytes();
        if bytes[0] != b'<' {
            let end = input.find('<').unwrap_or(input.len());
            return Scan::Token(Token::Characters(input[..end].to_owned()), end);
        }

        let result = if input.starts_with("<!--") {
            scan_delimited(input, 4, "-->").map(|(contents, len)| (Token::Comment(contents), len))
        } else if input.starts_with("<![CDATA[") {
            scan_delimited(input, 9, "]]>").map(|(contents, len)| (Token::Cdata(contents), len))
        } else if is_incomplete_prefix(input, &["<!--", "<![CDATA["]) {
            None
        } else if bytes.get(1).is_some_and(|&c| c == b'!' || c == b'?') {
            input
                .find('>')
                .map(|end| (Token::Directive(input[1..end].to_owned()), end + 1))
        } else if bytes.get(1) == Some(&b'/') {
            match bytes.get(2) {
                Some(c) if c.is_ascii_alphabetic() => scan_end_tag(input),
                Some(_) => Some((Token::Characters("</".to_owned()), 2)),
                None => None,
            }
        } else {
            match bytes.get(1) {
                Some(c) if c.is_ascii_alphabetic() => scan_start_tag(input),
                Some(_) => Some((Token::Characters("<".to_owned()), 1)),
                None => None,
            }
        };

        match result {
            Some((token, len)) => {
                if let Token::StartTag { name, .. } = &token {
                    let name = name.to_ascii_lowercase();
                    if is_raw_text_element(&name) {
                        self.raw_text = Some(name);
                    }
                }
                Scan::Token(token, len)
            }
            None => Scan::Incomplete,
        }
    }
}

fn is_incomplete_prefix(input: &str, prefixes: &[&str]) -> bool {
    prefixes
        .iter()
        .any(|prefix| input.len() < prefix.len() && prefix.starts_with(input))
}

fn scan_delimited(input: &str, start: usize, terminator: &str) -> Option<(String, usize)> {
    let end = input[start..].find(terminator)? + start;
    Some((input[start..end].to_owned(), end + terminator.len()))
}

/// Finds the closing tag of a raw-text element, returns the length of the text before it.
fn find_raw_text_end(input: &str, element: &str) -> Option<usize> {
    let lowercase = input.to_ascii_lowercase();
    let needle = format!("</{element}");
    let mut offset = 0;
    while let Some(found) = lowercase[offset..].find(&needle) {
        let pos = offset + found;
        match lowercase.as_bytes().get(pos + needle.len()) {
            Some(&c) if is_space(c) || c == b'>' || c == b'/' => return Some(pos),
            Some(_) => offset = pos + needle.len(),
            // Could still be the closing tag
            None => return None,
        }
    }
    None
}

fn scan_name(input: &str, start: usize) -> usize {
    input.as_bytes()[start..]
        .iter()
        .position(|&c| is_space(c) || c == b'/' || c == b'>')
        .map_or(input.len(), |len| start + len)
}

fn scan_end_tag(input: &str) -> Option<(Token, usize)> {
    let name_end = scan_name(input, 2);
    let end = input[name_end..].find('>')? + name_end;
    Some((
        Token::EndTag {
            name: input[2..name_end].to_owned(),
        },
        end + 1,
    ))
}

fn scan_start_tag(input: &str) -> Option<(Token, usize)> {
    let bytes = input.as_bytes();
    let name_end = scan_name(input, 1);
    let name = input[1..name_end].to_owned();
    let mut attributes = Vec::new();
    let mut pos = name_end;

    loop {
        while bytes.get(pos).is_some_and(|&c| is_space(c)) {
            pos += 1;
        }
        match *bytes.get(pos)? {
            b'>' => {
                return Some((
                    Token::StartTag {
                        name,
                        attributes,
                        self_closing: false,
                    },
                    pos + 1,
                ))
            }
            b'/' => match *bytes.get(pos + 1)? {
                b'>' => {
                    return Some((
                        Token::StartTag {
                            name,
                            attributes,
                            self_closing: true,
                        },
                        pos + 2,
                    ))
                }
                _ => pos += 1,
            },
            _ => {
                let name_start = pos;
                pos += 1;
                while bytes
                    .get(pos)
                    .is_some_and(|&c| !is_space(c) && !matches!(c, b'=' | b'>' | b'/'))
                {
                    pos += 1;
                }
                let attr_name = input[name_start..pos].to_owned();

                let mut after_name = pos;
                while bytes.get(after_name).is_some_and(|&c| is_space(c)) {
                    after_name += 1;
                }
                if *bytes.get(after_name)? != b'=' {
                    attributes.push(Attribute {
                        name: attr_name,
                        value: None,
                        quote: QuoteStyle::None,
                    });
                    continue;
                }

                pos = after_name + 1;
                while bytes.get(pos).is_some_and(|&c| is_space(c)) {
                    pos += 1;
                }
                let (value, quote) = match *bytes.get(pos)? {
                    quote @ (b'"' | b'\'') => {
                        let end = input[pos + 1..].find(char::from(quote))? + pos + 1;
                        let value = input[pos + 1..end].to_owned();
                        pos = end + 1;
                        let style = if quote == b'"' {
                            QuoteStyle::Double
                        } else {
                            QuoteStyle::Single
                        };
                        (value, style)
                    }
                    _ => {
                        let start = pos;
                        while bytes.get(pos).is_some_and(|&c| !is_space(c) && c != b'>') {
                            pos += 1;
                        }
                        // The value might continue in the next chunk
                        bytes.get(pos)?;
                        (input[start..pos].to_owned(), QuoteStyle::None)
                    }
                };
                attributes.push(Attribute {
                    name: attr_name,
                    value: Some(value),
                    quote,
                });
            }
        }
    }
}
