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

//! Conservative JavaScript minification
//!
//! Comments are removed and whitespace is collapsed. Line breaks are kept where automatic
//! semicolon insertion might depend on them, string, template and regular expression literals
//! are copied unchanged.

const REGEX_KEYWORDS: &[&[u8]] = &[
    b"return",
    b"typeof",
    b"case",
    b"do",
    b"else",
    b"in",
    b"instanceof",
    b"new",
    b"void",
    b"delete",
    b"throw",
    b"yield",
    b"await",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Whitespace {
    None,
    Space,
    Newline,
}

fn is_word_byte(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'_' || c == b'$' || c == b'\\' || c >= 0x80
}

/// Checks whether a slash at the current position starts a regular expression literal rather
/// than a division, judging by what precedes it.
fn regex_allowed(out: &[u8]) -> bool {
    let Some(&last) = out.last() else {
        return true;
    };
    if matches!(
        last,
        b'(' | b','
            | b'='
            | b':'
            | b'['
            | b'!'
            | b'&'
            | b'|'
            | b'?'
            | b'{'
            | b'}'
            | b';'
            | b'+'
            | b'-'
            | b'*'
            | b'%'
            | b'<'
            | b'>'
            | b'~'
            | b'^'
            | b'\n'
    ) {
        return true;
    }
    let word_start = out
        .iter()
        .rposition(|&c| !is_word_byte(c))
        .map_or(0, |pos| pos + 1);
    REGEX_KEYWORDS.contains(&&out[word_start..])
}

/// Copies a quoted literal starting at `pos`, returns the position after it.
fn copy_quoted(input: &[u8], mut pos: usize, out: &mut Vec<u8>) -> usize {
    let quote = input[pos];
    out.push(quote);
    pos += 1;
    while let Some(&c) = input.get(pos) {
        out.push(c);
        pos += 1;
        if c == b'\\' {
            if let Some(&next) = input.get(pos) {
                out.push(next);
                pos += 1;
            }
        } else if c == quote || (c == b'\n' && quote != b'`') {
            break;
        }
    }
    pos
}

/// Copies a regular expression literal starting at `pos`, returns the position after its
/// closing slash. Flags are handled as regular identifier characters.
fn copy_regex(input: &[u8], mut pos: usize, out: &mut Vec<u8>) -> usize {
    out.push(b'/');
    pos += 1;
    let mut in_class = false;
    while let Some(&c) = input.get(pos) {
        if c == b'\n' {
            break;
        }
        out.push(c);
        pos += 1;
        match c {
            b'\\' => {
                if let Some(&next) = input.get(pos) {
                    out.push(next);
                    pos += 1;
                }
            }
            b'[' => in_class = true,
            b']' => in_class = false,
            b'/' if !in_class => break,
            _ => {}
        }
    }
    pos
}

/// Minifies a script.
pub fn minify(text: &str) -> String {
    let input = text.as_bytes();
    let mut out = Vec::with_capacity(input.len());
    let mut pending = Whitespace::None;
    let mut pos = 0;

    while let Some(&c) = input.get(pos) {
        match c {
            b'\n' | b'\r' => {
                pending = Whitespace::Newline;
                pos += 1;
            }
            c if c.is_ascii_whitespace() => {
                if pending == Whitespace::None {
                    pending = Whitespace::Space;
                }
                pos += 1;
            }
            b'/' if input.get(pos + 1) == Some(&b'/') => {
                pos = input[pos..]
                    .iter()
                    .position(|&c| c == b'\n')
                    .map_or(input.len(), |end| pos + end);
            }
            b'/' if input.get(pos + 1) == Some(&b'*') => {
                let end = text[pos + 2..]
                    .find("*/")
                    .map_or(input.len(), |end| pos + 2 + end + 2);
                if input[pos..end].contains(&b'\n') {
                    pending = Whitespace::Newline;
                } else if pending == Whitespace::None {
                    pending = Whitespace::Space;
                }
                pos = end;
            }
            _ => {
                emit_whitespace(&mut out, pending, c);
                pending = Whitespace::None;
                pos = match c {
                    b'"' | b'\'' | b'`' => copy_quoted(input, pos, &mut out),
                    b'/' if regex_allowed(&out) => copy_regex(input, pos, &mut out),
                    _ => {
                        out.push(c);
                        pos + 1
                    }
                };
            }
        }
    }

    // Only complete UTF-8 sequences are ever copied
    String::from_utf8(out).unwrap_or_else(|_| text.to_owned())
}

fn emit_whitespace(out: &mut Vec<u8>, pending: Whitespace, next: u8) {
    let Some(&last) = out.last() else {
        return;
    };
    match pending {
        Whitespace::None => {}
        Whitespace::Newline => {
            if !matches!(last, b'{' | b';' | b',' | b'(' | b'[' | b'=' | b':' | b'\n')
                && !matches!(next, b')' | b']' | b'}' | b';' | b',')
            {
                out.push(b'\n');
            }
        }
        Whitespace::Space => {
            if (is_word_byte(last) && is_word_byte(next))
                || (last == b'+' && next == b'+')
                || (last == b'-' && next == b'-')
                || (last == b'/' && next == b'/')
            {
                out.push(b' ');
            }
        }
    }
}

/// Checks whether a script contains a `"use strict"` directive. Concatenating such a script with
/// others would change their semantics.
pub fn uses_strict_mode(text: &str) -> bool {
    text.contains("\"use strict\"") || text.contains("'use strict'")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comments_and_whitespace() {
        assert_eq!(
            minify(
                "// header\nvar  a = 1 ;  /* inline */ \
                var b = a + 2;\n\n  function f ( x ) {\n    return x * 2 ;\n  }\n"
            ),
            "var a=1;var b=a+2;function f(x){return x*2;}"
        );
    }

    #[test]
    fn keeps_line_breaks_for_asi() {
        assert_eq!(minify("a = b\nc()\n"), "a=b\nc()");
        assert_eq!(minify("x = {}\nfoo()"), "x={}\nfoo()");
        assert_eq!(minify("i++\n++j"), "i++\n++j");
        assert_eq!(minify("a + +b; c - -d"), "a+ +b;c- -d");
    }

    #[test]
    fn literals() {
        assert_eq!(
            minify("var s = 'a  // not a comment';  var t = \"/* nor this */\";"),
            "var s='a  // not a comment';var t=\"/* nor this */\";"
        );
        assert_eq!(minify("var t = `a  ${b}  c`;"), "var t=`a  ${b}  c`;");
        assert_eq!(
            minify("var r = /[/]  x\\/ /g.test(s); var d = a / b / c;"),
            "var r=/[/]  x\\/ /g.test(s);var d=a/b/c;"
        );
        assert_eq!(minify("return /a  b/.exec(x)"), "return/a  b/.exec(x)");
        assert_eq!(minify("var ü = 'ö';  // ä"), "var ü='ö';");
    }

    #[test]
    fn strict_mode() {
        assert!(uses_strict_mode("'use strict';\nvar a;"));
        assert!(uses_strict_mode("function f() { \"use strict\"; }"));
        assert!(!uses_strict_mode("var a = 'use strictly';"));
    }
}
