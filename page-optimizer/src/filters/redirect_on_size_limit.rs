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

use maud::{html, PreEscaped};

use super::{FilterContext, HtmlFilter};
use crate::html::{NodeId, NodeKind};
use crate::registry::Filter;

/// Escapes a string for use in a double-quoted JavaScript string literal inside a `<script>`
/// element.
pub(crate) fn js_string(value: &str) -> String {
    let mut result = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '"' => result.push_str("\\\""),
            '\\' => result.push_str("\\\\"),
            '<' => result.push_str("\\x3c"),
            '\n' => result.push_str("\\n"),
            '\r' => result.push_str("\\r"),
            c => result.push(c),
        }
    }
    result
}

/// Sends scripted browsers to the unoptimized page once the document turns out too large
#[derive(Debug)]
pub(crate) struct RedirectFilter;

impl HtmlFilter for RedirectFilter {
    fn filter(&self) -> Filter {
        Filter::RedirectOnSizeLimit
    }

    fn size_limit_exceeded(&mut self, ctx: &mut FilterContext<'_>, node: NodeId) {
        let url = ctx.url.as_str();
        let separator = if ctx.url.query().is_some() { '&' } else { '?' };
        let target = format!("{url}{separator}ModPagespeed=off");
        let script = html! {
            script {
                (PreEscaped(format!("window.location=\"{}\";", js_string(&target))))
            }
        }
        .into_string();
        ctx.doc.insert_before(node, NodeKind::characters(script));
    }
}
