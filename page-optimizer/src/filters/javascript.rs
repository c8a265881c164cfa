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

use super::{is_javascript, FilterContext, HtmlFilter};
use crate::html::{is_safe_raw_text, NodeId};
use crate::js;
use crate::registry::Filter;
use crate::rewrite::{RewriteRequest, RewriterId, Slot};

/// Minifies external and inline scripts
#[derive(Debug)]
pub(crate) struct JavascriptFilter;

impl HtmlFilter for JavascriptFilter {
    fn filter(&self) -> Filter {
        Filter::RewriteJavascript
    }

    fn start_element(&mut self, ctx: &mut FilterContext<'_>, node: NodeId) {
        if !ctx.doc.is_element(node, "script") || !is_javascript(ctx, node) {
            return;
        }
        if let Some(url) = ctx.resolve_resource(node, "src") {
            let request = RewriteRequest::new(RewriterId::Javascript, vec![url], ctx.url.clone());
            ctx.initiate(request, vec![Slot::attribute(node, "src")]);
        }
    }

    fn end_element(&mut self, ctx: &mut FilterContext<'_>, node: NodeId) {
        if !ctx.doc.is_element(node, "script")
            || ctx.doc.has_attribute(node, "src")
            || !is_javascript(ctx, node)
            || ctx.is_no_transform(node)
        {
            return;
        }
        let text = ctx.doc.text_content(node);
        let minified = js::minify(&text);
        if minified.len() < text.len() && is_safe_raw_text("script", &minified) {
            ctx.doc.set_text_content(node, &minified);
        }
    }
}
