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

use log::trace;

use super::{is_stylesheet_link, FilterContext, HtmlFilter};
use crate::css;
use crate::html::{is_safe_raw_text, NodeId};
use crate::registry::Filter;
use crate::rewrite::{RewriteRequest, RewriterId, Slot};

/// Rewrites external stylesheets, minifies inline ones
#[derive(Debug)]
pub(crate) struct CssFilter;

impl HtmlFilter for CssFilter {
    fn filter(&self) -> Filter {
        Filter::RewriteCss
    }

    fn start_element(&mut self, ctx: &mut FilterContext<'_>, node: NodeId) {
        if !is_stylesheet_link(ctx, node) {
            return;
        }
        if let Some(url) = ctx.resolve_resource(node, "href") {
            let request = RewriteRequest::new(RewriterId::Css, vec![url], ctx.url.clone());
            ctx.initiate(request, vec![Slot::attribute(node, "href")]);
        }
    }

    fn end_element(&mut self, ctx: &mut FilterContext<'_>, node: NodeId) {
        if !ctx.doc.is_element(node, "style") || ctx.is_no_transform(node) {
            return;
        }
        let text = ctx.doc.text_content(node);
        if css::parse(&text).is_err() {
            trace!("Not minifying inline style, parsing failed");
            return;
        }
        let minified = css::minify(&text);
        if minified.len() < text.len() && is_safe_raw_text("style", &minified) {
            ctx.doc.set_text_content(node, &minified);
        }
    }
}
