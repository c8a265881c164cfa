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

use std::collections::HashMap;

use super::{is_javascript, is_stylesheet_link, FilterContext, HtmlFilter};
use crate::css::media_applies_to_screen;
use crate::html::{NodeId, NodeKind};
use crate::registry::Filter;
use crate::rewrite::{RewriteOutcome, RewriteRequest, RewriterId, Slot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Css,
    Javascript,
}

/// Replaces references to small stylesheets and scripts by their contents
#[derive(Debug)]
pub(crate) struct InlineFilter {
    kind: Kind,
    nodes: HashMap<usize, Vec<NodeId>>,
}

impl InlineFilter {
    pub(crate) fn css() -> Self {
        Self {
            kind: Kind::Css,
            nodes: HashMap::new(),
        }
    }

    pub(crate) fn javascript() -> Self {
        Self {
            kind: Kind::Javascript,
            nodes: HashMap::new(),
        }
    }

    fn inline_css(ctx: &mut FilterContext<'_>, node: NodeId, text: &str) {
        if ctx.doc.is_open(node) {
            return;
        }
        let media = ctx
            .doc
            .attribute(node, "media")
            .map(|media| media.into_owned())
            .filter(|media| !media.trim().is_empty());
        let attributes = match &media {
            Some(media) => vec![("media", media.as_str())],
            None => Vec::new(),
        };
        if let Some(style) = ctx
            .doc
            .replace_node(node, NodeKind::element("style", &attributes))
        {
            ctx.doc.append_child(style, NodeKind::characters(text));
        }
    }

    fn inline_javascript(ctx: &mut FilterContext<'_>, node: NodeId, text: &str) {
        if ctx.doc.is_open(node) {
            return;
        }
        ctx.doc.remove_attribute(node, "src");
        ctx.doc.set_text_content(node, text);
    }
}

impl HtmlFilter for InlineFilter {
    fn filter(&self) -> Filter {
        match self.kind {
            Kind::Css => Filter::InlineCss,
            Kind::Javascript => Filter::InlineJavascript,
        }
    }

    fn start_element(&mut self, ctx: &mut FilterContext<'_>, node: NodeId) {
        if self.kind != Kind::Css || !is_stylesheet_link(ctx, node) {
            return;
        }
        let media = ctx.doc.attribute(node, "media").unwrap_or_default();
        if !media_applies_to_screen(&media) {
            return;
        }
        if let Some(url) = ctx.resolve_resource(node, "href") {
            let request = RewriteRequest::new(RewriterId::InlineCss, vec![url], ctx.url.clone());
            let token = ctx.initiate(request, Vec::new());
            self.nodes.entry(token).or_default().push(node);
        }
    }

    fn end_element(&mut self, ctx: &mut FilterContext<'_>, node: NodeId) {
        if self.kind != Kind::Javascript
            || !ctx.doc.is_element(node, "script")
            || !is_javascript(ctx, node)
            || !ctx.doc.text_content(node).trim().is_empty()
        {
            return;
        }
        if let Some(url) = ctx.resolve_resource(node, "src") {
            let request =
                RewriteRequest::new(RewriterId::InlineJavascript, vec![url], ctx.url.clone());
            let token = ctx.initiate(request, Vec::new());
            self.nodes.entry(token).or_default().push(node);
        }
    }

    fn render(
        &mut self,
        ctx: &mut FilterContext<'_>,
        token: usize,
        outcome: Option<&RewriteOutcome>,
        _slots: &mut [Slot],
    ) {
        let Some(nodes) = self.nodes.remove(&token) else {
            return;
        };
        let Some(text) = outcome.and_then(RewriteOutcome::inlined_data) else {
            return;
        };
        for node in nodes {
            if !ctx.doc.is_attached(node) {
                continue;
            }
            match self.kind {
                Kind::Css => Self::inline_css(ctx, node, text),
                Kind::Javascript => Self::inline_javascript(ctx, node, text),
            }
        }
    }
}
