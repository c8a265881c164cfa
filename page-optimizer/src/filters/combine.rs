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

//! Combining adjacent stylesheet links or script elements
//!
//! Elements are adjacent if nothing but whitespace separates them. A group ends with any other
//! content and with every flush, groups with at least two members are combined.

use log::trace;
use std::collections::HashMap;
use url::Url;

use super::{is_javascript, is_stylesheet_link, FilterContext, HtmlFilter};
use crate::html::{NodeId, NodeKind};
use crate::registry::Filter;
use crate::rewrite::{RewriteOutcome, RewriteRequest, RewriterId, Slot};
use crate::url_namer::directory_of;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Css,
    Javascript,
}

#[derive(Debug)]
struct Member {
    node: NodeId,
    url: Url,
}

#[derive(Debug)]
pub(crate) struct CombineFilter {
    kind: Kind,
    group: Vec<Member>,
    /// Media of the current stylesheet group
    media: String,
    /// Script element whose contents are still being received
    open_script: Option<(NodeId, Url)>,
    /// Elements of each group per rewrite, identical groups share a rewrite. Group `i` belongs
    /// to slot `i` of the rewrite.
    combined: HashMap<usize, Vec<Vec<NodeId>>>,
}

impl CombineFilter {
    fn new(kind: Kind) -> Self {
        Self {
            kind,
            group: Vec::new(),
            media: String::new(),
            open_script: None,
            combined: HashMap::new(),
        }
    }

    pub(crate) fn css() -> Self {
        Self::new(Kind::Css)
    }

    pub(crate) fn javascript() -> Self {
        Self::new(Kind::Javascript)
    }

    fn attribute(&self) -> &'static str {
        match self.kind {
            Kind::Css => "href",
            Kind::Javascript => "src",
        }
    }

    fn add(&mut self, ctx: &mut FilterContext<'_>, node: NodeId, url: Url, media: String) {
        let compatible = self.group.first().is_some_and(|first| {
            self.media == media && directory_of(&first.url) == directory_of(&url)
        });
        if !compatible {
            self.finish_group(ctx);
            self.media = media;
        }
        self.group.push(Member { node, url });
    }

    fn finish_group(&mut self, ctx: &mut FilterContext<'_>) {
        let group = std::mem::take(&mut self.group);
        if group.len() < 2 {
            return;
        }
        trace!("Combining {} elements", group.len());

        let id = match self.kind {
            Kind::Css => RewriterId::CombineCss,
            Kind::Javascript => RewriterId::CombineJavascript,
        };
        let inputs = group.iter().map(|member| member.url.clone()).collect();
        let request = RewriteRequest::new(id, inputs, ctx.url.clone());
        let slot = Slot::attribute(group[0].node, self.attribute());
        let token = ctx.initiate(request, vec![slot]);
        self.combined
            .entry(token)
            .or_default()
            .push(group.into_iter().map(|member| member.node).collect());
    }
}

impl HtmlFilter for CombineFilter {
    fn filter(&self) -> Filter {
        match self.kind {
            Kind::Css => Filter::CombineCss,
            Kind::Javascript => Filter::CombineJavascript,
        }
    }

    fn start_element(&mut self, ctx: &mut FilterContext<'_>, node: NodeId) {
        match self.kind {
            Kind::Css if is_stylesheet_link(ctx, node) => {
                match ctx.resolve_resource(node, "href") {
                    Some(url) => {
                        let media = ctx
                            .doc
                            .attribute(node, "media")
                            .map(|media| media.trim().to_ascii_lowercase())
                            .unwrap_or_default();
                        self.add(ctx, node, url, media);
                    }
                    None => self.finish_group(ctx),
                }
            }
            Kind::Javascript if ctx.doc.is_element(node, "script") => {
                let combinable = is_javascript(ctx, node)
                    && !ctx.doc.has_attribute(node, "async")
                    && !ctx.doc.has_attribute(node, "defer");
                match ctx.resolve_resource(node, "src").filter(|_| combinable) {
                    Some(url) => self.open_script = Some((node, url)),
                    None => self.finish_group(ctx),
                }
            }
            _ => self.finish_group(ctx),
        }
    }

    fn end_element(&mut self, ctx: &mut FilterContext<'_>, node: NodeId) {
        if let Some((script, url)) = self.open_script.take() {
            if script == node {
                if ctx.doc.text_content(node).trim().is_empty() {
                    self.add(ctx, node, url, String::new());
                } else {
                    self.finish_group(ctx);
                }
                return;
            }
            self.open_script = Some((script, url));
        }
        if self.group.iter().all(|member| member.node != node) {
            self.finish_group(ctx);
        }
    }

    fn characters(&mut self, ctx: &mut FilterContext<'_>, node: NodeId) {
        let inside_script = self
            .open_script
            .as_ref()
            .is_some_and(|(script, _)| ctx.doc.parent(node) == Some(*script));
        let whitespace = matches!(
            ctx.doc.kind(node),
            Some(NodeKind::Characters(text)) if text.trim().is_empty()
        );
        if !inside_script && !whitespace {
            self.finish_group(ctx);
        }
    }

    fn comment(&mut self, ctx: &mut FilterContext<'_>, _node: NodeId) {
        self.finish_group(ctx);
    }

    fn cdata(&mut self, ctx: &mut FilterContext<'_>, _node: NodeId) {
        self.finish_group(ctx);
    }

    fn directive(&mut self, ctx: &mut FilterContext<'_>, _node: NodeId) {
        self.finish_group(ctx);
    }

    fn flush(&mut self, ctx: &mut FilterContext<'_>) {
        self.finish_group(ctx);
    }

    fn end_document(&mut self, ctx: &mut FilterContext<'_>) {
        self.finish_group(ctx);
    }

    fn render(
        &mut self,
        ctx: &mut FilterContext<'_>,
        token: usize,
        outcome: Option<&RewriteOutcome>,
        slots: &mut [Slot],
    ) {
        let Some(groups) = self.combined.remove(&token) else {
            return;
        };
        let Some(url) = outcome.and_then(RewriteOutcome::url) else {
            return;
        };
        let value = ctx.document_url(url);
        for (slot, members) in slots.iter().zip(groups) {
            // Members have to be complete and still part of the document
            if members[1..]
                .iter()
                .any(|&node| !ctx.doc.is_attached(node) || ctx.doc.is_open(node))
            {
                trace!("Combined elements changed, keeping them");
                continue;
            }
            if !slot.render(&mut ctx.doc, &value) {
                continue;
            }
            for &node in &members[1..] {
                ctx.doc.delete_node(node);
            }
        }
    }
}
