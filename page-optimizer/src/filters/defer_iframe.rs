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

/// Element name iframes are renamed to until the page loads
pub(crate) const DEFERRED_IFRAME: &str = "pagespeed_iframe";

const LOADER: &str = "window.addEventListener(\"load\",function(){\
    var e=document.getElementsByTagName(\"pagespeed_iframe\");\
    while(e.length){var o=e[0],n=document.createElement(\"iframe\");\
    for(var i=0;i<o.attributes.length;i++)\
    n.setAttribute(o.attributes[i].name,o.attributes[i].value);\
    while(o.firstChild)n.appendChild(o.firstChild);\
    o.parentNode.replaceChild(n,o);}});";

/// Delays loading of iframes until the page finished loading
#[derive(Debug, Default)]
pub(crate) struct DeferIframeFilter {
    body: Option<NodeId>,
    deferred: usize,
}

impl HtmlFilter for DeferIframeFilter {
    fn filter(&self) -> Filter {
        Filter::DeferIframe
    }

    fn start_element(&mut self, ctx: &mut FilterContext<'_>, node: NodeId) {
        if ctx.doc.is_element(node, "body") {
            self.body = Some(node);
        }
    }

    fn end_element(&mut self, ctx: &mut FilterContext<'_>, node: NodeId) {
        // Renamed once closed, the end tag has to match the original name until then
        if ctx.doc.is_element(node, "iframe")
            && !ctx.is_no_transform(node)
            && !ctx.doc.is_start_written(node)
        {
            ctx.doc.rename_element(node, DEFERRED_IFRAME);
            self.deferred += 1;
        }
    }

    fn end_document(&mut self, ctx: &mut FilterContext<'_>) {
        if self.deferred == 0 {
            return;
        }
        let script = html! {
            script { (PreEscaped(LOADER)) }
        }
        .into_string();
        let parent = self
            .body
            .filter(|&body| ctx.doc.is_attached(body))
            .unwrap_or_else(|| ctx.doc.root());
        ctx.doc.append_child(parent, NodeKind::characters(script));
    }
}
