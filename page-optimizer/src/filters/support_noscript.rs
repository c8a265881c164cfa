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

//! Fallback for browsers without scripting: a `<noscript>` redirect to the page with
//! script-injecting filters turned off

use maud::{html, PreEscaped};
use url::Url;

use super::{FilterContext, HtmlFilter};
use crate::driver::DriverState;
use crate::html::{NodeId, NodeKind};
use crate::registry::{Filter, ScriptUsage};

const NOSCRIPT_PARAMETER: &str = "PageSpeed=noscript";

fn noscript_url(url: &Url) -> String {
    let mut url = url.clone();
    url.set_fragment(None);
    let query = match url.query() {
        Some(query) if !query.is_empty() => format!("{query}&{NOSCRIPT_PARAMETER}"),
        _ => NOSCRIPT_PARAMETER.to_owned(),
    };
    url.set_query(Some(&query));
    url.into()
}

fn markup(url: &Url) -> String {
    let target = noscript_url(url);
    let refresh = format!("0;url='{target}'");
    html! {
        noscript {
            meta http-equiv="refresh" content=(refresh);
            style {
                (PreEscaped("<!--table,div,span,font,p{display:none} -->"))
            }
            div style="display:block" {
                "Please click "
                a href=(target) { "here" }
                " if you are not redirected within a few seconds."
            }
        }
    }
    .into_string()
}

#[derive(Debug, Default)]
pub(crate) struct NoscriptFilter {
    inserted: bool,
}

impl HtmlFilter for NoscriptFilter {
    fn filter(&self) -> Filter {
        Filter::SupportNoscript
    }

    fn determine_enabled(&mut self, state: &DriverState) -> bool {
        state
            .options
            .active_filters()
            .iter()
            .any(|filter| filter.script_usage() == ScriptUsage::WillInjectScripts)
    }

    fn start_element(&mut self, ctx: &mut FilterContext<'_>, node: NodeId) {
        if !self.inserted && ctx.doc.is_element(node, "body") {
            self.inserted = true;
            let markup = markup(&ctx.url);
            ctx.doc.append_child(node, NodeKind::characters(markup));
        }
    }

    fn end_element(&mut self, ctx: &mut FilterContext<'_>, node: NodeId) {
        // Leftover of a previous rewriting pass
        if ctx.doc.is_element(node, "noscript")
            && ctx.doc.text_content(node).contains(NOSCRIPT_PARAMETER)
        {
            ctx.doc.delete_node(node);
        }
    }

    fn end_document(&mut self, ctx: &mut FilterContext<'_>) {
        if !self.inserted {
            self.inserted = true;
            let markup = markup(&ctx.url);
            let root = ctx.doc.root();
            ctx.doc.append_child(root, NodeKind::characters(markup));
        }
    }
}
