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
use crate::content_type::ContentType;
use crate::html::NodeId;
use crate::registry::Filter;
use crate::rewrite::{RewriteOutcome, RewriteRequest, RewriterId, Slot};

/// Records the stylesheets and scripts of the page as its dependencies. The final URL is read
/// from the document when it is written, so that other filters’ changes are reflected.
#[derive(Debug, Default)]
pub(crate) struct CollectDependenciesFilter {
    pending: HashMap<usize, Vec<usize>>,
}

impl HtmlFilter for CollectDependenciesFilter {
    fn filter(&self) -> Filter {
        Filter::CollectDependencies
    }

    fn start_element(&mut self, ctx: &mut FilterContext<'_>, node: NodeId) {
        let (attribute, content_type) = if is_stylesheet_link(ctx, node) {
            ("href", ContentType::Css)
        } else if ctx.doc.is_element(node, "script") && is_javascript(ctx, node) {
            ("src", ContentType::Javascript)
        } else {
            return;
        };
        let Some(url) = ctx.resolve_resource(node, attribute) else {
            return;
        };

        let id = ctx.dependencies.register(node, attribute, content_type);
        let request =
            RewriteRequest::new(RewriterId::CollectDependency, vec![url], ctx.url.clone());
        let token = ctx.initiate(request, Vec::new());
        self.pending.entry(token).or_default().push(id);
    }

    fn render(
        &mut self,
        ctx: &mut FilterContext<'_>,
        token: usize,
        outcome: Option<&RewriteOutcome>,
        _slots: &mut [Slot],
    ) {
        for id in self.pending.remove(&token).unwrap_or_default() {
            ctx.dependencies.set_result(id, outcome);
        }
    }
}
