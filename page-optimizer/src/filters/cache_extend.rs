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

use super::{FilterContext, HtmlFilter};
use crate::content_type::ContentType;
use crate::html::NodeId;
use crate::registry::Filter;
use crate::rewrite::{RewriteRequest, RewriterId, Slot};

/// Renames images that aren’t optimized otherwise so that they can be cached for a long time
#[derive(Debug)]
pub(crate) struct CacheExtendFilter;

impl HtmlFilter for CacheExtendFilter {
    fn filter(&self) -> Filter {
        Filter::CacheExtendImages
    }

    fn start_element(&mut self, ctx: &mut FilterContext<'_>, node: NodeId) {
        // Image optimization renames these already
        if ctx.doc.is_element(node, "img") && RewriterId::Image.is_enabled(&ctx.options) {
            return;
        }

        let attribute = if ctx.doc.is_element(node, "img") {
            "src"
        } else if ctx.doc.is_element(node, "link")
            && ctx.doc.attribute(node, "rel").is_some_and(|rel| {
                rel.split_ascii_whitespace()
                    .any(|token| token.eq_ignore_ascii_case("icon"))
            })
        {
            "href"
        } else {
            return;
        };

        let Some(url) = ctx.resolve_resource(node, attribute) else {
            return;
        };
        if !ContentType::from_path(url.path()).is_image() {
            return;
        }
        let request = RewriteRequest::new(RewriterId::CacheExtend, vec![url], ctx.url.clone());
        ctx.initiate(request, vec![Slot::attribute(node, attribute)]);
    }
}
