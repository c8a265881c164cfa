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

use http::{header, HeaderName};
use log::trace;

use super::{FilterContext, HtmlFilter};
use crate::html::NodeId;
use crate::registry::Filter;

/// Copies `<meta http-equiv>` declarations into response headers the origin didn’t send
#[derive(Debug)]
pub(crate) struct MetaTagFilter;

impl HtmlFilter for MetaTagFilter {
    fn filter(&self) -> Filter {
        Filter::ConvertMetaTags
    }

    fn start_element(&mut self, ctx: &mut FilterContext<'_>, node: NodeId) {
        if !ctx.doc.is_element(node, "meta") || ctx.headers.is_committed() {
            return;
        }
        let (Some(name), Some(content)) = (
            ctx.doc.attribute(node, "http-equiv"),
            ctx.doc.attribute(node, "content"),
        ) else {
            return;
        };
        let Ok(name) = HeaderName::from_bytes(name.trim().as_bytes()) else {
            return;
        };
        // Headers with side effects stay in the markup only
        if name == header::REFRESH || name == header::SET_COOKIE {
            return;
        }
        let content = content.trim().to_owned();
        if content.is_empty() || ctx.headers.contains(&name) {
            return;
        }
        trace!("Converting meta tag into header {name}: {content}");
        ctx.headers.add(name, &content);
    }
}
