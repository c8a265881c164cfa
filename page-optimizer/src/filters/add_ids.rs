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
use crate::html::NodeId;
use crate::registry::Filter;

/// Prefix of generated ids
pub(crate) const ID_PREFIX: &str = "PageSpeed-";

#[derive(Debug)]
struct Level {
    node: Option<NodeId>,
    path: String,
    children: usize,
}

/// Gives `<div>` elements without an id one derived from their position: the element index
/// path starting at the closest ancestor with an id.
#[derive(Debug)]
pub(crate) struct AddIdsFilter {
    stack: Vec<Level>,
}

impl Default for AddIdsFilter {
    fn default() -> Self {
        Self {
            stack: vec![Level {
                node: None,
                path: String::new(),
                children: 0,
            }],
        }
    }
}

impl HtmlFilter for AddIdsFilter {
    fn filter(&self) -> Filter {
        Filter::AddIds
    }

    fn start_element(&mut self, ctx: &mut FilterContext<'_>, node: NodeId) {
        let Some(parent) = self.stack.last_mut() else {
            return;
        };
        let index = parent.children;
        parent.children += 1;

        let path = match ctx.doc.attribute(node, "id") {
            Some(id) => id.into_owned(),
            None if parent.path.is_empty() => index.to_string(),
            None => format!("{}-{index}", parent.path),
        };
        if ctx.doc.is_element(node, "div") && !ctx.doc.has_attribute(node, "id") {
            ctx.doc
                .set_attribute(node, "id", &format!("{ID_PREFIX}{path}"));
        }
        self.stack.push(Level {
            node: Some(node),
            path,
            children: 0,
        });
    }

    fn end_element(&mut self, _ctx: &mut FilterContext<'_>, node: NodeId) {
        if let Some(position) = self
            .stack
            .iter()
            .rposition(|level| level.node == Some(node))
        {
            self.stack.truncate(position);
        }
    }
}
