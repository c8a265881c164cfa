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

//! `srcset` candidates for high density screens
//!
//! Images with known display dimensions get a `srcset` attribute listing the image resized for
//! each configured pixel density. Candidates that can’t be produced keep the original image.

use std::collections::HashMap;

use super::image::pixel_attribute;
use super::{FilterContext, HtmlFilter};
use crate::driver::DriverState;
use crate::html::NodeId;
use crate::registry::Filter;
use crate::rewrite::{
    serialize_srcset, RewriteOutcome, RewriteParams, RewriteRequest, RewriterId, Slot,
};
use crate::url_namer::ImageDims;

#[derive(Debug, Default)]
pub(crate) struct ResponsiveFilter {
    nodes: HashMap<usize, NodeId>,
}

fn density_descriptor(density: f64) -> String {
    format!("{}x", (density * 100.0).round() / 100.0)
}

impl HtmlFilter for ResponsiveFilter {
    fn filter(&self) -> Filter {
        Filter::ResponsiveImages
    }

    fn determine_enabled(&mut self, state: &DriverState) -> bool {
        state
            .options
            .responsive_image_densities
            .iter()
            .any(|&density| density > 1.0)
    }

    fn start_element(&mut self, ctx: &mut FilterContext<'_>, node: NodeId) {
        if !ctx.doc.is_element(node, "img") || ctx.doc.has_attribute(node, "srcset") {
            return;
        }
        let (Some(width), Some(height)) = (
            pixel_attribute(ctx, node, "width"),
            pixel_attribute(ctx, node, "height"),
        ) else {
            return;
        };
        let Some(url) = ctx.resolve_resource(node, "src") else {
            return;
        };
        let Some(src) = ctx.doc.attribute(node, "src").map(|src| src.trim().to_owned()) else {
            return;
        };

        let densities = ctx
            .options
            .responsive_image_densities
            .iter()
            .copied()
            .filter(|&density| density > 1.0)
            .collect::<Vec<_>>();
        let candidates = densities
            .iter()
            .map(|&density| (src.clone(), density_descriptor(density)))
            .collect::<Vec<_>>();
        ctx.doc
            .set_attribute(node, "srcset", &serialize_srcset(&candidates));

        for (index, density) in densities.into_iter().enumerate() {
            let params = RewriteParams {
                dims: ImageDims {
                    width: Some((f64::from(width) * density).round() as u32),
                    height: Some((f64::from(height) * density).round() as u32),
                },
                ..Default::default()
            };
            let request = RewriteRequest::new(RewriterId::Image, vec![url.clone()], ctx.url.clone())
                .with_params(params);
            let token = ctx.initiate(request, vec![Slot::srcset_candidate(node, "srcset", index)]);
            self.nodes.insert(token, node);
        }
    }

    fn render(
        &mut self,
        ctx: &mut FilterContext<'_>,
        token: usize,
        outcome: Option<&RewriteOutcome>,
        slots: &mut [Slot],
    ) {
        let Some(node) = self.nodes.remove(&token) else {
            return;
        };
        // An inlined image doesn’t need candidates
        if ctx
            .doc
            .attribute(node, "src")
            .is_some_and(|src| src.starts_with("data:"))
        {
            ctx.doc.remove_attribute(node, "srcset");
            return;
        }
        if let Some(url) = outcome.and_then(RewriteOutcome::url) {
            let value = ctx.document_url(url);
            for slot in slots.iter() {
                slot.render(&mut ctx.doc, &value);
            }
        }
    }
}
