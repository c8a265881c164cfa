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

//! Image optimization: recompression, resizing, WebP conversion, inlining and dimension
//! insertion for `<img>` elements

use super::{image_key, FilterContext, HtmlFilter};
use crate::driver::DriverState;
use crate::html::NodeId;
use crate::property_cache::BeaconKind;
use crate::registry::Filter;
use crate::rewrite::{
    parse_srcset, RewriteOutcome, RewriteParams, RewriteRequest, RewriterId, Slot, SlotLocation,
};
use crate::statistics::Stat;
use crate::url_namer::{ImageDims, PAGESPEED_MARKER};

use log::trace;

/// Parses a `width` or `height` attribute given in pixels.
pub(crate) fn pixel_attribute(state: &DriverState, node: NodeId, name: &str) -> Option<u32> {
    let value = state.doc.attribute(node, name)?;
    let value = value.trim();
    let value = value.strip_suffix("px").unwrap_or(value);
    value.parse().ok().filter(|&value| value > 0)
}

#[derive(Debug, Default)]
pub(crate) struct ImageFilter {
    /// Whether image URLs in the document may change at all
    preserve_urls: bool,
}

impl ImageFilter {
    fn params(&self, ctx: &FilterContext<'_>, node: NodeId) -> RewriteParams {
        let options = &ctx.options;
        let mut params = RewriteParams::default();
        if options.is_enabled(Filter::ResizeImages) {
            params.dims = ImageDims {
                width: pixel_attribute(ctx, node, "width"),
                height: pixel_attribute(ctx, node, "height"),
            };
        }
        params.webp = options.is_enabled(Filter::ConvertToWebp) && ctx.accepts_webp();
        params.save_data = ctx.save_data();
        params.inline = options.is_enabled(Filter::InlineImages) && self.may_inline(ctx, node);
        params
    }

    /// Only images visible without scrolling are inlined once the beacon reported them.
    fn may_inline(&self, ctx: &FilterContext<'_>, node: NodeId) -> bool {
        let Some(critical) = ctx
            .page
            .dom()
            .beacons
            .get(&BeaconKind::CriticalImages)
            .map(|metadata| &metadata.critical_keys)
            .filter(|keys| !keys.is_empty())
        else {
            return true;
        };
        let Some(url) = ctx
            .doc
            .attribute(node, "src")
            .and_then(|src| ctx.base.join(src.trim()).ok())
        else {
            return false;
        };
        critical.contains(&image_key(&url))
    }
}

impl HtmlFilter for ImageFilter {
    fn filter(&self) -> Filter {
        Filter::RecompressImages
    }

    fn determine_enabled(&mut self, state: &DriverState) -> bool {
        self.preserve_urls = state.options.image_preserve_urls;
        !self.preserve_urls || state.options.in_place_preemptive_rewrite_images
    }

    fn start_document(&mut self, ctx: &mut FilterContext<'_>) {
        if self.preserve_urls {
            return;
        }
        // The document differs for browsers supporting WebP or asking to save data
        let options = ctx.options.clone();
        if options.is_enabled(Filter::ConvertToWebp) && options.allow_vary_on.allows_accept() {
            ctx.headers.add_vary("Accept");
        }
        if options.image_jpeg_quality_for_save_data.is_some()
            && options.allow_vary_on.allows_save_data()
        {
            ctx.headers.add_vary("Save-Data");
        }
    }

    fn start_element(&mut self, ctx: &mut FilterContext<'_>, node: NodeId) {
        if !ctx.doc.is_element(node, "img")
            && !(ctx.doc.is_element(node, "input")
                && ctx
                    .doc
                    .attribute(node, "type")
                    .is_some_and(|kind| kind.eq_ignore_ascii_case("image")))
        {
            return;
        }

        if let Some(url) = ctx.resolve_resource(node, "src") {
            let params = self.params(ctx, node);
            let request = RewriteRequest::new(RewriterId::Image, vec![url], ctx.url.clone())
                .with_params(params);
            // With preserved URLs the rewrite only prepares the optimized image for in-place
            // serving
            let slots = if self.preserve_urls {
                Vec::new()
            } else {
                vec![Slot::attribute(node, "src")]
            };
            ctx.initiate(request, slots);
        }

        if self.preserve_urls || ctx.is_no_transform(node) {
            return;
        }
        let Some(srcset) = ctx.doc.attribute(node, "srcset").map(|value| value.into_owned())
        else {
            return;
        };
        let base = ctx.base.clone();
        for (index, (candidate, _)) in parse_srcset(&srcset).into_iter().enumerate() {
            if candidate.starts_with("data:") || candidate.contains(PAGESPEED_MARKER) {
                continue;
            }
            let Ok(url) = base.join(&candidate) else {
                continue;
            };
            if !ctx.server.lawyer().is_authorized(&url, &ctx.url) {
                continue;
            }
            let params = RewriteParams {
                webp: ctx.options.is_enabled(Filter::ConvertToWebp) && ctx.accepts_webp(),
                save_data: ctx.save_data(),
                ..Default::default()
            };
            let request = RewriteRequest::new(RewriterId::Image, vec![url], ctx.url.clone())
                .with_params(params);
            ctx.initiate(request, vec![Slot::srcset_candidate(node, "srcset", index)]);
        }
    }

    fn render(
        &mut self,
        ctx: &mut FilterContext<'_>,
        _token: usize,
        outcome: Option<&RewriteOutcome>,
        slots: &mut [Slot],
    ) {
        let Some(outcome) = outcome else {
            return;
        };

        for slot in slots.iter() {
            let node = slot.node();
            if slot.is_disabled() || !ctx.doc.is_attached(node) {
                continue;
            }
            let is_src = matches!(slot.location(), SlotLocation::Attribute { .. });

            if let (true, Some(data)) = (is_src, outcome.inlined_data()) {
                trace!("Inlining image");
                ctx.server.statistics().increment(Stat::ResourcesInlined);
                // Removed first so that the data URL goes last
                ctx.doc.remove_attribute(node, "src");
                ctx.doc.set_attribute(node, "src", data);
            } else if let Some(url) = outcome.url() {
                let value = ctx.document_url(url);
                slot.render(&mut ctx.doc, &value);
            }

            if is_src && ctx.options.is_enabled(Filter::InsertImageDimensions) {
                if let Some(dims) = outcome.result.dims {
                    if !ctx.doc.has_attribute(node, "width")
                        && !ctx.doc.has_attribute(node, "height")
                    {
                        ctx.doc
                            .set_attribute(node, "width", &dims.width.to_string());
                        ctx.doc
                            .set_attribute(node, "height", &dims.height.to_string());
                    }
                }
            }
        }
    }
}
