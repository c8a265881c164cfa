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

//! HTML filters
//!
//! Filters receive parser events in their registration order. They inspect and change the
//! document tree, start resource rewrites and eventually render rewrite outcomes back into the
//! document. Event callbacks are synchronous, waiting for rewrites is up to the driver.

mod add_ids;
mod beacons;
mod cache_extend;
mod collect_dependencies;
mod combine;
mod css;
mod defer_iframe;
mod image;
mod inline;
mod insert_ga;
mod javascript;
mod meta_tags;
mod push_preload;
mod redirect_on_size_limit;
mod responsive;
mod support_noscript;

pub(crate) use beacons::image_key;
pub use beacons::BEACON_PATH;

use http::header;
use log::trace;
use std::ops::{Deref, DerefMut};
use url::Url;

use crate::configuration::RewriteOptions;
use crate::driver::DriverState;
use crate::html::NodeId;
use crate::registry::{sort_filters, Filter};
use crate::rewrite::{RewriteOutcome, RewriteRequest, Slot};
use crate::url_namer::{trim_url, PAGESPEED_MARKER};

/// Access to the document and the request state for a filter callback
pub(crate) struct FilterContext<'a> {
    state: &'a mut DriverState,
    filter: usize,
}

impl<'a> FilterContext<'a> {
    pub(crate) fn new(state: &'a mut DriverState, filter: usize) -> Self {
        Self { state, filter }
    }

    /// Starts a resource rewrite, rendered through [`HtmlFilter::render`] with the returned
    /// token. Identical requests of the same filter share a token, their slots are merged.
    pub(crate) fn initiate(&mut self, request: RewriteRequest, slots: Vec<Slot>) -> usize {
        let filter = self.filter;
        self.state.initiate(filter, request, slots)
    }
}

impl Deref for FilterContext<'_> {
    type Target = DriverState;

    fn deref(&self) -> &Self::Target {
        self.state
    }
}

impl DerefMut for FilterContext<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.state
    }
}

impl DriverState {
    /// Resolves a resource reference in an element attribute. Returns `None` for inline data,
    /// already rewritten URLs, elements marked `pagespeed_no_transform` and resources from
    /// domains that aren’t authorized.
    pub(crate) fn resolve_resource(&self, node: NodeId, attribute: &str) -> Option<Url> {
        if self.is_no_transform(node) {
            return None;
        }
        let value = self.doc.attribute(node, attribute)?;
        let value = value.trim();
        if value.is_empty() || value.starts_with("data:") || value.contains(PAGESPEED_MARKER) {
            return None;
        }
        let url = self.base.join(value).ok()?;
        if !self.server.lawyer().is_authorized(&url, &self.url) {
            trace!("Not rewriting {url}, domain not authorized");
            return None;
        }
        Some(url)
    }

    /// Checks whether the element opted out of rewriting.
    pub(crate) fn is_no_transform(&self, node: NodeId) -> bool {
        self.doc.has_attribute(node, "pagespeed_no_transform")
            || self.doc.has_attribute(node, "data-pagespeed-no-transform")
    }

    /// Converts an absolute URL into the shortest form valid in this document.
    pub(crate) fn document_url(&self, url: &str) -> String {
        match Url::parse(url) {
            Ok(url) => trim_url(&url, &self.base),
            Err(_) => url.to_owned(),
        }
    }

    /// Checks whether the browser announced WebP support and rewritten resources may vary on
    /// it.
    pub(crate) fn accepts_webp(&self) -> bool {
        self.options.allow_vary_on.allows_accept()
            && self
                .request_headers
                .get_all(header::ACCEPT)
                .iter()
                .filter_map(|value| value.to_str().ok())
                .any(|value| value.contains("image/webp"))
    }

    /// Checks whether the browser asked to save data and rewritten resources may vary on it.
    pub(crate) fn save_data(&self) -> bool {
        self.options.allow_vary_on.allows_save_data()
            && self
                .request_headers
                .get("save-data")
                .and_then(|value| value.to_str().ok())
                .is_some_and(|value| value.trim().eq_ignore_ascii_case("on"))
    }
}

/// Checks whether an element is a stylesheet link.
pub(crate) fn is_stylesheet_link(state: &DriverState, node: NodeId) -> bool {
    state.doc.is_element(node, "link")
        && state.doc.attribute(node, "rel").is_some_and(|rel| {
            let mut stylesheet = false;
            for token in rel.split_ascii_whitespace() {
                if token.eq_ignore_ascii_case("alternate") {
                    return false;
                }
                stylesheet |= token.eq_ignore_ascii_case("stylesheet");
            }
            stylesheet
        })
}

/// Checks whether a script element contains JavaScript.
pub(crate) fn is_javascript(state: &DriverState, node: NodeId) -> bool {
    match state.doc.attribute(node, "type") {
        None => true,
        Some(value) => {
            let value = value.trim().to_ascii_lowercase();
            value.is_empty()
                || value.contains("javascript")
                || value.contains("ecmascript")
                || value == "module"
        }
    }
}

/// A filter processing the document
#[allow(unused_variables)]
pub(crate) trait HtmlFilter: Send {
    /// The filter this implementation stands for
    fn filter(&self) -> Filter;

    /// Decides whether the filter takes part in rewriting this document.
    fn determine_enabled(&mut self, state: &DriverState) -> bool {
        true
    }

    fn start_document(&mut self, ctx: &mut FilterContext<'_>) {}

    fn start_element(&mut self, ctx: &mut FilterContext<'_>, node: NodeId) {}

    fn end_element(&mut self, ctx: &mut FilterContext<'_>, node: NodeId) {}

    fn characters(&mut self, ctx: &mut FilterContext<'_>, node: NodeId) {}

    fn comment(&mut self, ctx: &mut FilterContext<'_>, node: NodeId) {}

    fn cdata(&mut self, ctx: &mut FilterContext<'_>, node: NodeId) {}

    fn directive(&mut self, ctx: &mut FilterContext<'_>, node: NodeId) {}

    /// Called before the document is written out, last chance to start rewrites for this
    /// window.
    fn flush(&mut self, ctx: &mut FilterContext<'_>) {}

    fn end_document(&mut self, ctx: &mut FilterContext<'_>) {}

    /// Called when the document exceeded the size limit, `node` being the first element
    /// beyond the limit. No further events follow.
    fn size_limit_exceeded(&mut self, ctx: &mut FilterContext<'_>, node: NodeId) {}

    /// Puts the outcome of a rewrite into the document. `outcome` is `None` if the rewrite
    /// didn’t complete before the deadline. The default places the rewritten URL into all
    /// slots.
    fn render(
        &mut self,
        ctx: &mut FilterContext<'_>,
        token: usize,
        outcome: Option<&RewriteOutcome>,
        slots: &mut [Slot],
    ) {
        let Some(url) = outcome.and_then(RewriteOutcome::url) else {
            return;
        };
        let value = ctx.document_url(url);
        for slot in slots.iter() {
            slot.render(&mut ctx.doc, &value);
        }
    }
}

/// Creates the filter chain for a set of options, in execution order.
pub(crate) fn create_filters(options: &RewriteOptions) -> Vec<Box<dyn HtmlFilter>> {
    let mut result: Vec<Box<dyn HtmlFilter>> = Vec::new();
    let mut images_added = false;
    for filter in sort_filters(&options.active_filters()) {
        let instance: Box<dyn HtmlFilter> = match filter {
            Filter::RedirectOnSizeLimit => Box::new(redirect_on_size_limit::RedirectFilter),
            Filter::PushPreload => Box::new(push_preload::PushPreloadFilter),
            Filter::ConvertMetaTags => Box::new(meta_tags::MetaTagFilter),
            Filter::AddIds => Box::<add_ids::AddIdsFilter>::default(),
            Filter::CombineCss => Box::new(combine::CombineFilter::css()),
            Filter::CombineJavascript => Box::new(combine::CombineFilter::javascript()),
            Filter::RewriteCss => Box::new(css::CssFilter),
            Filter::RewriteJavascript => Box::new(javascript::JavascriptFilter),
            Filter::InlineCss => Box::new(inline::InlineFilter::css()),
            Filter::InlineJavascript => Box::new(inline::InlineFilter::javascript()),
            Filter::RecompressImages
            | Filter::ResizeImages
            | Filter::ConvertToWebp
            | Filter::InlineImages
            | Filter::InsertImageDimensions => {
                // One filter handles all image options
                if images_added {
                    continue;
                }
                images_added = true;
                Box::<image::ImageFilter>::default()
            }
            Filter::CacheExtendImages => Box::new(cache_extend::CacheExtendFilter),
            Filter::ResponsiveImages => Box::<responsive::ResponsiveFilter>::default(),
            Filter::DeferIframe => Box::<defer_iframe::DeferIframeFilter>::default(),
            Filter::InsertGa => Box::<insert_ga::InsertGaFilter>::default(),
            Filter::CriticalImagesBeacon => Box::new(beacons::BeaconFilter::critical_images()),
            Filter::CriticalCssBeacon => Box::new(beacons::BeaconFilter::critical_css()),
            Filter::SplitHtmlBeacon => Box::new(beacons::BeaconFilter::split_html()),
            Filter::CollectDependencies => {
                Box::<collect_dependencies::CollectDependenciesFilter>::default()
            }
            Filter::SupportNoscript => Box::<support_noscript::NoscriptFilter>::default(),
        };
        result.push(instance);
    }
    result
}
