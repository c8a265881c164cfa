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

//! Compile-time catalogue of all filters
//!
//! Every filter is known by its configuration name (e.g. `rewrite_css`) and a short id used in
//! compact representations. Filters declare what they do to the document, whether they inject
//! scripts and which filters they need to run after. [`sort_filters`] produces the order filters
//! are applied in.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};

/// What a filter does to the response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterCategory {
    /// Changes the HTML markup only
    HtmlOnly,
    /// Rewrites subresources referenced by the document
    ResourceRewriting,
    /// Changes response headers
    HeaderMutating,
    /// Coordinates with the browser or with other filters
    Coordination,
}

/// Whether a filter adds JavaScript to the document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptUsage {
    /// Never adds scripts
    NeverInjectsScripts,
    /// Always adds scripts when active, requires the noscript fallback
    WillInjectScripts,
    /// Adds scripts under some conditions only
    MayInjectScripts,
}

/// Where a filter is active
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnabledAt {
    /// Only while rewriting HTML
    HtmlRewrite,
    /// Only when serving rewritten resources
    Fetch,
    /// Both while rewriting HTML and when serving rewritten resources
    Both,
}

macro_rules! define_filters {
    ($(
        $(#[$attr:meta])*
        $variant:ident {
            name: $name:literal,
            id: $id:literal,
            category: $category:ident,
            scripts: $scripts:ident,
            enabled_at: $enabled_at:ident,
            after: [$($after:ident),*],
            core: $core:literal,
        }
    )*) => {
        /// All filters known to the optimizer
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum Filter {
            $(
                $(#[$attr])*
                $variant,
            )*
        }

        impl Filter {
            /// All filters in their default order
            pub const ALL: &'static [Filter] = &[$(Filter::$variant,)*];

            /// Configuration name of the filter
            pub fn name(self) -> &'static str {
                match self {
                    $(Filter::$variant => $name,)*
                }
            }

            /// Short id of the filter
            pub fn id(self) -> &'static str {
                match self {
                    $(Filter::$variant => $id,)*
                }
            }

            /// What the filter does
            pub fn category(self) -> FilterCategory {
                match self {
                    $(Filter::$variant => FilterCategory::$category,)*
                }
            }

            /// Whether the filter adds scripts to the document
            pub fn script_usage(self) -> ScriptUsage {
                match self {
                    $(Filter::$variant => ScriptUsage::$scripts,)*
                }
            }

            /// Where the filter is active
            pub fn enabled_at(self) -> EnabledAt {
                match self {
                    $(Filter::$variant => EnabledAt::$enabled_at,)*
                }
            }

            /// Filters that have to run before this one if enabled
            pub fn runs_after(self) -> &'static [Filter] {
                match self {
                    $(Filter::$variant => &[$(Filter::$after),*],)*
                }
            }

            /// Whether the filter is part of the core filter set
            pub fn is_core(self) -> bool {
                match self {
                    $(Filter::$variant => $core,)*
                }
            }
        }
    };
}

define_filters! {
    /// Aborts rewriting of oversized documents, redirecting scripted browsers to the
    /// unoptimized page
    RedirectOnSizeLimit {
        name: "redirect_on_size_limit",
        id: "rl",
        category: Coordination,
        scripts: MayInjectScripts,
        enabled_at: HtmlRewrite,
        after: [],
        core: false,
    }
    /// Sends preload hints for the dependencies known from previous responses
    PushPreload {
        name: "push_preload",
        id: "hp",
        category: HeaderMutating,
        scripts: NeverInjectsScripts,
        enabled_at: HtmlRewrite,
        after: [],
        core: false,
    }
    /// Copies `<meta http-equiv>` tags into response headers
    ConvertMetaTags {
        name: "convert_meta_tags",
        id: "mc",
        category: HeaderMutating,
        scripts: NeverInjectsScripts,
        enabled_at: HtmlRewrite,
        after: [],
        core: true,
    }
    /// Gives `<div>` elements without an id an id derived from their position
    AddIds {
        name: "add_ids",
        id: "ad",
        category: HtmlOnly,
        scripts: NeverInjectsScripts,
        enabled_at: HtmlRewrite,
        after: [],
        core: false,
    }
    /// Combines adjacent stylesheets
    CombineCss {
        name: "combine_css",
        id: "cc",
        category: ResourceRewriting,
        scripts: NeverInjectsScripts,
        enabled_at: Both,
        after: [],
        core: true,
    }
    /// Minifies stylesheets and rewrites the images they reference
    RewriteCss {
        name: "rewrite_css",
        id: "cf",
        category: ResourceRewriting,
        scripts: NeverInjectsScripts,
        enabled_at: Both,
        after: [CombineCss],
        core: true,
    }
    /// Inlines small stylesheets
    InlineCss {
        name: "inline_css",
        id: "ci",
        category: ResourceRewriting,
        scripts: NeverInjectsScripts,
        enabled_at: HtmlRewrite,
        after: [CombineCss, RewriteCss],
        core: true,
    }
    /// Combines adjacent external scripts
    CombineJavascript {
        name: "combine_javascript",
        id: "jc",
        category: ResourceRewriting,
        scripts: NeverInjectsScripts,
        enabled_at: Both,
        after: [],
        core: true,
    }
    /// Minifies external scripts
    RewriteJavascript {
        name: "rewrite_javascript",
        id: "jm",
        category: ResourceRewriting,
        scripts: NeverInjectsScripts,
        enabled_at: Both,
        after: [CombineJavascript],
        core: true,
    }
    /// Inlines small scripts
    InlineJavascript {
        name: "inline_javascript",
        id: "ji",
        category: ResourceRewriting,
        scripts: NeverInjectsScripts,
        enabled_at: HtmlRewrite,
        after: [CombineJavascript, RewriteJavascript],
        core: true,
    }
    /// Recompresses images
    RecompressImages {
        name: "recompress_images",
        id: "rj",
        category: ResourceRewriting,
        scripts: NeverInjectsScripts,
        enabled_at: Both,
        after: [],
        core: true,
    }
    /// Resizes images to the dimensions they are displayed with
    ResizeImages {
        name: "resize_images",
        id: "ri",
        category: ResourceRewriting,
        scripts: NeverInjectsScripts,
        enabled_at: Both,
        after: [],
        core: true,
    }
    /// Serves WebP images to browsers supporting them
    ConvertToWebp {
        name: "convert_to_webp",
        id: "jw",
        category: ResourceRewriting,
        scripts: NeverInjectsScripts,
        enabled_at: Both,
        after: [],
        core: true,
    }
    /// Inlines small images as `data:` URLs
    InlineImages {
        name: "inline_images",
        id: "ii",
        category: ResourceRewriting,
        scripts: NeverInjectsScripts,
        enabled_at: HtmlRewrite,
        after: [],
        core: true,
    }
    /// Adds `width` and `height` attributes to images
    InsertImageDimensions {
        name: "insert_image_dimensions",
        id: "id",
        category: HtmlOnly,
        scripts: NeverInjectsScripts,
        enabled_at: HtmlRewrite,
        after: [],
        core: false,
    }
    /// Renames images so that they can be cached for a long time
    CacheExtendImages {
        name: "cache_extend_images",
        id: "ei",
        category: ResourceRewriting,
        scripts: NeverInjectsScripts,
        enabled_at: Both,
        after: [RecompressImages, ResizeImages, InlineImages],
        core: true,
    }
    /// Adds `srcset` candidates for high density screens
    ResponsiveImages {
        name: "responsive_images",
        id: "ra",
        category: ResourceRewriting,
        scripts: NeverInjectsScripts,
        enabled_at: HtmlRewrite,
        after: [RecompressImages, ResizeImages, InlineImages],
        core: false,
    }
    /// Delays loading of iframes until the page finished loading
    DeferIframe {
        name: "defer_iframe",
        id: "df",
        category: HtmlOnly,
        scripts: WillInjectScripts,
        enabled_at: HtmlRewrite,
        after: [],
        core: false,
    }
    /// Inserts an analytics snippet unless the page already has one
    InsertGa {
        name: "insert_ga",
        id: "ig",
        category: HtmlOnly,
        scripts: WillInjectScripts,
        enabled_at: HtmlRewrite,
        after: [],
        core: false,
    }
    /// Reports which images are visible without scrolling
    CriticalImagesBeacon {
        name: "critical_images_beacon",
        id: "ib",
        category: Coordination,
        scripts: WillInjectScripts,
        enabled_at: HtmlRewrite,
        after: [RecompressImages, ResizeImages, InlineImages],
        core: false,
    }
    /// Reports which CSS selectors are used without scrolling
    CriticalCssBeacon {
        name: "critical_css_beacon",
        id: "cb",
        category: Coordination,
        scripts: WillInjectScripts,
        enabled_at: HtmlRewrite,
        after: [],
        core: false,
    }
    /// Reports which page panels are visible without scrolling
    SplitHtmlBeacon {
        name: "split_html_beacon",
        id: "sb",
        category: Coordination,
        scripts: WillInjectScripts,
        enabled_at: HtmlRewrite,
        after: [AddIds],
        core: false,
    }
    /// Records the subresources of the document for future preloading
    CollectDependencies {
        name: "collect_dependencies",
        id: "cd",
        category: Coordination,
        scripts: NeverInjectsScripts,
        enabled_at: HtmlRewrite,
        after: [RewriteCss, CombineCss, RewriteJavascript, CombineJavascript],
        core: false,
    }
    /// Provides a fallback for browsers with scripting disabled
    SupportNoscript {
        name: "support_noscript",
        id: "sn",
        category: Coordination,
        scripts: NeverInjectsScripts,
        enabled_at: HtmlRewrite,
        after: [],
        core: false,
    }
}

impl Filter {
    /// Looks up a filter by its configuration name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|filter| filter.name() == name)
    }

    /// Looks up a filter by its short id.
    pub fn from_id(id: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|filter| filter.id() == id)
    }

    /// Image filters that change image URLs and are disabled when image URLs are to be kept
    pub fn changes_image_urls(self) -> bool {
        matches!(
            self,
            Self::InlineImages | Self::CacheExtendImages | Self::ResponsiveImages
        )
    }
}

impl Display for Filter {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Orders the given filters so that every filter comes after the filters it declared in
/// [`Filter::runs_after`]. Filters without ordering constraints between them keep the order of
/// [`Filter::ALL`]. Declared dependencies that aren’t enabled are ignored.
pub fn sort_filters(filters: &BTreeSet<Filter>) -> Vec<Filter> {
    let mut result = Vec::with_capacity(filters.len());
    let mut remaining = Filter::ALL
        .iter()
        .copied()
        .filter(|filter| filters.contains(filter))
        .collect::<Vec<_>>();

    while !remaining.is_empty() {
        let position = remaining
            .iter()
            .position(|filter| {
                filter
                    .runs_after()
                    .iter()
                    .all(|dependency| !remaining.contains(dependency))
            })
            // The catalogue is acyclic, this cannot happen. Keep declaration order if it does.
            .unwrap_or(0);
        result.push(remaining.remove(position));
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup() {
        assert_eq!(Filter::from_name("rewrite_css"), Some(Filter::RewriteCss));
        assert_eq!(Filter::from_id("cf"), Some(Filter::RewriteCss));
        assert_eq!(Filter::from_name("nonexistent"), None);
        assert_eq!(Filter::InlineImages.to_string(), "inline_images");
    }

    #[test]
    fn names_and_ids_unique() {
        let names = Filter::ALL.iter().map(|f| f.name()).collect::<BTreeSet<_>>();
        let ids = Filter::ALL.iter().map(|f| f.id()).collect::<BTreeSet<_>>();
        assert_eq!(names.len(), Filter::ALL.len());
        assert_eq!(ids.len(), Filter::ALL.len());
    }

    #[test]
    fn names_match_serde() {
        for filter in Filter::ALL {
            assert_eq!(
                serde_json::to_string(filter).unwrap(),
                format!("\"{}\"", filter.name())
            );
        }
    }

    #[test]
    fn catalogue_is_acyclic() {
        let all = Filter::ALL.iter().copied().collect::<BTreeSet<_>>();
        let sorted = sort_filters(&all);
        assert_eq!(sorted.len(), Filter::ALL.len());
        for (index, filter) in sorted.iter().enumerate() {
            for dependency in filter.runs_after() {
                let dep_index = sorted.iter().position(|f| f == dependency).unwrap();
                assert!(dep_index < index, "{dependency} has to run before {filter}");
            }
        }
    }

    #[test]
    fn ordering_constraints() {
        let filters = [Filter::InlineCss, Filter::RewriteCss, Filter::CombineCss]
            .into_iter()
            .collect::<BTreeSet<_>>();
        assert_eq!(
            sort_filters(&filters),
            vec![Filter::CombineCss, Filter::RewriteCss, Filter::InlineCss]
        );

        let filters = [Filter::CollectDependencies, Filter::RewriteJavascript]
            .into_iter()
            .collect::<BTreeSet<_>>();
        assert_eq!(
            sort_filters(&filters),
            vec![Filter::RewriteJavascript, Filter::CollectDependencies]
        );
    }
}
