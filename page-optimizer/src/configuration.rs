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

//! Rewriting options, their YAML representation and command line overrides

use crate::error::Error;
use crate::hasher::hash_bytes;
use crate::registry::{Filter, ScriptUsage};

use clap::{Parser, ValueEnum};
use http::HeaderMap;
use log::{trace, warn};
use percent_encoding::percent_decode_str;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt::Debug;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::OnceLock;
use url::Url;

/// Loading configuration from YAML
pub trait FromYaml {
    /// Loads configuration from a YAML file.
    fn load_from_yaml<P>(path: P) -> Result<Self, Error>
    where
        P: AsRef<Path>,
        Self: Sized;

    /// Loads configuration from a YAML string.
    fn from_yaml<S>(yaml_conf: S) -> Result<Self, Error>
    where
        S: AsRef<str>,
        Self: Sized;

    /// Loads configuration from multiple YAML files. Top-level settings in later files override
    /// the same settings in earlier files.
    fn load_from_files<P>(paths: &[P]) -> Result<Self, Error>
    where
        P: AsRef<Path>,
        Self: Sized;
}

impl<D> FromYaml for D
where
    D: DeserializeOwned + Debug + Default,
{
    fn load_from_yaml<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let file = File::open(path.as_ref()).map_err(|source| Error::ConfigOpen {
            path: path.as_ref().to_path_buf(),
            source,
        })?;
        let reader = BufReader::new(file);

        let conf = serde_yaml::from_reader(reader)?;
        trace!("Loaded configuration file: {conf:#?}");

        Ok(conf)
    }

    fn from_yaml<S: AsRef<str>>(yaml_conf: S) -> Result<Self, Error> {
        let conf = serde_yaml::from_str(yaml_conf.as_ref())?;
        trace!("Loaded configuration: {conf:#?}");
        Ok(conf)
    }

    fn load_from_files<P: AsRef<Path>>(paths: &[P]) -> Result<Self, Error> {
        let mut merged = serde_yaml::Mapping::new();
        for path in paths {
            let file = File::open(path.as_ref()).map_err(|source| Error::ConfigOpen {
                path: path.as_ref().to_path_buf(),
                source,
            })?;
            match serde_yaml::from_reader(BufReader::new(file))? {
                serde_yaml::Value::Mapping(mapping) => {
                    for (key, value) in mapping {
                        merged.insert(key, value);
                    }
                }
                serde_yaml::Value::Null => {}
                _ => {
                    return Err(Error::InvalidConfig(format!(
                        "{:?} does not contain a mapping",
                        path.as_ref()
                    )))
                }
            }
        }

        if merged.is_empty() {
            return Ok(Self::default());
        }

        let conf = serde_yaml::from_value(serde_yaml::Value::Mapping(merged))?;
        trace!("Loaded configuration files: {conf:#?}");
        Ok(conf)
    }
}

/// Base set of filters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum RewriteLevel {
    /// Only explicitly enabled filters are active
    #[default]
    PassThrough,
    /// Core filters are active unless disabled explicitly
    CoreFilters,
}

/// HTTP method used to purge rewritten pages from downstream caches
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PurgeMethod {
    /// `GET` request
    #[default]
    Get,
    /// `PURGE` request
    Purge,
}

impl PurgeMethod {
    /// HTTP method name
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Purge => "PURGE",
        }
    }
}

/// Which deadline applies to rewrites nested in other rewrites
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NestedDeadlinePolicy {
    /// The outer rewrite waits for all nested rewrites, only the outer deadline applies
    #[default]
    Parent,
    /// Each nested rewrite has its own deadline, nested rewrites exceeding it keep their
    /// original URL in the outer resource
    Child,
}

/// Request headers that rewritten resources may depend on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AllowVaryOn {
    auto: bool,
    accept: bool,
    user_agent: bool,
    save_data: bool,
}

impl Default for AllowVaryOn {
    fn default() -> Self {
        Self {
            auto: true,
            accept: false,
            user_agent: false,
            save_data: false,
        }
    }
}

impl TryFrom<&str> for AllowVaryOn {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let mut result = Self {
            auto: false,
            accept: false,
            user_agent: false,
            save_data: false,
        };

        match value.trim().to_ascii_lowercase().as_str() {
            "auto" => result.auto = true,
            "none" | "" => {}
            list => {
                for entry in list.split(',').map(str::trim) {
                    match entry {
                        "accept" => result.accept = true,
                        "user-agent" => result.user_agent = true,
                        "save-data" => result.save_data = true,
                        other => return Err(format!("unsupported Vary header {other}")),
                    }
                }
            }
        }
        Ok(result)
    }
}

impl TryFrom<String> for AllowVaryOn {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.as_str().try_into()
    }
}

impl From<AllowVaryOn> for String {
    fn from(value: AllowVaryOn) -> Self {
        if value.auto {
            return "Auto".to_owned();
        }
        let mut list = Vec::new();
        if value.accept {
            list.push("Accept");
        }
        if value.user_agent {
            list.push("User-Agent");
        }
        if value.save_data {
            list.push("Save-Data");
        }
        if list.is_empty() {
            "None".to_owned()
        } else {
            list.join(",")
        }
    }
}

impl AllowVaryOn {
    /// Whether output may depend on the `Accept` header
    pub fn allows_accept(&self) -> bool {
        self.auto || self.accept
    }

    /// Whether output may depend on the `User-Agent` header
    pub fn allows_user_agent(&self) -> bool {
        self.user_agent
    }

    /// Whether output may depend on the `Save-Data` header
    pub fn allows_save_data(&self) -> bool {
        self.auto || self.save_data
    }
}

/// Rewriting options
///
/// Options are immutable once attached to a driver. Fields documented as affecting the output
/// contribute to [`RewriteOptions::signature`] which is part of all metadata cache keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RewriteOptions {
    /// Base set of filters (affects output)
    pub rewrite_level: RewriteLevel,

    /// Filters enabled in addition to the base set (affects output)
    pub enabled_filters: BTreeSet<Filter>,

    /// Filters disabled even if part of the base set (affects output)
    pub disabled_filters: BTreeSet<Filter>,

    /// Domains other than the document’s own that resources may be rewritten from, e.g.
    /// `cdn.example.com`, `*.example.com` or `https://static.example.com`
    pub domains: Vec<String>,

    /// Stylesheets smaller than this are inlined (affects output)
    pub css_inline_max_bytes: i64,

    /// Scripts smaller than this are inlined (affects output)
    pub js_inline_max_bytes: i64,

    /// Images smaller than this are inlined (affects output)
    pub image_inline_max_bytes: i64,

    /// Keep image URLs unchanged, disables filters renaming or inlining images (affects output)
    pub image_preserve_urls: bool,

    /// JPEG quality, `image_recompress_quality` if not set (affects output)
    pub image_jpeg_quality: Option<u8>,

    /// WebP quality (affects output)
    pub image_webp_quality: u8,

    /// Default quality for recompressed images (affects output)
    pub image_recompress_quality: u8,

    /// JPEG quality for requests with `Save-Data: on`, JPEG quality if not set (affects
    /// output)
    pub image_jpeg_quality_for_save_data: Option<u8>,

    /// Maximal number of image rewrites running in parallel, further rewrites are dropped
    pub image_max_rewrites_at_once: usize,

    /// Documents larger than this are no longer rewritten, negative for no limit
    pub max_html_parse_bytes: i64,

    /// Method for downstream cache purge requests
    pub downstream_cache_purge_method: PurgeMethod,

    /// Downstream cache purge requests go to this prefix followed by the page path, no purging
    /// if empty
    pub downstream_cache_purge_location_prefix: String,

    /// Pages with a smaller percentage of rewrites completed in time are purged from the
    /// downstream cache
    pub downstream_cache_rewritten_percentage_threshold: u8,

    /// Request headers rewritten resources may depend on (affects output)
    pub allow_vary_on: AllowVaryOn,

    /// Percentage of uncached rewrites to skip
    pub rewrite_random_drop_percentage: u8,

    /// Optimize resources requested under their original URLs
    pub in_place_rewriting_enabled: bool,

    /// With preserved image URLs, optimize images referenced by documents for in-place serving
    pub in_place_preemptive_rewrite_images: bool,

    /// Don’t rename images that are small enough to be inlined but weren’t (affects output)
    pub cache_small_images_unrewritten: bool,

    /// Analytics id for `insert_ga`
    pub ga_id: String,

    /// Use the `analytics.js` snippet rather than `ga.js`
    pub use_analytics_js: bool,

    /// Add speed tracking to the inserted analytics snippet
    pub increase_speed_tracking: bool,

    /// Pixel densities `responsive_images` produces candidates for (affects output)
    pub responsive_image_densities: Vec<f64>,

    /// Time rewrites may take before a document flush proceeds without them
    pub rewrite_deadline_ms: u64,

    /// Time an input resource fetch may take
    pub fetch_deadline_ms: u64,

    /// Time cached results remain usable after their inputs expired
    pub metadata_cache_staleness_threshold_ms: i64,

    /// Deadline handling for nested rewrites
    pub nested_deadline_policy: NestedDeadlinePolicy,

    /// Maximal length of rewritten URLs (affects output)
    pub max_url_size: usize,

    /// Maximal length of a rewritten URL’s path segment (affects output)
    pub max_url_segment_size: usize,

    /// Maximal size of combined stylesheets, negative for no limit (affects output)
    pub max_combined_css_bytes: i64,

    /// Maximal size of combined scripts, negative for no limit (affects output)
    pub max_combined_js_bytes: i64,

    /// Freshness lifetime of resources without caching headers
    pub implicit_cache_ttl_ms: i64,

    /// Time before a beacon is injected again if no beacon response was received
    pub beacon_reinstrument_time_sec: i64,

    /// Cache key prefix, allows sharing caches between hosts (affects output)
    pub cache_fragment: String,

    /// Add a canonical link to rewritten resources pointing to the original
    pub add_canonical_link: bool,

    /// Mark optimized images `Cache-Control: no-transform`
    pub no_transform_optimized_images: bool,

    /// Don’t rewrite resources with `Cache-Control: no-transform`
    pub respect_no_transform: bool,

    /// Maximal number of concurrent fetches per origin host, zero for no limit
    pub per_host_fetch_limit: usize,

    #[serde(skip)]
    pub(crate) signature: OnceLock<String>,
}

impl Default for RewriteOptions {
    fn default() -> Self {
        Self {
            rewrite_level: RewriteLevel::default(),
            enabled_filters: BTreeSet::new(),
            disabled_filters: BTreeSet::new(),
            domains: Vec::new(),
            css_inline_max_bytes: 2048,
            js_inline_max_bytes: 2048,
            image_inline_max_bytes: 3072,
            image_preserve_urls: false,
            image_jpeg_quality: None,
            image_webp_quality: 80,
            image_recompress_quality: 85,
            image_jpeg_quality_for_save_data: None,
            image_max_rewrites_at_once: 8,
            max_html_parse_bytes: -1,
            downstream_cache_purge_method: PurgeMethod::default(),
            downstream_cache_purge_location_prefix: String::new(),
            downstream_cache_rewritten_percentage_threshold: 95,
            allow_vary_on: AllowVaryOn::default(),
            rewrite_random_drop_percentage: 0,
            in_place_rewriting_enabled: false,
            in_place_preemptive_rewrite_images: true,
            cache_small_images_unrewritten: false,
            ga_id: String::new(),
            use_analytics_js: true,
            increase_speed_tracking: true,
            responsive_image_densities: vec![1.5, 2.0, 4.0],
            rewrite_deadline_ms: 10,
            fetch_deadline_ms: 5000,
            metadata_cache_staleness_threshold_ms: 0,
            nested_deadline_policy: NestedDeadlinePolicy::default(),
            max_url_size: 2083,
            max_url_segment_size: 1024,
            max_combined_css_bytes: -1,
            max_combined_js_bytes: 92160,
            implicit_cache_ttl_ms: 300_000,
            beacon_reinstrument_time_sec: 5,
            cache_fragment: String::new(),
            add_canonical_link: false,
            no_transform_optimized_images: false,
            respect_no_transform: true,
            per_host_fetch_limit: 0,
            signature: OnceLock::new(),
        }
    }
}

/// The option values that change rewriting results
#[derive(Serialize)]
struct SignatureFields<'a> {
    filters: Vec<&'static str>,
    css_inline_max_bytes: i64,
    js_inline_max_bytes: i64,
    image_inline_max_bytes: i64,
    image_preserve_urls: bool,
    image_jpeg_quality: u8,
    image_webp_quality: u8,
    image_jpeg_quality_for_save_data: u8,
    allow_vary_on: String,
    cache_small_images_unrewritten: bool,
    responsive_image_densities: &'a [f64],
    max_url_size: usize,
    max_url_segment_size: usize,
    max_combined_css_bytes: i64,
    max_combined_js_bytes: i64,
    cache_fragment: &'a str,
}

fn parse_filter(name: &str) -> Result<Filter, String> {
    Filter::from_name(name).ok_or_else(|| format!("unknown filter {name}"))
}

/// Command line options overriding rewriting options
#[derive(Debug, Default, Parser)]
pub struct RewriteOpt {
    /// Base set of filters
    #[clap(long, value_enum)]
    pub rewrite_level: Option<RewriteLevel>,

    /// Comma-separated list of filters to enable
    #[clap(long, value_delimiter = ',', value_parser = parse_filter)]
    pub enable_filters: Vec<Filter>,

    /// Comma-separated list of filters to disable
    #[clap(long, value_delimiter = ',', value_parser = parse_filter)]
    pub disable_filters: Vec<Filter>,

    /// Additional domain to rewrite resources from (can be specified multiple times)
    #[clap(long)]
    pub domain: Vec<String>,

    /// Time in milliseconds rewrites may take before a flush proceeds without them
    #[clap(long)]
    pub rewrite_deadline_ms: Option<u64>,

    /// Images smaller than this many bytes are inlined
    #[clap(long)]
    pub image_inline_max_bytes: Option<i64>,

    /// Stylesheets smaller than this many bytes are inlined
    #[clap(long)]
    pub css_inline_max_bytes: Option<i64>,

    /// Scripts smaller than this many bytes are inlined
    #[clap(long)]
    pub js_inline_max_bytes: Option<i64>,

    /// Documents larger than this many bytes aren’t rewritten
    #[clap(long)]
    pub max_html_parse_bytes: Option<i64>,

    /// Analytics id to insert
    #[clap(long)]
    pub ga_id: Option<String>,
}

impl RewriteOptions {
    /// Merges the command line options into the current configuration. Any command line options
    /// present overwrite existing settings.
    pub fn merge_with_opt(&mut self, opt: RewriteOpt) {
        if let Some(rewrite_level) = opt.rewrite_level {
            self.rewrite_level = rewrite_level;
        }

        for filter in opt.enable_filters {
            self.disabled_filters.remove(&filter);
            self.enabled_filters.insert(filter);
        }

        for filter in opt.disable_filters {
            self.enabled_filters.remove(&filter);
            self.disabled_filters.insert(filter);
        }

        self.domains.extend(opt.domain);

        if let Some(value) = opt.rewrite_deadline_ms {
            self.rewrite_deadline_ms = value;
        }
        if let Some(value) = opt.image_inline_max_bytes {
            self.image_inline_max_bytes = value;
        }
        if let Some(value) = opt.css_inline_max_bytes {
            self.css_inline_max_bytes = value;
        }
        if let Some(value) = opt.js_inline_max_bytes {
            self.js_inline_max_bytes = value;
        }
        if let Some(value) = opt.max_html_parse_bytes {
            self.max_html_parse_bytes = value;
        }
        if let Some(value) = opt.ga_id {
            self.ga_id = value;
        }

        self.signature = OnceLock::new();
    }

    /// Checks option values for consistency.
    pub fn validate(&self) -> Result<(), Error> {
        let qualities = [
            ("image_jpeg_quality", self.image_jpeg_quality),
            ("image_webp_quality", Some(self.image_webp_quality)),
            ("image_recompress_quality", Some(self.image_recompress_quality)),
            (
                "image_jpeg_quality_for_save_data",
                self.image_jpeg_quality_for_save_data,
            ),
        ];
        for (name, quality) in qualities {
            if quality.is_some_and(|quality| !(1..=100).contains(&quality)) {
                return Err(Error::InvalidConfig(format!(
                    "{name} has to be between 1 and 100"
                )));
            }
        }

        for (name, percentage) in [
            (
                "downstream_cache_rewritten_percentage_threshold",
                self.downstream_cache_rewritten_percentage_threshold,
            ),
            (
                "rewrite_random_drop_percentage",
                self.rewrite_random_drop_percentage,
            ),
        ] {
            if percentage > 100 {
                return Err(Error::InvalidConfig(format!(
                    "{name} has to be between 0 and 100"
                )));
            }
        }

        if self
            .responsive_image_densities
            .iter()
            .any(|density| !density.is_finite() || *density <= 0.0)
        {
            return Err(Error::InvalidConfig(
                "responsive_image_densities have to be positive numbers".to_owned(),
            ));
        }

        if self.image_max_rewrites_at_once == 0 {
            return Err(Error::InvalidConfig(
                "image_max_rewrites_at_once cannot be zero".to_owned(),
            ));
        }

        if self.in_place_rewriting_enabled && self.cache_fragment.contains('/') {
            return Err(Error::InvalidConfig(
                "cache_fragment cannot contain slashes".to_owned(),
            ));
        }

        Ok(())
    }

    /// Checks whether a filter is active.
    pub fn is_enabled(&self, filter: Filter) -> bool {
        if self.disabled_filters.contains(&filter) {
            return false;
        }
        if self.image_preserve_urls && filter.changes_image_urls() {
            return false;
        }
        self.enabled_filters.contains(&filter)
            || (self.rewrite_level == RewriteLevel::CoreFilters && filter.is_core())
    }

    /// All active filters
    pub fn active_filters(&self) -> BTreeSet<Filter> {
        Filter::ALL
            .iter()
            .copied()
            .filter(|filter| self.is_enabled(*filter))
            .collect()
    }

    /// Checks whether any active filter injects scripts.
    pub fn injects_scripts(&self) -> bool {
        self.active_filters()
            .into_iter()
            .any(|filter| filter.script_usage() != ScriptUsage::NeverInjectsScripts)
    }

    /// JPEG quality to be used, depending on whether the client asked to save data
    pub fn jpeg_quality(&self, save_data: bool) -> u8 {
        let quality = self
            .image_jpeg_quality
            .unwrap_or(self.image_recompress_quality);
        if save_data {
            self.image_jpeg_quality_for_save_data.unwrap_or(quality)
        } else {
            quality
        }
    }

    /// Fingerprint of all options affecting rewriting results. Computed once.
    pub fn signature(&self) -> &str {
        self.signature.get_or_init(|| {
            let fields = SignatureFields {
                filters: self.active_filters().into_iter().map(Filter::id).collect(),
                css_inline_max_bytes: self.css_inline_max_bytes,
                js_inline_max_bytes: self.js_inline_max_bytes,
                image_inline_max_bytes: self.image_inline_max_bytes,
                image_preserve_urls: self.image_preserve_urls,
                image_jpeg_quality: self.jpeg_quality(false),
                image_webp_quality: self.image_webp_quality,
                image_jpeg_quality_for_save_data: self.jpeg_quality(true),
                allow_vary_on: self.allow_vary_on.into(),
                cache_small_images_unrewritten: self.cache_small_images_unrewritten,
                responsive_image_densities: &self.responsive_image_densities,
                max_url_size: self.max_url_size,
                max_url_segment_size: self.max_url_segment_size,
                max_combined_css_bytes: self.max_combined_css_bytes,
                max_combined_js_bytes: self.max_combined_js_bytes,
                cache_fragment: &self.cache_fragment,
            };
            let serialized = serde_json::to_vec(&fields).unwrap_or_default();
            hash_bytes(&serialized)
        })
    }

    /// Produces the options for a request, applying query parameter and header overrides.
    pub fn with_overrides(&self, overrides: &RequestOptions) -> Self {
        let mut options = self.clone();
        if let Some(filters) = &overrides.filters {
            options.rewrite_level = RewriteLevel::PassThrough;
            options.enabled_filters = filters.clone();
        }
        for filter in &overrides.enable {
            options.disabled_filters.remove(filter);
            options.enabled_filters.insert(*filter);
        }
        for filter in &overrides.disable {
            options.enabled_filters.remove(filter);
            options.disabled_filters.insert(*filter);
        }
        options.signature = OnceLock::new();
        options
    }
}

/// Per-request option overrides from query parameters (`PageSpeed=off`,
/// `PageSpeedFilters=+inline_css,-rewrite_css`) and request headers of the same name.
/// The legacy `ModPagespeed` prefix is accepted as well.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestOptions {
    /// Rewriting turned off for this request
    pub disabled: bool,
    /// The client has no scripting support, script-injecting filters are turned off
    pub noscript: bool,
    /// Explicit filter list replacing the configured one
    pub filters: Option<BTreeSet<Filter>>,
    /// Filters to enable additionally
    pub enable: BTreeSet<Filter>,
    /// Filters to disable
    pub disable: BTreeSet<Filter>,
}

impl RequestOptions {
    const PREFIXES: [&'static str; 2] = ["PageSpeed", "ModPagespeed"];

    fn apply(&mut self, name: &str, value: &str) -> bool {
        let Some(suffix) = Self::PREFIXES
            .iter()
            .find_map(|prefix| name.strip_prefix(prefix))
        else {
            return false;
        };

        match suffix {
            "" => match value.trim().to_ascii_lowercase().as_str() {
                "off" => self.disabled = true,
                "noscript" => self.noscript = true,
                "on" => {}
                other => warn!("Ignoring unsupported {name} value {other}"),
            },
            "Filters" => {
                for entry in value.split(',').map(str::trim).filter(|e| !e.is_empty()) {
                    let (target, name) = if let Some(name) = entry.strip_prefix('+') {
                        (&mut self.enable, name)
                    } else if let Some(name) = entry.strip_prefix('-') {
                        (&mut self.disable, name)
                    } else {
                        (self.filters.get_or_insert_with(BTreeSet::new), entry)
                    };
                    match Filter::from_name(name) {
                        Some(filter) => {
                            target.insert(filter);
                        }
                        None => warn!("Ignoring unknown filter {name} in request"),
                    }
                }
            }
            _ => return false,
        }
        true
    }

    /// Extracts overrides from the request. Returns the overrides and the URL with the
    /// override parameters removed.
    pub fn from_request(url: &Url, headers: &HeaderMap) -> (Self, Url) {
        let mut result = Self::default();

        for (name, value) in headers {
            if let Ok(value) = value.to_str() {
                // Header names are case-insensitive, normalize to the query parameter spelling
                let name = match name.as_str() {
                    "pagespeed" => "PageSpeed",
                    "pagespeedfilters" => "PageSpeedFilters",
                    "modpagespeed" => "ModPagespeed",
                    "modpagespeedfilters" => "ModPagespeedFilters",
                    _ => continue,
                };
                result.apply(name, value);
            }
        }

        let mut clean_url = url.clone();
        if let Some(query) = url.query() {
            // Parsing manually, `+` has to stay a plus sign in filter lists
            let mut kept = Vec::new();
            let mut stripped = false;
            for pair in query.split('&') {
                let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
                let name = percent_decode_str(name).decode_utf8_lossy();
                let value = percent_decode_str(value).decode_utf8_lossy();
                if result.apply(&name, &value) {
                    stripped = true;
                } else {
                    kept.push(pair);
                }
            }

            if stripped {
                if kept.is_empty() {
                    clean_url.set_query(None);
                } else {
                    clean_url.set_query(Some(&kept.join("&")));
                }
            }
        }

        (result, clean_url)
    }

    /// Checks whether any override is present.
    pub fn is_empty(&self) -> bool {
        self.filters.is_none() && self.enable.is_empty() && self.disable.is_empty()
    }
}
