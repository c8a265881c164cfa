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

//! State shared by all documents and resource requests

use crate::cache::{CacheInterface, HttpCache, LruCache, PurgeSet};
use crate::configuration::RewriteOptions;
use crate::error::Error;
use crate::fetch::{DomainLawyer, RateControllingFetcher, UrlAsyncFetcher};
use crate::image::{ImageOptimizer, PassThroughImageOptimizer};
use crate::property_cache::{MemoryPropertyStore, PropertyStore};
use crate::rewrite::RewriteOutcome;
use crate::statistics::Statistics;
use crate::timer::{SystemTimer, Timer};

use log::debug;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{watch, Semaphore};
use url::Url;

const DEFAULT_CACHE_SIZE: usize = 64 * 1024 * 1024;

pub(crate) type InflightMap = HashMap<String, watch::Receiver<Option<Arc<RewriteOutcome>>>>;

/// Caches, fetcher and counters shared by every rewrite
///
/// A server context is created once and shared between all drivers and resource requests via
/// `Arc`. Everything in it is safe for concurrent use.
#[derive(Debug)]
pub struct ServerContext {
    options: Arc<RewriteOptions>,
    lawyer: DomainLawyer,
    metadata_cache: Arc<dyn CacheInterface>,
    http_cache: HttpCache,
    purges: Arc<PurgeSet>,
    property_store: Arc<dyn PropertyStore>,
    fetcher: Arc<dyn UrlAsyncFetcher>,
    timer: Arc<dyn Timer>,
    statistics: Statistics,
    image_optimizer: Arc<dyn ImageOptimizer>,
    image_permits: Arc<Semaphore>,
    pub(crate) inflight: Mutex<InflightMap>,
}

impl ServerContext {
    /// Starts building a server context for the given options and origin fetcher.
    pub fn builder(
        options: RewriteOptions,
        fetcher: Arc<dyn UrlAsyncFetcher>,
    ) -> ServerContextBuilder {
        ServerContextBuilder {
            options,
            fetcher,
            timer: None,
            metadata_cache: None,
            http_cache: None,
            property_store: None,
            image_optimizer: None,
        }
    }

    /// Global rewriting options
    pub fn options(&self) -> &Arc<RewriteOptions> {
        &self.options
    }

    /// Authorization of resource domains
    pub fn lawyer(&self) -> &DomainLawyer {
        &self.lawyer
    }

    /// Cache holding rewrite results
    pub fn metadata_cache(&self) -> &dyn CacheInterface {
        self.metadata_cache.as_ref()
    }

    /// Cache holding input and output resources
    pub fn http_cache(&self) -> &HttpCache {
        &self.http_cache
    }

    /// Cache invalidation records
    pub fn purges(&self) -> &PurgeSet {
        &self.purges
    }

    /// Per-page persistent properties
    pub fn property_store(&self) -> &dyn PropertyStore {
        self.property_store.as_ref()
    }

    /// Origin fetcher, rate controlled if configured
    pub fn fetcher(&self) -> &dyn UrlAsyncFetcher {
        self.fetcher.as_ref()
    }

    /// Wall clock
    pub fn timer(&self) -> &dyn Timer {
        self.timer.as_ref()
    }

    /// Current wall clock time in milliseconds
    pub fn now_ms(&self) -> i64 {
        self.timer.now_ms()
    }

    /// Process-wide counters
    pub fn statistics(&self) -> &Statistics {
        &self.statistics
    }

    /// Image codec
    pub fn image_optimizer(&self) -> &dyn ImageOptimizer {
        self.image_optimizer.as_ref()
    }

    pub(crate) fn image_permits(&self) -> &Arc<Semaphore> {
        &self.image_permits
    }

    /// Invalidates everything cached so far.
    pub fn purge_all(&self) {
        self.purges.purge_all(self.now_ms());
    }

    /// Invalidates cached data for one URL.
    pub fn purge_url(&self, url: &Url) {
        self.purges.purge_url(url.as_str(), self.now_ms());
    }

    /// Number of rewrites currently running
    pub fn inflight_rewrites(&self) -> usize {
        self.inflight.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Produces the property store key of a document.
pub(crate) fn page_key(options: &RewriteOptions, url: &Url) -> String {
    if options.cache_fragment.is_empty() {
        url.to_string()
    } else {
        format!("{}/{url}", options.cache_fragment)
    }
}

/// Builder for [`ServerContext`]
///
/// Anything not set explicitly gets an in-memory default.
#[derive(Debug)]
pub struct ServerContextBuilder {
    options: RewriteOptions,
    fetcher: Arc<dyn UrlAsyncFetcher>,
    timer: Option<Arc<dyn Timer>>,
    metadata_cache: Option<Arc<dyn CacheInterface>>,
    http_cache: Option<Arc<dyn CacheInterface>>,
    property_store: Option<Arc<dyn PropertyStore>>,
    image_optimizer: Option<Arc<dyn ImageOptimizer>>,
}

impl ServerContextBuilder {
    /// Sets the wall clock.
    pub fn timer(mut self, timer: Arc<dyn Timer>) -> Self {
        self.timer = Some(timer);
        self
    }

    /// Sets the backend of the metadata cache.
    pub fn metadata_cache(mut self, cache: Arc<dyn CacheInterface>) -> Self {
        self.metadata_cache = Some(cache);
        self
    }

    /// Sets the backend of the HTTP cache.
    pub fn http_cache(mut self, cache: Arc<dyn CacheInterface>) -> Self {
        self.http_cache = Some(cache);
        self
    }

    /// Sets the property store.
    pub fn property_store(mut self, store: Arc<dyn PropertyStore>) -> Self {
        self.property_store = Some(store);
        self
    }

    /// Sets the image codec.
    pub fn image_optimizer(mut self, optimizer: Arc<dyn ImageOptimizer>) -> Self {
        self.image_optimizer = Some(optimizer);
        self
    }

    /// Validates the options and creates the server context.
    pub fn build(self) -> Result<Arc<ServerContext>, Error> {
        self.options.validate()?;
        let lawyer = DomainLawyer::new(&self.options.domains)?;

        let timer = self.timer.unwrap_or_else(|| Arc::new(SystemTimer));
        let purges = Arc::new(PurgeSet::new());
        let http_backend = self
            .http_cache
            .unwrap_or_else(|| Arc::new(LruCache::new(DEFAULT_CACHE_SIZE)));
        let http_cache = HttpCache::new(http_backend, timer.clone(), purges.clone());

        let fetcher: Arc<dyn UrlAsyncFetcher> = if self.options.per_host_fetch_limit > 0 {
            Arc::new(RateControllingFetcher::new(
                self.fetcher,
                self.options.per_host_fetch_limit,
            ))
        } else {
            self.fetcher
        };

        let image_permits = Arc::new(Semaphore::new(self.options.image_max_rewrites_at_once));
        debug!(
            "Creating server context, active filters: {:?}",
            self.options.active_filters()
        );

        Ok(Arc::new(ServerContext {
            options: Arc::new(self.options),
            lawyer,
            metadata_cache: self
                .metadata_cache
                .unwrap_or_else(|| Arc::new(LruCache::new(DEFAULT_CACHE_SIZE))),
            http_cache,
            purges,
            property_store: self
                .property_store
                .unwrap_or_else(|| Arc::new(MemoryPropertyStore::new())),
            fetcher,
            timer,
            statistics: Statistics::new(),
            image_optimizer: self
                .image_optimizer
                .unwrap_or_else(|| Arc::new(PassThroughImageOptimizer)),
            image_permits,
            inflight: Mutex::new(HashMap::new()),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockUrlFetcher;

    #[test]
    fn invalid_options_rejected() {
        let options = RewriteOptions {
            domains: vec![":80".to_owned()],
            ..Default::default()
        };
        assert!(ServerContext::builder(options, Arc::new(MockUrlFetcher::new()))
            .build()
            .is_err());
    }

    #[test]
    fn page_keys() {
        let url = Url::parse("http://example.com/index.html").unwrap();
        let mut options = RewriteOptions::default();
        assert_eq!(page_key(&options, &url), "http://example.com/index.html");
        options.cache_fragment = "shard".to_owned();
        assert_eq!(page_key(&options, &url), "shard/http://example.com/index.html");
    }
}
