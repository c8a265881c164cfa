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

//! Process-wide counters

use std::sync::atomic::{AtomicU64, Ordering};

macro_rules! define_stats {
    ($($(#[$attr:meta])* $variant:ident => $name:literal,)*) => {
        /// Names of the counters kept by [`Statistics`]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Stat {
            $(
                $(#[$attr])*
                $variant,
            )*
        }

        impl Stat {
            /// All known counters
            pub const ALL: &'static [Stat] = &[$(Stat::$variant,)*];

            /// Name under which the counter is reported
            pub fn name(self) -> &'static str {
                match self {
                    $(Stat::$variant => $name,)*
                }
            }
        }
    };
}

define_stats! {
    /// Rewrite contexts that ran a filter transform
    RewritesExecuted => "num_rewrites_executed",
    /// Rewrite contexts initiated by HTML filters
    RewritesInitiated => "num_rewrites_initiated",
    /// Rewrite contexts attached to an identical running context
    RewritesDeduplicated => "num_rewrites_deduplicated",
    /// Rewrite contexts not rendered because the deadline passed
    RewritesAbandoned => "num_rewrites_abandoned",
    /// Rewrite contexts that weren’t rendered because their elements went away
    RewritesCancelled => "num_rewrites_cancelled",
    /// Rewrite contexts dropped due to load
    RewritesDroppedOverload => "num_rewrites_dropped_overload",
    /// Rewrite contexts dropped randomly
    RewritesDroppedRandomly => "num_rewrites_dropped_randomly",
    /// Metadata cache lookups producing a valid result
    CachedOutputHits => "cached_output_hits",
    /// Metadata cache lookups without a usable result
    CachedOutputMisses => "cached_output_misses",
    /// Metadata cache results served despite expired inputs
    CachedOutputStaleHits => "cached_output_stale_hits",
    /// Metadata cache results rejected because of purges or expiration
    CachedOutputInvalid => "cached_output_invalid",
    /// Input resources taken from the HTTP cache
    ResourceCacheHits => "resource_cache_hits",
    /// Input resources fetched from the origin
    ResourceFetches => "resource_fetches",
    /// Input resource fetches that failed
    ResourceFetchFailures => "resource_fetch_failures",
    /// Requests for rewritten resources
    ResourceRequests => "resource_requests",
    /// Requests for rewritten resources with an undecodable URL
    CorruptUrlFetches => "corrupt_url_fetches",
    /// Requests for rewritten resources answered with a different hash
    HashMismatchFetches => "hash_mismatch_fetches",
    /// Requests for rewritten resources answered with the original content
    FallbackResponses => "fallback_responses_served",
    /// Resources inlined into the document
    ResourcesInlined => "resources_inlined",
    /// Resources combined into a single one
    ResourcesCombined => "resources_combined",
    /// Analytics snippets inserted
    AnalyticsSnippetsInserted => "analytics_snippets_inserted",
    /// Downstream cache purge requests issued
    DownstreamCachePurgeAttempts => "downstream_cache_purge_attempts",
    /// Documents exceeding the HTML size limit
    HtmlSizeLimitExceeded => "html_size_limit_exceeded",
    /// Beacons accepted
    BeaconsReceived => "beacons_received",
    /// Beacons rejected due to an unknown nonce
    BeaconsRejected => "beacons_rejected",
    /// Response header changes dropped because the headers were already sent
    HeaderChangesDropped => "header_changes_dropped",
}

/// Atomic counters shared by all drivers of a server context
#[derive(Debug)]
pub struct Statistics {
    counters: Vec<AtomicU64>,
}

impl Default for Statistics {
    fn default() -> Self {
        Self {
            counters: Stat::ALL.iter().map(|_| AtomicU64::new(0)).collect(),
        }
    }
}

impl Statistics {
    /// Creates a new set of counters, all set to zero.
    pub fn new() -> Self {
        Self::default()
    }

    fn counter(&self, stat: Stat) -> &AtomicU64 {
        &self.counters[stat as usize]
    }

    /// Increments a counter by one.
    pub fn increment(&self, stat: Stat) {
        self.add(stat, 1);
    }

    /// Increments a counter by the given amount.
    pub fn add(&self, stat: Stat, value: u64) {
        self.counter(stat).fetch_add(value, Ordering::Relaxed);
    }

    /// Returns the current value of a counter.
    pub fn get(&self, stat: Stat) -> u64 {
        self.counter(stat).load(Ordering::Relaxed)
    }

    /// Returns the current values of all counters, sorted by name.
    pub fn snapshot(&self) -> Vec<(&'static str, u64)> {
        let mut result = Stat::ALL
            .iter()
            .map(|stat| (stat.name(), self.get(*stat)))
            .collect::<Vec<_>>();
        result.sort_unstable();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counting() {
        let stats = Statistics::new();
        stats.increment(Stat::CachedOutputHits);
        stats.add(Stat::CachedOutputHits, 2);
        stats.increment(Stat::ResourceFetches);
        assert_eq!(stats.get(Stat::CachedOutputHits), 3);
        assert_eq!(stats.get(Stat::ResourceFetches), 1);
        assert_eq!(stats.get(Stat::CachedOutputMisses), 0);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.len(), Stat::ALL.len());
        assert!(snapshot.contains(&("cached_output_hits", 3)));
        assert!(snapshot.windows(2).all(|pair| pair[0].0 < pair[1].0));
    }
}
