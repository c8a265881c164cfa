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

//! Cache invalidation records

use log::info;
use std::collections::HashMap;
use std::sync::RwLock;

#[derive(Debug, Default)]
struct PurgeState {
    global_ms: i64,
    urls: HashMap<String, i64>,
}

/// Invalidation timestamps: anything cached at or before the timestamp is invalid
#[derive(Debug, Default)]
pub struct PurgeSet {
    state: RwLock<PurgeState>,
}

impl PurgeSet {
    /// Creates an empty purge set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Invalidates everything cached at or before `now_ms`.
    pub fn purge_all(&self, now_ms: i64) {
        info!("Purging all cached entries");
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.global_ms = state.global_ms.max(now_ms);
        // Per-URL records older than the global record are redundant now
        let global_ms = state.global_ms;
        state.urls.retain(|_, time| *time > global_ms);
    }

    /// Invalidates cached entries for a URL stored at or before `now_ms`.
    pub fn purge_url(&self, url: &str, now_ms: i64) {
        info!("Purging cached entries for {url}");
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let time = state.urls.entry(url.to_owned()).or_insert(now_ms);
        *time = (*time).max(now_ms);
    }

    /// Checks whether an entry for `url` cached at `date_ms` is still valid.
    pub fn is_valid(&self, url: &str, date_ms: i64) -> bool {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        if date_ms <= state.global_ms {
            return false;
        }
        state.urls.get(url).map_or(true, |time| date_ms > *time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn purging() {
        let purges = PurgeSet::new();
        assert!(purges.is_valid("http://example.com/a.css", 100));

        purges.purge_url("http://example.com/a.css", 150);
        assert!(!purges.is_valid("http://example.com/a.css", 100));
        assert!(!purges.is_valid("http://example.com/a.css", 150));
        assert!(purges.is_valid("http://example.com/a.css", 151));
        assert!(purges.is_valid("http://example.com/b.css", 100));

        purges.purge_all(200);
        assert!(!purges.is_valid("http://example.com/b.css", 199));
        assert!(purges.is_valid("http://example.com/b.css", 201));
    }
}
