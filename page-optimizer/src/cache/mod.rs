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

//! Key-value stores backing the metadata cache and the HTTP cache
//!
//! The optimizer only relies on the [`CacheInterface`] contract: last writer wins, values may
//! disappear at any time. [`LruCache`] is a bounded in-memory implementation.

mod http_cache;
mod purge;

pub use http_cache::{
    FindResult, HttpCache, HttpValue, REMEMBER_FETCH_FAILED_TTL_MS, REMEMBER_NOT_CACHEABLE_TTL_MS,
};
pub use purge::PurgeSet;

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::fmt::Debug;
use std::sync::Mutex;

/// Abstract key-value store
#[async_trait]
pub trait CacheInterface: Debug + Send + Sync {
    /// Retrieves a value.
    async fn get(&self, key: &str) -> Option<Bytes>;

    /// Stores a value, replacing any existing value.
    async fn put(&self, key: &str, value: Bytes);

    /// Removes a value.
    async fn delete(&self, key: &str);
}

#[derive(Debug, Default)]
struct LruState {
    entries: HashMap<String, (Bytes, u64)>,
    order: BTreeMap<u64, String>,
    size: usize,
    tick: u64,
}

impl LruState {
    fn touch(&mut self, key: &str) -> Option<Bytes> {
        self.tick += 1;
        let tick = self.tick;
        let (value, last_used) = self.entries.get_mut(key)?;
        self.order.remove(last_used);
        *last_used = tick;
        self.order.insert(tick, key.to_owned());
        Some(value.clone())
    }

    fn remove(&mut self, key: &str) {
        if let Some((value, last_used)) = self.entries.remove(key) {
            self.order.remove(&last_used);
            self.size -= key.len() + value.len();
        }
    }

    fn evict_until(&mut self, max_size: usize) {
        while self.size > max_size {
            let Some((_, key)) = self.order.pop_first() else {
                break;
            };
            if let Some((value, _)) = self.entries.remove(&key) {
                self.size -= key.len() + value.len();
            }
        }
    }
}

/// In-memory cache evicting least recently used entries once the size limit is exceeded
#[derive(Debug)]
pub struct LruCache {
    max_size: usize,
    state: Mutex<LruState>,
}

impl LruCache {
    /// Creates a new cache holding up to `max_size` bytes of keys and values.
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            state: Mutex::new(LruState::default()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, LruState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Number of entries currently stored
    pub fn len(&self) -> usize {
        self.state().entries.len()
    }

    /// Checks whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total size of keys and values currently stored
    pub fn size(&self) -> usize {
        self.state().size
    }
}

#[async_trait]
impl CacheInterface for LruCache {
    async fn get(&self, key: &str) -> Option<Bytes> {
        self.state().touch(key)
    }

    async fn put(&self, key: &str, value: Bytes) {
        let entry_size = key.len() + value.len();
        let mut state = self.state();
        state.remove(key);
        if entry_size > self.max_size {
            return;
        }

        state.tick += 1;
        let tick = state.tick;
        state.entries.insert(key.to_owned(), (value, tick));
        state.order.insert(tick, key.to_owned());
        state.size += entry_size;
        state.evict_until(self.max_size);
    }

    async fn delete(&self, key: &str) {
        self.state().remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;

    #[test(tokio::test)]
    async fn get_put_delete() {
        let cache = LruCache::new(1000);
        assert_eq!(cache.get("a").await, None);
        cache.put("a", Bytes::from_static(b"value")).await;
        assert_eq!(cache.get("a").await, Some(Bytes::from_static(b"value")));
        cache.put("a", Bytes::from_static(b"other")).await;
        assert_eq!(cache.get("a").await, Some(Bytes::from_static(b"other")));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.size(), 6);
        cache.delete("a").await;
        assert_eq!(cache.get("a").await, None);
        assert!(cache.is_empty());
        assert_eq!(cache.size(), 0);
    }

    #[test(tokio::test)]
    async fn eviction() {
        let cache = LruCache::new(30);
        cache.put("k1", Bytes::from(vec![0; 8])).await;
        cache.put("k2", Bytes::from(vec![0; 8])).await;
        cache.put("k3", Bytes::from(vec![0; 8])).await;
        assert_eq!(cache.len(), 3);

        // Using k1 makes k2 the least recently used entry
        assert!(cache.get("k1").await.is_some());
        cache.put("k4", Bytes::from(vec![0; 8])).await;
        assert!(cache.get("k1").await.is_some());
        assert!(cache.get("k2").await.is_none());
        assert!(cache.get("k3").await.is_some());
        assert!(cache.get("k4").await.is_some());
        assert!(cache.size() <= 30);
    }

    #[test(tokio::test)]
    async fn oversized_values_not_stored() {
        let cache = LruCache::new(10);
        cache.put("key", Bytes::from(vec![0; 20])).await;
        assert!(cache.is_empty());
    }
}
