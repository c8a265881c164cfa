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

use super::{FetchError, FetchRequest, FetchResponse, UrlAsyncFetcher};

use async_trait::async_trait;
use log::debug;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Fetcher wrapper bounding the number of concurrent requests per host
///
/// Requests exceeding the limit fail immediately with [`FetchError::Overload`] instead of being
/// queued.
#[derive(Debug)]
pub struct RateControllingFetcher {
    inner: Arc<dyn UrlAsyncFetcher>,
    limit: usize,
    active: Arc<Mutex<HashMap<String, usize>>>,
}

struct Permit {
    host: String,
    active: Arc<Mutex<HashMap<String, usize>>>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(count) = active.get_mut(&self.host) {
            *count -= 1;
            if *count == 0 {
                active.remove(&self.host);
            }
        }
    }
}

impl RateControllingFetcher {
    /// Wraps a fetcher, allowing up to `limit` concurrent requests per host. A limit of zero
    /// disables rate control.
    pub fn new(inner: Arc<dyn UrlAsyncFetcher>, limit: usize) -> Self {
        Self {
            inner,
            limit,
            active: Default::default(),
        }
    }

    fn acquire(&self, host: &str) -> Option<Permit> {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        let count = active.entry(host.to_owned()).or_insert(0);
        if *count >= self.limit {
            return None;
        }
        *count += 1;
        Some(Permit {
            host: host.to_owned(),
            active: self.active.clone(),
        })
    }
}

#[async_trait]
impl UrlAsyncFetcher for RateControllingFetcher {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, FetchError> {
        if self.limit == 0 {
            return self.inner.fetch(request).await;
        }

        let host = request.url.host_str().unwrap_or("").to_owned();
        let Some(_permit) = self.acquire(&host) else {
            debug!("Too many concurrent fetches for {host}, dropping fetch of {}", request.url);
            return Err(FetchError::Overload(host));
        };
        self.inner.fetch(request).await
    }
}
