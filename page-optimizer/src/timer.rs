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

//! Wall clock abstraction
//!
//! Cache validity and expiration checks use wall clock milliseconds obtained through the
//! [`Timer`] trait. Deadlines use tokio’s monotonic clock instead, so that tests can control
//! both independently.

use std::fmt::Debug;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Source of wall clock time
pub trait Timer: Debug + Send + Sync {
    /// Current time in milliseconds since the Unix epoch
    fn now_ms(&self) -> i64;
}

/// Timer based on the system clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTimer;

impl Timer for SystemTimer {
    fn now_ms(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |duration| {
                i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
            })
    }
}

/// Timer that only moves when told to
#[derive(Debug, Default)]
pub struct MockTimer {
    now: AtomicI64,
}

impl MockTimer {
    /// An arbitrary but realistic starting point: Fri, 02 Feb 2024 10:00:00 GMT
    pub const START_MS: i64 = 1_706_868_000_000;

    /// Creates a new mock timer set to [`MockTimer::START_MS`].
    pub fn new() -> Self {
        Self::at(Self::START_MS)
    }

    /// Creates a new mock timer set to the given time.
    pub fn at(now_ms: i64) -> Self {
        Self {
            now: AtomicI64::new(now_ms),
        }
    }

    /// Sets the current time.
    pub fn set_time_ms(&self, now_ms: i64) {
        self.now.store(now_ms, Ordering::SeqCst);
    }

    /// Moves the current time forward.
    pub fn advance_ms(&self, delta_ms: i64) {
        self.now.fetch_add(delta_ms, Ordering::SeqCst);
    }
}

impl Timer for MockTimer {
    fn now_ms(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}
