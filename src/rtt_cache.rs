// Copyright (c) 2023 The TQUIC Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Bounded cache of recent RTT samples for external telemetry.
//!
//! The cache is written from the acknowledgment path and polled by
//! instrumentation running on other threads. Handles are cheap to clone and
//! all clones observe the same samples.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use parking_lot::RwLock;

/// Maximum number of samples kept by the cache.
pub const RTT_CACHE_CAPACITY: usize = 10;

/// A timestamped RTT sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RttSample {
    /// Time at which the sample was recorded.
    pub time: Instant,

    /// Round trip time.
    pub rtt: Duration,
}

/// Shared handle to a ring of the most recent RTT samples.
#[derive(Debug, Clone, Default)]
pub struct RttSampleCache {
    samples: Arc<RwLock<VecDeque<RttSample>>>,
}

impl RttSampleCache {
    pub fn new() -> Self {
        Self {
            samples: Arc::new(RwLock::new(VecDeque::with_capacity(RTT_CACHE_CAPACITY))),
        }
    }

    /// Record a sample taken now, evicting the oldest one if full.
    pub fn push_sample(&self, rtt: Duration) {
        self.push_sample_at(rtt, Instant::now())
    }

    /// Record a sample taken at `time`, evicting the oldest one if full.
    pub fn push_sample_at(&self, rtt: Duration, time: Instant) {
        let mut samples = self.samples.write();
        if samples.len() >= RTT_CACHE_CAPACITY {
            samples.pop_front();
        }
        samples.push_back(RttSample { time, rtt });
    }

    /// Copy of the cached samples, oldest first.
    pub fn snapshot(&self) -> Vec<RttSample> {
        self.samples.read().iter().copied().collect()
    }

    /// Copy of the cached RTT values, oldest first.
    pub fn rtts(&self) -> Vec<Duration> {
        self.samples.read().iter().map(|s| s.rtt).collect()
    }

    /// Number of cached samples.
    pub fn len(&self) -> usize {
        self.samples.read().len()
    }

    /// Whether no sample has been recorded.
    pub fn is_empty(&self) -> bool {
        self.samples.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn rtt_cache_keeps_last_ten() {
        let cache = RttSampleCache::new();
        assert!(cache.is_empty());

        for ms in 1..=12 {
            cache.push_sample(Duration::from_millis(ms));
        }

        let expected: Vec<Duration> = (3..=12).map(Duration::from_millis).collect();
        assert_eq!(cache.rtts(), expected);
        assert_eq!(cache.len(), RTT_CACHE_CAPACITY);
    }

    #[test]
    fn rtt_cache_snapshot_order() {
        let cache = RttSampleCache::new();
        let now = Instant::now();
        for i in 0..15_u64 {
            cache.push_sample_at(
                Duration::from_micros(100 * (i + 1)),
                now + Duration::from_millis(i),
            );
        }

        let snapshot = cache.snapshot();
        assert_eq!(snapshot.len(), 10);
        for (i, sample) in snapshot.iter().enumerate() {
            let n = i as u64 + 5;
            assert_eq!(sample.rtt, Duration::from_micros(100 * (n + 1)));
            assert_eq!(sample.time, now + Duration::from_millis(n));
        }
    }

    #[test]
    fn rtt_cache_shared_between_handles() {
        let cache = RttSampleCache::new();
        let reader = cache.clone();
        cache.push_sample(Duration::from_millis(7));
        assert_eq!(reader.rtts(), vec![Duration::from_millis(7)]);
    }

    #[test]
    fn rtt_cache_concurrent_readers() {
        let cache = RttSampleCache::new();

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let cache = cache.clone();
                thread::spawn(move || {
                    for _ in 0..1000 {
                        let rtts = cache.rtts();
                        assert!(rtts.len() <= RTT_CACHE_CAPACITY);
                        // Samples are pushed in increasing order.
                        assert!(rtts.windows(2).all(|w| w[0] < w[1]));
                    }
                })
            })
            .collect();

        for ms in 1..=1000 {
            cache.push_sample(Duration::from_millis(ms));
        }

        for r in readers {
            r.join().unwrap();
        }

        assert_eq!(cache.rtts().last(), Some(&Duration::from_millis(1000)));
    }
}
