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

/*
 * Copyright 2017, Google Inc.
 *
 * Use of this source code is governed by the following BSD-style license:
 *
 * Redistribution and use in source and binary forms, with or without
 * modification, are permitted provided that the following conditions are
 * met:
 *
 *    * Redistributions of source code must retain the above copyright
 * notice, this list of conditions and the following disclaimer.
 *    * Redistributions in binary form must reproduce the above
 * copyright notice, this list of conditions and the following disclaimer
 * in the documentation and/or other materials provided with the
 * distribution.
 *
 *    * Neither the name of Google Inc. nor the names of its
 * contributors may be used to endorse or promote products derived from
 * this software without specific prior written permission.
 *
 * THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS
 * "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT
 * LIMITED TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR
 * A PARTICULAR PURPOSE ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT
 * OWNER OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL,
 * SPECIAL, EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT
 * LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE,
 * DATA, OR PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY
 * THEORY OF LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT
 * (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE
 * OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.
 */

//! Windowed extremum filters.
//!
//! [`MinMax`] is Kathleen Nichols' constant-space tracker of the minimum or
//! maximum of a stream over a sliding window, keyed by a monotonically
//! increasing counter (packet-timed round trips for the BBR bandwidth
//! filter). It keeps the best, second best and third best samples, each no
//! older than the one before it, and spreads them across the window so the
//! estimate degrades gracefully to the most recent sample once the best one
//! ages out. Refer to <https://groups.google.com/g/bbr-dev/c/3RTgkzi5ZD8>.
//!
//! [`ExpiringMin`] is the simpler wall-clock minimum used for the BBR min-RTT
//! estimate: a single value that any smaller sample replaces, and that any
//! sample at all replaces once it is older than the window.

use std::time::Duration;
use std::time::Instant;

#[derive(Debug, Copy, Clone, Default, PartialEq)]
struct MinMaxSample<T> {
    /// Round trip count.
    time: u64,

    /// Sample value.
    value: T,
}

/// Windowed min/max filter over values of type `T`.
///
/// A best value equal to `T::default()` is treated as "no sample yet".
#[derive(Debug, Clone)]
pub struct MinMax<T> {
    /// The max lasting time window to pick up the best sample.
    window: u64,

    /// The best, second best, third best samples.
    samples: [MinMaxSample<T>; 3],
}

impl<T> MinMax<T>
where
    T: Copy + Default + PartialOrd,
{
    pub fn new(window: u64) -> Self {
        Self {
            window,
            samples: [MinMaxSample::default(); 3],
        }
    }

    /// Set window size.
    pub fn set_window(&mut self, window: u64) {
        self.window = window;
    }

    /// Window size.
    pub fn window(&self) -> u64 {
        self.window
    }

    /// Forget all samples and restart from the given value.
    pub fn reset(&mut self, time: u64, value: T) {
        self.samples.fill(MinMaxSample { time, value })
    }

    /// As time advances, update the 1st, 2nd, and 3rd choices.
    fn subwin_update(&mut self, sample: MinMaxSample<T>) {
        let dt = sample.time.saturating_sub(self.samples[0].time);
        if dt > self.window {
            // The best choice has aged out, promote the 2nd and 3rd choices.
            // The new 1st choice may have expired as well.
            self.samples[0] = self.samples[1];
            self.samples[1] = self.samples[2];
            self.samples[2] = sample;
            if sample.time.saturating_sub(self.samples[0].time) > self.window {
                self.samples[0] = self.samples[1];
                self.samples[1] = self.samples[2];
                self.samples[2] = sample;
            }
        } else if self.samples[1].time == self.samples[0].time && dt > self.window / 4_u64 {
            // A quarter of the window passed without a new best, take a 2nd
            // choice from the 2nd quarter of the window.
            self.samples[2] = sample;
            self.samples[1] = sample;
        } else if self.samples[2].time == self.samples[1].time && dt > self.window / 2_u64 {
            // Half the window passed, take a 3rd choice from the last half.
            self.samples[2] = sample;
        }
    }

    /// Feed a sample, `better(a, b)` returns true if `a` should replace `b`.
    fn update(&mut self, time: u64, value: T, better: fn(&T, &T) -> bool) {
        if time < self.samples[2].time {
            // Time should be monotonically increasing.
            return;
        }

        let sample = MinMaxSample { time, value };

        if self.samples[0].value == T::default()  // uninitialised
            || better(&sample.value, &self.samples[0].value) // found new best?
            || sample.time.saturating_sub(self.samples[2].time) > self.window
        // nothing left in window?
        {
            self.reset(time, value);
            return;
        }

        if better(&sample.value, &self.samples[1].value) {
            self.samples[2] = sample;
            self.samples[1] = sample;
        } else if better(&sample.value, &self.samples[2].value) {
            self.samples[2] = sample;
        }

        self.subwin_update(sample);
    }

    /// Check if new measurement updates the 1st, 2nd or 3rd choice max.
    pub fn update_max(&mut self, time: u64, value: T) {
        self.update(time, value, |a, b| a >= b)
    }

    /// Check if new measurement updates the 1st, 2nd or 3rd choice min.
    pub fn update_min(&mut self, time: u64, value: T) {
        self.update(time, value, |a, b| a <= b)
    }

    /// Get the min/max value.
    pub fn get(&self) -> T {
        self.samples[0].value
    }
}

impl<T> Default for MinMax<T>
where
    T: Copy + Default + PartialOrd,
{
    fn default() -> Self {
        // The default window for BBR is 10 round trips
        Self::new(10)
    }
}

/// Minimum filter whose value expires after a wall-clock window.
#[derive(Debug, Clone)]
pub struct ExpiringMin {
    /// Current minimum, `None` until the first sample.
    value: Option<Duration>,

    /// Time at which the current value was obtained.
    stamp: Instant,

    /// Lifetime of a sample.
    window: Duration,

    /// Whether the value had expired at the last update.
    expired: bool,
}

impl ExpiringMin {
    pub fn new(window: Duration, now: Instant) -> Self {
        Self {
            value: None,
            stamp: now,
            window,
            expired: false,
        }
    }

    /// Seed the filter, typically with the smoothed RTT of the connection.
    pub fn reset(&mut self, value: Option<Duration>, now: Instant) {
        self.value = value;
        self.stamp = now;
        self.expired = false;
    }

    /// Feed a sample taken at `now`. Zero samples refresh the expiry state
    /// only. Return true if the sample became the new minimum.
    pub fn update(&mut self, sample: Duration, now: Instant) -> bool {
        self.expired = now > self.stamp + self.window;

        let is_lower = self.value.map_or(true, |v| sample <= v);
        if !sample.is_zero() && (is_lower || self.expired) {
            self.value = Some(sample);
            self.stamp = now;
            return true;
        }

        false
    }

    /// Keep the current value but restart its lifetime.
    pub fn refresh_stamp(&mut self, now: Instant) {
        self.stamp = now;
    }

    /// Current minimum, `None` if unknown.
    pub fn get(&self) -> Option<Duration> {
        self.value
    }

    /// Whether the value was found stale at the last update.
    pub fn is_expired(&self) -> bool {
        self.expired
    }

    /// Time at which the current value was obtained.
    pub fn stamp(&self) -> Instant {
        self.stamp
    }
}
