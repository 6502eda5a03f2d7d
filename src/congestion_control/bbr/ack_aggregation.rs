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

//! Estimation of the ACK aggregation level.
//!
//! Receivers and middleboxes often coalesce or delay ACKs, so data is
//! acknowledged in bursts larger than the bottleneck bandwidth would allow.
//! The estimator tracks how many bytes were acknowledged beyond what the
//! bandwidth estimate predicts over an epoch, and lets the cwnd grow by that
//! amount so the sender keeps sending while waiting for the next burst.

use std::time::Instant;

/// Upper bound of the epoch round counter.
pub const MAX_EXTRA_ACKED_WIN_RTT: u32 = 31;

/// Divisor turning a bandwidth in bits per second into the bytes deliverable
/// in 100 ms.
const MAX_AGGREGATION_BW_DIVISOR: u64 = 10 * 8;

/// Excess acknowledged bytes tracked over two alternating windows of rounds.
#[derive(Debug, Clone)]
pub struct AckAggregationEstimator {
    /// Max extra acked bytes seen in the current and the previous window.
    extra_acked: [u64; 2],

    /// Index of the active slot of `extra_acked`.
    extra_acked_idx: usize,

    /// Rounds elapsed in the active window.
    extra_acked_win_rtt: u32,

    /// Number of rounds a slot stays active.
    extra_acked_win_rtt_length: u32,

    /// Gain applied to the extra acked bytes.
    extra_acked_gain: u64,

    /// Start of the current sampling epoch.
    ack_epoch_time: Instant,

    /// Bytes acknowledged in the current sampling epoch.
    ack_epoch_acked: u64,

    /// Epoch accumulator bound after which the epoch restarts.
    ack_epoch_acked_reset_thresh: u64,
}

impl AckAggregationEstimator {
    pub fn new(
        extra_acked_gain: u64,
        extra_acked_win_rtt_length: u32,
        ack_epoch_acked_reset_thresh: u64,
        now: Instant,
    ) -> Self {
        Self {
            extra_acked: [0; 2],
            extra_acked_idx: 0,
            extra_acked_win_rtt: 0,
            extra_acked_win_rtt_length,
            extra_acked_gain,
            ack_epoch_time: now,
            ack_epoch_acked: 0,
            ack_epoch_acked_reset_thresh,
        }
    }

    /// Forget all samples and start a new epoch.
    pub fn reset(&mut self, now: Instant) {
        self.ack_epoch_time = now;
        self.ack_epoch_acked = 0;
        self.extra_acked_win_rtt = 0;
        self.extra_acked_idx = 0;
        self.extra_acked = [0; 2];
    }

    /// Start a new sampling epoch, keeping the estimates.
    pub fn reset_epoch(&mut self, now: Instant) {
        self.ack_epoch_time = now;
        self.ack_epoch_acked = 0;
    }

    /// Account for an ACK of `acked` bytes. `bw` is the bottleneck bandwidth
    /// estimate in bits per second.
    pub fn update(
        &mut self,
        acked: u64,
        delivered: i64,
        is_round_start: bool,
        bw: u64,
        cwnd: u64,
        now: Instant,
    ) {
        if self.extra_acked_gain == 0 || acked == 0 || delivered < 0 {
            return;
        }

        if is_round_start {
            self.extra_acked_win_rtt = (self.extra_acked_win_rtt + 1).min(MAX_EXTRA_ACKED_WIN_RTT);
            if self.extra_acked_win_rtt >= self.extra_acked_win_rtt_length {
                self.extra_acked_win_rtt = 0;
                self.extra_acked_idx ^= 1;
                self.extra_acked[self.extra_acked_idx] = 0;
            }
        }

        // Bytes expected to be acknowledged since the epoch started.
        let epoch = now.saturating_duration_since(self.ack_epoch_time);
        let mut expected_acked = (bw as f64 * epoch.as_secs_f64() / 8.0) as u64;

        // Reset the epoch if the ACK rate is below the expected rate, or the
        // accumulator grows too large.
        if self.ack_epoch_acked <= expected_acked
            || self.ack_epoch_acked.saturating_add(acked) >= self.ack_epoch_acked_reset_thresh
        {
            self.ack_epoch_acked = 0;
            self.ack_epoch_time = now;
            expected_acked = 0;
        }

        self.ack_epoch_acked = self.ack_epoch_acked.saturating_add(acked);
        let extra_acked = self
            .ack_epoch_acked
            .saturating_sub(expected_acked)
            .min(cwnd);

        let slot = &mut self.extra_acked[self.extra_acked_idx];
        if extra_acked > *slot {
            *slot = extra_acked;
        }
    }

    /// Bytes to add to the target cwnd. Only granted once the pipe is filled
    /// and capped at 100 ms worth of `bw`.
    pub fn aggregation_cwnd(&self, bw: u64, is_filled_pipe: bool) -> u64 {
        if self.extra_acked_gain == 0 || !is_filled_pipe {
            return 0;
        }

        let max_aggr_bytes = bw / MAX_AGGREGATION_BW_DIVISOR;
        let aggr_cwnd_bytes = self
            .extra_acked_gain
            .saturating_mul(self.extra_acked[0].max(self.extra_acked[1]));
        aggr_cwnd_bytes.min(max_aggr_bytes)
    }

    pub fn extra_acked(&self) -> [u64; 2] {
        self.extra_acked
    }

    pub fn extra_acked_idx(&self) -> usize {
        self.extra_acked_idx
    }

    pub fn epoch_acked(&self) -> u64 {
        self.ack_epoch_acked
    }

    pub fn epoch_time(&self) -> Instant {
        self.ack_epoch_time
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn ack_aggregation_slot_flips() {
        let now = Instant::now();
        let mut agg = AckAggregationEstimator::new(1, 5, 1 << 12, now);
        assert_eq!(agg.extra_acked_idx(), 0);

        let mut flips = Vec::new();
        for round in 1..=20 {
            let t = now + Duration::from_millis(round);
            agg.update(100, 100, true, 0, 100_000, t);
            flips.push(agg.extra_acked_idx());
        }

        // The active slot flips exactly every five rounds.
        let expected: Vec<usize> = (1..=20).map(|r| (r / 5) % 2).collect();
        assert_eq!(flips, expected);
    }

    #[test]
    fn ack_aggregation_bounded_by_cwnd() {
        let now = Instant::now();
        let mut agg = AckAggregationEstimator::new(1, 5, 1 << 20, now);

        // No bandwidth estimate, everything acknowledged is extra.
        agg.update(3000, 3000, false, 0, 100_000, now);
        assert_eq!(agg.extra_acked(), [3000, 0]);
        agg.update(3000, 3000, false, 0, 4000, now);
        assert_eq!(agg.epoch_acked(), 6000);
        assert_eq!(agg.extra_acked(), [4000, 0]);
    }

    #[test]
    fn ack_aggregation_epoch_reset() {
        let now = Instant::now();
        let mut agg = AckAggregationEstimator::new(1, 5, 1 << 12, now);

        agg.update(1000, 1000, false, 0, 100_000, now);
        assert_eq!(agg.epoch_acked(), 1000);

        // At 8 Mbit/s, 10 ms worth of data is 10000 bytes, more than what was
        // acknowledged: the epoch restarts.
        let later = now + Duration::from_millis(10);
        agg.update(500, 500, false, 8_000_000, 100_000, later);
        assert_eq!(agg.epoch_acked(), 500);
        assert_eq!(agg.epoch_time(), later);

        // Reaching the reset threshold restarts the epoch too.
        agg.update(3000, 3000, false, 0, 100_000, later);
        assert_eq!(agg.epoch_acked(), 3500);
        let t = later + Duration::from_millis(1);
        agg.update(600, 600, false, 0, 100_000, t);
        assert_eq!(agg.epoch_acked(), 600);
        assert_eq!(agg.epoch_time(), t);
    }

    #[test]
    fn ack_aggregation_skips_invalid_samples() {
        let now = Instant::now();
        let mut agg = AckAggregationEstimator::new(1, 5, 1 << 12, now);
        agg.update(0, 100, true, 0, 100_000, now);
        agg.update(100, -1, true, 0, 100_000, now);
        assert_eq!(agg.epoch_acked(), 0);

        let mut disabled = AckAggregationEstimator::new(0, 5, 1 << 12, now);
        disabled.update(100, 100, false, 0, 100_000, now);
        assert_eq!(disabled.extra_acked(), [0, 0]);
        assert_eq!(disabled.aggregation_cwnd(u64::MAX, true), 0);
    }

    #[test]
    fn ack_aggregation_cwnd_bonus() {
        let now = Instant::now();
        let mut agg = AckAggregationEstimator::new(1, 5, 1 << 12, now);
        agg.update(3000, 3000, false, 0, 100_000, now);

        // Not granted before the pipe is filled.
        assert_eq!(agg.aggregation_cwnd(8_000_000, false), 0);
        assert_eq!(agg.aggregation_cwnd(8_000_000, true), 3000);
        // Capped at 100 ms of bandwidth.
        assert_eq!(agg.aggregation_cwnd(80_000, true), 1000);

        agg.reset(now);
        assert_eq!(agg.aggregation_cwnd(8_000_000, true), 0);
    }
}
