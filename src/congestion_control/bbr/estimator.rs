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

//! Path model of BBR: bottleneck bandwidth, round-trip propagation time,
//! packet-timed rounds and the full pipe estimator.

use std::time::Duration;
use std::time::Instant;

use log::*;

use super::super::minmax::ExpiringMin;
use super::super::minmax::MinMax;
use super::super::ConnectionRateState;
use super::super::DeliverySample;

/// Bandwidth growth rate before pipe got filled.
const BTLBW_GROWTH_RATE: f64 = 0.25;

/// Max count of full bandwidth reached, before pipe is supposed to be filled.
/// This three-round threshold was validated by YouTube experimental data.
const FULL_BW_COUNT_THRESHOLD: u64 = 3;

/// Round trip counter for tracking packet-timed round trips which starts
/// at the transmission of some segment, and then end at the ack of that segment.
#[derive(Debug, Default, Clone)]
pub struct RoundTripCounter {
    /// BBR.round_count: Count of packet-timed round trips.
    pub round_count: u64,

    /// BBR.round_start: A boolean that BBR sets to true once per packet-
    /// timed round trip, on ACKs that advance BBR.round_count.
    pub is_round_start: bool,

    /// BBR.next_round_delivered: packet.delivered value denoting the end of
    /// a packet-timed round trip.
    pub next_round_delivered: u64,
}

/// Full pipe estimator, used mainly during Startup mode.
#[derive(Debug, Default, Clone)]
pub struct FullPipeEstimator {
    /// BBR.filled_pipe: A boolean that records whether BBR estimates that it
    /// has ever fully utilized its available bandwidth ("filled the pipe").
    pub is_filled_pipe: bool,

    /// Baseline level delivery rate for full pipe estimator.
    pub full_bw: u64,

    /// The number of round for full pipe estimator without much growth.
    pub full_bw_count: u64,
}

/// Bandwidth and RTT estimator.
#[derive(Debug, Clone)]
pub struct BandwidthRttEstimator {
    /// Counter of packet-timed round trips.
    round: RoundTripCounter,

    /// Estimator of full pipe.
    full_pipe: FullPipeEstimator,

    /// BBR.BtlBwFilter: The max filter used to estimate BBR.BtlBw, in bits
    /// per second.
    bw_filter: MinMax<u64>,

    /// BBR.RTprop and BBR.rtprop_stamp.
    min_rtt: ExpiringMin,
}

impl BandwidthRttEstimator {
    pub fn new(bw_window_length: u64, rtt_window_length: Duration, now: Instant) -> Self {
        Self {
            round: RoundTripCounter::default(),
            full_pipe: FullPipeEstimator::default(),
            bw_filter: MinMax::new(bw_window_length),
            min_rtt: ExpiringMin::new(rtt_window_length, now),
        }
    }

    /// See draft-cardwell-iccrg-bbr-congestion-control-00 Section 4.1.1.3.
    pub fn init_round_counting(&mut self) {
        self.round.next_round_delivered = 0;
        self.round.round_count = 0;
        self.round.is_round_start = false;
    }

    /// See draft-cardwell-iccrg-bbr-congestion-control-00 Section 4.3.2.2.
    pub fn init_full_pipe(&mut self) {
        self.full_pipe.is_filled_pipe = false;
        self.full_pipe.full_bw = 0;
        self.full_pipe.full_bw_count = 0;
    }

    /// Forget the full bandwidth baseline but keep the filled pipe state.
    pub fn reset_full_bw(&mut self) {
        self.full_pipe.full_bw = 0;
        self.full_pipe.full_bw_count = 0;
    }

    /// Seed the min RTT estimate.
    pub fn init_min_rtt(&mut self, min_rtt: Option<Duration>, now: Instant) {
        self.min_rtt.reset(min_rtt, now);
    }

    /// Restart the bandwidth filter with a nominal rate.
    pub fn reset_bandwidth(&mut self, rate: u64) {
        self.bw_filter.reset(0, rate);
    }

    /// Update the virtual time tracked by BBR.round_count. Return true if a
    /// new round starts.
    ///
    /// See draft-cardwell-iccrg-bbr-congestion-control-00 Section 4.1.1.3.
    pub fn update_round(&mut self, prior_delivered: u64, delivered: u64) -> bool {
        if prior_delivered >= self.round.next_round_delivered {
            self.round.next_round_delivered = delivered;
            self.round.round_count += 1;
            self.round.is_round_start = true;
        } else {
            self.round.is_round_start = false;
        }
        self.round.is_round_start
    }

    /// For every valid rate sample, update the round counter and the
    /// BBR.BtlBw estimator. Return true if a new round starts.
    ///
    /// See draft-cardwell-iccrg-bbr-congestion-control-00 Section 4.1.1.5.
    pub fn update_bandwidth(&mut self, rc: &ConnectionRateState, rs: &DeliverySample) -> bool {
        let round_start = self.update_round(rs.prior_delivered, rc.delivered);

        if rs.delivery_rate >= self.bandwidth() || !rs.is_app_limited {
            self.bw_filter
                .update_max(self.round.round_count, rs.delivery_rate);
            trace!(
                "round {} bw sample {} best {}",
                self.round.round_count,
                rs.delivery_rate,
                self.bandwidth()
            );
        }
        round_start
    }

    /// Update BBR.RTprop with the given RTT sample.
    ///
    /// See draft-cardwell-iccrg-bbr-congestion-control-00 Section 4.1.2.3.
    pub fn update_min_rtt(&mut self, rtt: Duration, now: Instant) {
        if self.min_rtt.update(rtt, now) {
            trace!("min rtt updated to {:?}", rtt);
        }
    }

    /// Estimate whether the pipe is full by looking for a plateau in the
    /// BBR.BtlBw estimate. Return true if the pipe has just been filled.
    ///
    /// See draft-cardwell-iccrg-bbr-congestion-control-00 Section 4.3.2.2.
    pub fn check_full_pipe(&mut self, is_app_limited: bool) -> bool {
        // no need to check for a full pipe now
        if self.is_filled_pipe() || !self.is_round_start() || is_app_limited {
            return false;
        }

        // BBR.BtlBw still growing?
        let bw = self.bandwidth();
        if bw as f64 >= self.full_pipe.full_bw as f64 * (1.0 + BTLBW_GROWTH_RATE) {
            // record new baseline level
            self.full_pipe.full_bw = bw;
            self.full_pipe.full_bw_count = 0;
            return false;
        }

        // another round w/o much growth
        self.full_pipe.full_bw_count += 1;
        if self.full_pipe.full_bw_count >= FULL_BW_COUNT_THRESHOLD {
            self.full_pipe.is_filled_pipe = true;
            debug!(
                "pipe filled at round {} with bw {}",
                self.round.round_count, bw
            );
            return true;
        }
        false
    }

    /// Estimated bottleneck bandwidth in bits per second.
    pub fn bandwidth(&self) -> u64 {
        self.bw_filter.get()
    }

    /// Estimated round-trip propagation time.
    pub fn min_rtt(&self) -> Option<Duration> {
        self.min_rtt.get()
    }

    /// Time at which the min RTT estimate was obtained.
    pub fn min_rtt_stamp(&self) -> Instant {
        self.min_rtt.stamp()
    }

    /// Keep the min RTT estimate for another window.
    pub fn refresh_min_rtt_stamp(&mut self, now: Instant) {
        self.min_rtt.refresh_stamp(now);
    }

    /// Whether the min RTT estimate was found stale at the last update.
    pub fn is_min_rtt_expired(&self) -> bool {
        self.min_rtt.is_expired()
    }

    /// Bandwidth-delay product in bytes, or `None` without a min RTT.
    pub fn bdp(&self) -> Option<u64> {
        self.min_rtt()
            .map(|rtt| (self.bandwidth() as f64 * rtt.as_secs_f64() / 8.0) as u64)
    }

    pub fn is_filled_pipe(&self) -> bool {
        self.full_pipe.is_filled_pipe
    }

    pub fn is_round_start(&self) -> bool {
        self.round.is_round_start
    }

    /// Force the next sample to be treated as a round start.
    pub fn set_round_start(&mut self) {
        self.round.is_round_start = true;
    }

    /// Mark the round start as consumed by the current sample.
    pub fn clear_round_start(&mut self) {
        self.round.is_round_start = false;
    }

    pub fn round_count(&self) -> u64 {
        self.round.round_count
    }

    pub fn next_round_delivered(&self) -> u64 {
        self.round.next_round_delivered
    }

    pub fn set_next_round_delivered(&mut self, delivered: u64) {
        self.round.next_round_delivered = delivered;
    }

    pub fn full_bw_count(&self) -> u64 {
        self.full_pipe.full_bw_count
    }
}
