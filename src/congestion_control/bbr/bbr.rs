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

//! BBR Congestion Control with a DCTCP style ECN estimator.
//!
//! BBR uses recent measurements of a transport connection's delivery rate
//! and round-trip time to build an explicit model that includes both the
//! maximum recent bandwidth available to that connection, and its
//! minimum recent round-trip delay.  BBR then uses this model to control
//! both how fast it sends data and the maximum amount of data it allows
//! in flight in the network at any time.
//!
//! On top of the model, the fraction of CE marked bytes is tracked per
//! window of data as in DCTCP (RFC 8257) and ECE feedback nudges the cwnd
//! gain. ACK aggregation is tolerated by adding the recently observed excess
//! of acknowledged bytes to the cwnd target.
//!
//! See <https://datatracker.ietf.org/doc/html/draft-cardwell-iccrg-bbr-congestion-control-00>.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;
use std::time::Instant;

use log::*;
use rand::rngs::StdRng;
use rand::Rng;
use rand::SeedableRng;
use serde::Deserialize;
use serde::Serialize;
use serde_with::serde_as;
use serde_with::DurationMilliSeconds;

use self::ack_aggregation::AckAggregationEstimator;
use self::ack_aggregation::MAX_EXTRA_ACKED_WIN_RTT;
use self::dctcp::DctcpEstimator;
use self::estimator::BandwidthRttEstimator;
use self::mode::ModeController;
use self::mode::PROBE_BW_PHASE_OFFSETS;
use super::CongestionController;
use super::CongestionEvent;
use super::CongestionState;
use super::ConnectionRateState;
use super::CwndEvent;
use super::DeliverySample;
use super::LinuxReno;
use super::LossBasedFallback;
use super::TransportControlBlock;
use crate::qlog::events::CongestionStateUpdatedTrigger;
use crate::qlog::events::EventData;
use crate::rtt_cache::RttSampleCache;
use crate::Error;
use crate::Result;

pub use self::mode::BbrMode;

/// Maximum number of observability events kept until `take_events`.
const MAX_PENDING_EVENTS: usize = 1024;

/// BBR configurable parameters.
///
/// The configuration is fixed once the controller is built. Durations are
/// (de)serialized as milliseconds.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BbrConfig {
    /// BBRHighGain: the gain used in Startup for both the pacing gain and
    /// the cwnd gain (`2/ln(2)` ~= `2.89`).
    high_gain: f64,

    /// Length of the bandwidth max filter window, in packet-timed rounds.
    bw_window_length: u64,

    /// Length of the min RTT filter window.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    rtt_window_length: Duration,

    /// Minimum time spent in ProbeRTT once inflight is at the min pipe cwnd.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    probe_rtt_duration: Duration,

    /// Rounds an ACK aggregation slot stays active.
    extra_acked_window_length: u32,

    /// Gain applied to the ACK aggregation bonus. Zero disables the bonus.
    extra_acked_gain: u64,

    /// Bytes accumulated in an ACK epoch after which the epoch restarts.
    ack_epoch_acked_reset_thresh: u64,

    /// Fraction of the bandwidth left unused by the pacing rate.
    pacing_margin: f64,

    /// EWMA weight of the marked fraction estimator.
    dctcp_shift_g: f64,

    /// Marked fraction estimate before any feedback.
    dctcp_alpha_on_init: f64,

    /// Mark outgoing packets with ECT(0), otherwise ECT(1).
    use_ect0: bool,

    /// Seed of the random stream picking the initial ProbeBW phase.
    random_stream: u64,
}

impl Default for BbrConfig {
    fn default() -> Self {
        Self {
            high_gain: 2.89,
            bw_window_length: 10,
            rtt_window_length: Duration::from_secs(10),
            probe_rtt_duration: Duration::from_millis(200),
            extra_acked_window_length: 5,
            extra_acked_gain: 1,
            ack_epoch_acked_reset_thresh: 1 << 12,
            pacing_margin: 0.01,
            dctcp_shift_g: 0.0625,
            dctcp_alpha_on_init: 1.0,
            use_ect0: true,
            random_stream: 4,
        }
    }
}

impl BbrConfig {
    /// Parse a configuration from JSON. Missing fields take their default
    /// value.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: BbrConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Check that the parameters are usable.
    pub fn validate(&self) -> Result<()> {
        if !self.high_gain.is_finite() || self.high_gain <= 1.0 {
            return Err(Error::InvalidConfig(format!(
                "high_gain {} must be greater than 1",
                self.high_gain
            )));
        }
        if self.bw_window_length == 0 {
            return Err(Error::InvalidConfig("bw_window_length is zero".into()));
        }
        if self.rtt_window_length.is_zero() {
            return Err(Error::InvalidConfig("rtt_window_length is zero".into()));
        }
        if self.probe_rtt_duration.is_zero() {
            return Err(Error::InvalidConfig("probe_rtt_duration is zero".into()));
        }
        if self.extra_acked_window_length == 0
            || self.extra_acked_window_length > MAX_EXTRA_ACKED_WIN_RTT
        {
            return Err(Error::InvalidConfig(format!(
                "extra_acked_window_length {} out of range [1, {}]",
                self.extra_acked_window_length, MAX_EXTRA_ACKED_WIN_RTT
            )));
        }
        if self.ack_epoch_acked_reset_thresh == 0 {
            return Err(Error::InvalidConfig(
                "ack_epoch_acked_reset_thresh is zero".into(),
            ));
        }
        if !(0.0..1.0).contains(&self.pacing_margin) {
            return Err(Error::InvalidConfig(format!(
                "pacing_margin {} out of range [0, 1)",
                self.pacing_margin
            )));
        }
        if !(self.dctcp_shift_g > 0.0 && self.dctcp_shift_g <= 1.0) {
            return Err(Error::InvalidConfig(format!(
                "dctcp_shift_g {} out of range (0, 1]",
                self.dctcp_shift_g
            )));
        }
        if !(0.0..=1.0).contains(&self.dctcp_alpha_on_init) {
            return Err(Error::InvalidConfig(format!(
                "dctcp_alpha_on_init {} out of range [0, 1]",
                self.dctcp_alpha_on_init
            )));
        }
        Ok(())
    }

    pub fn set_high_gain(&mut self, v: f64) {
        self.high_gain = v;
    }

    pub fn set_bw_window_length(&mut self, v: u64) {
        self.bw_window_length = v;
    }

    pub fn set_rtt_window_length(&mut self, v: Duration) {
        self.rtt_window_length = v;
    }

    pub fn set_probe_rtt_duration(&mut self, v: Duration) {
        self.probe_rtt_duration = v;
    }

    pub fn set_extra_acked_window_length(&mut self, v: u32) {
        self.extra_acked_window_length = v;
    }

    pub fn set_extra_acked_gain(&mut self, v: u64) {
        self.extra_acked_gain = v;
    }

    pub fn set_ack_epoch_acked_reset_thresh(&mut self, v: u64) {
        self.ack_epoch_acked_reset_thresh = v;
    }

    pub fn set_pacing_margin(&mut self, v: f64) {
        self.pacing_margin = v;
    }

    pub fn set_dctcp_shift_g(&mut self, v: f64) {
        self.dctcp_shift_g = v;
    }

    pub fn set_dctcp_alpha_on_init(&mut self, v: f64) {
        self.dctcp_alpha_on_init = v;
    }

    pub fn set_use_ect0(&mut self, v: bool) {
        self.use_ect0 = v;
    }

    pub fn set_random_stream(&mut self, v: u64) {
        self.random_stream = v;
    }

    pub fn high_gain(&self) -> f64 {
        self.high_gain
    }

    pub fn rtt_window_length(&self) -> Duration {
        self.rtt_window_length
    }

    pub fn probe_rtt_duration(&self) -> Duration {
        self.probe_rtt_duration
    }

    pub fn use_ect0(&self) -> bool {
        self.use_ect0
    }

    pub fn random_stream(&self) -> u64 {
        self.random_stream
    }
}

/// Source of uniform random integers.
pub trait RandomSource: fmt::Debug {
    /// Return a uniform integer in `[lo, hi)`, or `lo` if the range is empty.
    fn next_value(&mut self, lo: u64, hi: u64) -> u64;

    fn box_clone(&self) -> Box<dyn RandomSource>;
}

impl<R> RandomSource for R
where
    R: Rng + Clone + fmt::Debug + 'static,
{
    fn next_value(&mut self, lo: u64, hi: u64) -> u64 {
        if lo >= hi {
            return lo;
        }
        self.gen_range(lo..hi)
    }

    fn box_clone(&self) -> Box<dyn RandomSource> {
        Box::new(self.clone())
    }
}

impl Clone for Box<dyn RandomSource> {
    fn clone(&self) -> Self {
        self.box_clone()
    }
}

/// BBR congestion controller.
#[derive(Debug, Clone)]
pub struct Bbr {
    /// Configurable parameters.
    config: BbrConfig,

    /// State machine and gains.
    mode: ModeController,

    /// BBR.BtlBw, BBR.RTprop, round counting and full pipe estimation.
    model: BandwidthRttEstimator,

    /// Excess acknowledged bytes.
    ack_aggregation: AckAggregationEstimator,

    /// Marked fraction of acknowledged bytes.
    dctcp: DctcpEstimator,

    /// Slow start threshold used before the model sets one.
    fallback: Box<dyn LossBasedFallback>,

    /// Initial ProbeBW phase selection.
    rng: Box<dyn RandomSource>,

    /// Recent RTT samples shared with observers.
    rtt_cache: Option<RttSampleCache>,

    /// Whether the model was initialized on entering the Open state.
    is_initialized: bool,

    /// Whether the pacing rate was initialized from a measured RTT.
    has_seen_rtt: bool,

    /// Whether the model has set the slow start threshold.
    has_model_ssthresh: bool,

    /// BBR.prior_cwnd: The last-known good congestion window.
    prior_cwnd: u64,

    /// Congestion window targeted by the last update.
    target_cwnd: u64,

    /// BBRMinPipeCwnd: The minimal cwnd value BBR targets.
    min_pipe_cwnd: u64,

    /// BBR.send_quantum: The maximum size of a data aggregate scheduled
    /// and transmitted together.
    send_quantum: u64,

    /// Bytes delivered on the connection, as of the last update.
    delivered: u64,

    /// End of the application limited phase, in delivered bytes. Zero if
    /// not application limited.
    app_limited: u64,

    /// Whether packet conservation is active during recovery.
    packet_conservation: bool,

    /// BBR.idle_restart: whether the connection restarted from idle.
    is_idle_restart: bool,

    /// BBR.probe_rtt_done_stamp: end of the ProbeRTT hold.
    probe_rtt_done_stamp: Option<Instant>,

    /// BBR.probe_rtt_round_done: whether a round passed in ProbeRTT. Only
    /// reset when the ProbeRTT hold starts, so an idle restart can complete
    /// ProbeRTT only once `probe_rtt_done_stamp` is set.
    probe_rtt_round_done: bool,

    /// Pending observability events.
    events: VecDeque<CongestionEvent>,
}

impl Bbr {
    /// Create a controller seeded with `config.random_stream`.
    pub fn new(config: BbrConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.random_stream);
        Self::with_random_source(config, Box::new(rng))
    }

    /// Create a controller drawing ProbeBW phases from `rng`.
    pub fn with_random_source(config: BbrConfig, rng: Box<dyn RandomSource>) -> Self {
        let now = Instant::now();
        Self {
            mode: ModeController::new(config.high_gain, now),
            model: BandwidthRttEstimator::new(
                config.bw_window_length,
                config.rtt_window_length,
                now,
            ),
            ack_aggregation: AckAggregationEstimator::new(
                config.extra_acked_gain,
                config.extra_acked_window_length,
                config.ack_epoch_acked_reset_thresh,
                now,
            ),
            dctcp: DctcpEstimator::new(config.dctcp_shift_g, config.dctcp_alpha_on_init),
            fallback: Box::new(LinuxReno),
            rng,
            rtt_cache: None,
            is_initialized: false,
            has_seen_rtt: false,
            has_model_ssthresh: false,
            prior_cwnd: 0,
            target_cwnd: 0,
            min_pipe_cwnd: 0,
            send_quantum: 0,
            delivered: 0,
            app_limited: 0,
            packet_conservation: false,
            is_idle_restart: false,
            probe_rtt_done_stamp: None,
            probe_rtt_round_done: false,
            events: VecDeque::new(),
            config,
        }
    }

    /// Record every positive RTT sample into `cache`.
    pub fn set_rtt_cache(&mut self, cache: RttSampleCache) {
        self.rtt_cache = Some(cache);
    }

    pub fn rtt_cache(&self) -> Option<&RttSampleCache> {
        self.rtt_cache.as_ref()
    }

    /// Override the initial marked fraction estimate.
    ///
    /// # Panics
    ///
    /// Panics if called after `init`.
    pub fn set_dctcp_initial_alpha(&mut self, alpha: f64) {
        self.dctcp.set_initial_alpha(alpha);
    }

    pub fn config(&self) -> &BbrConfig {
        &self.config
    }

    pub fn mode(&self) -> BbrMode {
        self.mode.mode()
    }

    pub fn pacing_gain(&self) -> f64 {
        self.mode.pacing_gain()
    }

    pub fn cwnd_gain(&self) -> f64 {
        self.mode.cwnd_gain()
    }

    pub fn cycle_index(&self) -> usize {
        self.mode.cycle_index()
    }

    /// Estimated bottleneck bandwidth in bits per second.
    pub fn bandwidth(&self) -> u64 {
        self.model.bandwidth()
    }

    pub fn min_rtt(&self) -> Option<Duration> {
        self.model.min_rtt()
    }

    pub fn round_count(&self) -> u64 {
        self.model.round_count()
    }

    pub fn is_filled_pipe(&self) -> bool {
        self.model.is_filled_pipe()
    }

    pub fn is_idle_restart(&self) -> bool {
        self.is_idle_restart
    }

    pub fn is_packet_conservation(&self) -> bool {
        self.packet_conservation
    }

    pub fn prior_cwnd(&self) -> u64 {
        self.prior_cwnd
    }

    pub fn target_cwnd(&self) -> u64 {
        self.target_cwnd
    }

    pub fn min_pipe_cwnd(&self) -> u64 {
        self.min_pipe_cwnd
    }

    /// Smoothed fraction of CE marked bytes.
    pub fn alpha(&self) -> f64 {
        self.dctcp.alpha()
    }

    /// Smoothed deviation of RTT samples from the min RTT.
    pub fn rtt_jitter(&self) -> Duration {
        self.dctcp.rtt_jitter()
    }

    /// Max extra acknowledged bytes in both aggregation slots.
    pub fn extra_acked(&self) -> [u64; 2] {
        self.ack_aggregation.extra_acked()
    }

    pub fn probe_rtt_done_stamp(&self) -> Option<Instant> {
        self.probe_rtt_done_stamp
    }

    /// Initialize the model when the connection first enters Open.
    fn init_model(&mut self, tcb: &mut TransportControlBlock, now: Instant) {
        self.model.init_min_rtt(tcb.srtt, now);
        self.prior_cwnd = tcb.cwnd;
        tcb.ssthresh = tcb.initial_ssthresh;
        self.target_cwnd = tcb.cwnd;
        self.min_pipe_cwnd = 4 * tcb.segment_size;
        self.send_quantum = tcb.segment_size;

        self.model.init_round_counting();
        self.model.init_full_pipe();
        self.enter_startup(CongestionStateUpdatedTrigger::Model, now);
        self.init_pacing_rate(tcb);
        self.ack_aggregation.reset(now);
        self.is_initialized = true;
        debug!(
            "{} initialized cwnd {} min rtt {:?}",
            self.name(),
            tcb.cwnd,
            self.model.min_rtt()
        );
    }

    /// Initialize the pacing rate from the cwnd and the connection min RTT.
    ///
    /// See draft-cardwell-iccrg-bbr-congestion-control-00 Section 4.2.1.
    fn init_pacing_rate(&mut self, tcb: &mut TransportControlBlock) {
        if !tcb.pacing {
            warn!("BBR must use pacing");
            tcb.pacing = true;
        }

        let rtt = match tcb.min_rtt {
            Some(min_rtt) => {
                self.has_seen_rtt = true;
                Duration::from_millis((min_rtt.as_millis() as u64).max(1))
            }
            None => Duration::from_millis(1),
        };

        let nominal_bandwidth = (tcb.cwnd as f64 * 8.0 / rtt.as_secs_f64()) as u64;
        tcb.pacing_rate = (self.mode.pacing_gain() * nominal_bandwidth as f64) as u64;
        self.model.reset_bandwidth(nominal_bandwidth);
    }

    /// See draft-cardwell-iccrg-bbr-congestion-control-00 Section 4.2.1.
    fn set_pacing_rate_with_gain(&mut self, tcb: &mut TransportControlBlock, gain: f64) {
        let rate = gain * self.model.bandwidth() as f64 * (1.0 - self.config.pacing_margin);
        let rate = (rate as u64).min(tcb.max_pacing_rate);

        if !self.has_seen_rtt && tcb.min_rtt.is_some() {
            self.init_pacing_rate(tcb);
        }

        if self.model.is_filled_pipe() || rate > tcb.pacing_rate {
            tcb.pacing_rate = rate;
        }
    }

    /// Volume of data in flight for the given gain, in bytes.
    ///
    /// See draft-cardwell-iccrg-bbr-congestion-control-00 Section 4.2.3.2.
    fn inflight(&self, tcb: &TransportControlBlock, gain: f64) -> u64 {
        let bdp = match self.model.bdp() {
            Some(bdp) => bdp,
            None => return tcb.initial_window(),
        };

        let quanta = 3 * self.send_quantum;
        let mut target = (gain * bdp as f64) as u64 + quanta;
        if self.mode.mode() == BbrMode::ProbeBw && self.mode.cycle_index() == 0 {
            target += 2 * tcb.segment_size;
        }
        target
    }

    /// See draft-cardwell-iccrg-bbr-congestion-control-00 Section 4.2.3.4.
    fn save_cwnd(&mut self, tcb: &TransportControlBlock) {
        if tcb.cong_state != CongestionState::Recovery && self.mode.mode() != BbrMode::ProbeRtt {
            self.prior_cwnd = tcb.cwnd;
        } else {
            self.prior_cwnd = self.prior_cwnd.max(tcb.cwnd);
        }
    }

    fn restore_cwnd(&self, tcb: &mut TransportControlBlock) {
        tcb.cwnd = tcb.cwnd.max(self.prior_cwnd);
    }

    fn enter_startup(&mut self, trigger: CongestionStateUpdatedTrigger, now: Instant) {
        let old = self.mode.enter_startup();
        self.on_mode_change(old, trigger, now);
    }

    fn enter_probe_bw(&mut self, trigger: CongestionStateUpdatedTrigger, now: Instant) {
        let offset = self.rng.next_value(0, PROBE_BW_PHASE_OFFSETS as u64) as usize;
        let old = self.mode.enter_probe_bw(offset, now);
        self.on_mode_change(old, trigger, now);
    }

    fn exit_probe_rtt(&mut self, trigger: CongestionStateUpdatedTrigger, now: Instant) {
        if self.model.is_filled_pipe() {
            self.enter_probe_bw(trigger, now);
        } else {
            self.enter_startup(trigger, now);
        }
    }

    fn on_mode_change(&mut self, old: BbrMode, trigger: CongestionStateUpdatedTrigger, now: Instant) {
        let new = self.mode.mode();
        if old == new {
            return;
        }
        self.push_event(
            now,
            EventData::RecoveryCongestionStateUpdated {
                old: Some(old.name().to_string()),
                new: new.name().to_string(),
                trigger: Some(trigger),
            },
        );
    }

    fn push_event(&mut self, now: Instant, data: EventData) {
        if self.events.len() >= MAX_PENDING_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(CongestionEvent { time: now, data });
    }

    fn push_metrics(&mut self, tcb: &TransportControlBlock, now: Instant) {
        let ms = |rtt: Duration| rtt.as_secs_f32() * 1000.0;
        let data = EventData::RecoveryMetricsUpdated {
            min_rtt: self.model.min_rtt().map(ms),
            latest_rtt: Some(ms(tcb.last_rtt)),
            congestion_window: Some(tcb.cwnd),
            bytes_in_flight: Some(tcb.bytes_in_flight),
            ssthresh: Some(tcb.ssthresh).filter(|v| *v != u64::MAX),
            pacing_rate: Some(tcb.pacing_rate),
            bandwidth: Some(self.model.bandwidth()),
            pacing_gain: Some(self.mode.pacing_gain()),
            cwnd_gain: Some(self.mode.cwnd_gain()),
        };
        self.push_event(now, data);
    }

    /// Update the model and the state machine with a delivery sample.
    fn update_model_and_state(
        &mut self,
        tcb: &mut TransportControlBlock,
        rc: &ConnectionRateState,
        rs: &DeliverySample,
        now: Instant,
    ) {
        if rs.is_valid() && self.model.update_bandwidth(rc, rs) {
            self.packet_conservation = false;
        }

        self.ack_aggregation.update(
            rs.acked_sacked,
            rs.delivered,
            self.model.is_round_start(),
            self.model.bandwidth(),
            tcb.cwnd,
            now,
        );
        self.check_cycle_phase(tcb, rs, now);
        self.model.check_full_pipe(rs.is_app_limited);
        self.check_drain(tcb, now);
        self.model.update_min_rtt(tcb.last_rtt, now);
        self.check_probe_rtt(tcb, rs, now);

        // Each round start is seen by one sample only. Invalid samples skip
        // the round update and must not count the previous round again.
        self.model.clear_round_start();
    }

    /// See draft-cardwell-iccrg-bbr-congestion-control-00 Section 4.3.4.4.
    fn check_cycle_phase(&mut self, tcb: &TransportControlBlock, rs: &DeliverySample, now: Instant) {
        if self.mode.mode() != BbrMode::ProbeBw {
            return;
        }

        let target = self.inflight(tcb, self.mode.pacing_gain());
        let bdp_target = self.inflight(tcb, 1.0);
        if self.mode.is_next_cycle_phase(
            now,
            self.model.min_rtt(),
            rs.bytes_loss > 0,
            rs.prior_in_flight,
            target,
            bdp_target,
        ) {
            self.mode.advance_cycle_phase(now);
        }
    }

    /// See draft-cardwell-iccrg-bbr-congestion-control-00 Section 4.3.3.
    fn check_drain(&mut self, tcb: &mut TransportControlBlock, now: Instant) {
        match self.mode.mode() {
            BbrMode::Startup if self.model.is_filled_pipe() => {
                let old = self.mode.enter_drain();
                self.on_mode_change(old, CongestionStateUpdatedTrigger::Model, now);
                tcb.ssthresh = self.inflight(tcb, 1.0);
                self.has_model_ssthresh = true;
            }
            _ => (),
        }

        match self.mode.mode() {
            BbrMode::Drain if tcb.bytes_in_flight <= self.inflight(tcb, 1.0) => {
                self.enter_probe_bw(CongestionStateUpdatedTrigger::Model, now);
            }
            _ => (),
        }
    }

    /// See draft-cardwell-iccrg-bbr-congestion-control-00 Section 4.3.5.
    fn check_probe_rtt(
        &mut self,
        tcb: &mut TransportControlBlock,
        rs: &DeliverySample,
        now: Instant,
    ) {
        if self.mode.mode() != BbrMode::ProbeRtt
            && self.model.is_min_rtt_expired()
            && !self.is_idle_restart
        {
            let old = self.mode.enter_probe_rtt();
            self.on_mode_change(old, CongestionStateUpdatedTrigger::Model, now);
            self.save_cwnd(tcb);
            self.probe_rtt_done_stamp = None;
        }

        if self.mode.mode() == BbrMode::ProbeRtt {
            self.handle_probe_rtt(tcb, now);
        }

        if rs.delivered != 0 {
            self.is_idle_restart = false;
        }
    }

    fn handle_probe_rtt(&mut self, tcb: &mut TransportControlBlock, now: Instant) {
        // Ignore low rate samples during ProbeRTT.
        self.app_limited = (self.delivered + tcb.bytes_in_flight).max(1);

        match self.probe_rtt_done_stamp {
            None if tcb.bytes_in_flight <= self.min_pipe_cwnd => {
                self.probe_rtt_done_stamp = Some(now + self.config.probe_rtt_duration);
                self.probe_rtt_round_done = false;
                self.model.set_next_round_delivered(self.delivered);
            }
            None => (),
            Some(done_stamp) => {
                // Holding: wait for a round and the ProbeRTT duration.
                if self.model.is_round_start() {
                    self.probe_rtt_round_done = true;
                }
                if self.probe_rtt_round_done && now > done_stamp {
                    self.model.refresh_min_rtt_stamp(now);
                    self.restore_cwnd(tcb);
                    self.exit_probe_rtt(CongestionStateUpdatedTrigger::Model, now);
                }
            }
        }
    }

    /// See draft-cardwell-iccrg-bbr-congestion-control-00 Section 4.2.3.
    fn set_cwnd(&mut self, tcb: &mut TransportControlBlock, rs: &DeliverySample) {
        let acked = rs.acked_sacked;

        if acked > 0 {
            let conserved = tcb.cong_state == CongestionState::Recovery
                && self.modulate_cwnd_for_recovery(tcb, rs);

            if !conserved {
                let bw = self.model.bandwidth();
                let filled = self.model.is_filled_pipe();
                self.target_cwnd = self.inflight(tcb, self.mode.cwnd_gain())
                    + self.ack_aggregation.aggregation_cwnd(bw, filled);

                if filled {
                    tcb.cwnd = (tcb.cwnd + acked).min(self.target_cwnd);
                } else if tcb.cwnd < self.target_cwnd || self.delivered < tcb.initial_window() {
                    tcb.cwnd += acked;
                }
                tcb.cwnd = tcb.cwnd.max(self.min_pipe_cwnd);
            }
        }

        if self.mode.mode() == BbrMode::ProbeRtt {
            tcb.cwnd = tcb.cwnd.min(self.min_pipe_cwnd);
        }
    }

    /// Apply losses and packet conservation. Return true if the cwnd was set
    /// by packet conservation.
    ///
    /// See draft-cardwell-iccrg-bbr-congestion-control-00 Section 4.2.3.4.
    fn modulate_cwnd_for_recovery(
        &mut self,
        tcb: &mut TransportControlBlock,
        rs: &DeliverySample,
    ) -> bool {
        if rs.bytes_loss > 0 {
            tcb.cwnd = tcb.cwnd.saturating_sub(rs.bytes_loss).max(tcb.segment_size);
        }

        if self.packet_conservation {
            tcb.cwnd = tcb.cwnd.max(tcb.bytes_in_flight + rs.acked_sacked);
            return true;
        }
        false
    }

    fn update_control_parameters(
        &mut self,
        tcb: &mut TransportControlBlock,
        rs: &DeliverySample,
    ) {
        self.set_pacing_rate_with_gain(tcb, self.mode.pacing_gain());
        self.send_quantum = tcb.segment_size;
        self.set_cwnd(tcb, rs);
        trace!(
            "{} {:?} cwnd {} pacing rate {} bw {} target {}",
            self.name(),
            self.mode.mode(),
            tcb.cwnd,
            tcb.pacing_rate,
            self.model.bandwidth(),
            self.target_cwnd
        );
    }

    /// See draft-cardwell-iccrg-bbr-congestion-control-00 Section 4.3.4.4.
    fn handle_restart_from_idle(&mut self, tcb: &mut TransportControlBlock, now: Instant) {
        if self.app_limited == 0 {
            return;
        }

        self.is_idle_restart = true;
        self.ack_aggregation.reset_epoch(now);

        match self.mode.mode() {
            BbrMode::ProbeBw => self.set_pacing_rate_with_gain(tcb, 1.0),
            BbrMode::ProbeRtt => {
                let expired = self.probe_rtt_done_stamp.map_or(false, |stamp| now > stamp);
                if self.probe_rtt_round_done && expired {
                    self.model.refresh_min_rtt_stamp(now);
                    self.restore_cwnd(tcb);
                    self.exit_probe_rtt(CongestionStateUpdatedTrigger::IdleRestart, now);
                }
            }
            BbrMode::Startup | BbrMode::Drain => (),
        }
    }
}

impl Default for Bbr {
    fn default() -> Self {
        Self::new(BbrConfig::default())
    }
}

impl CongestionController for Bbr {
    fn name(&self) -> &str {
        "BBR"
    }

    fn init(&mut self, tcb: &mut TransportControlBlock) {
        self.dctcp.init(tcb, self.config.use_ect0);
        tcb.pacing = true;
    }

    fn on_state_change(
        &mut self,
        tcb: &mut TransportControlBlock,
        state: CongestionState,
        now: Instant,
    ) {
        match state {
            CongestionState::Open if !self.is_initialized => self.init_model(tcb, now),
            CongestionState::Loss => {
                self.save_cwnd(tcb);
                self.model.set_round_start();
                self.model.reset_full_bw();
                debug!("{} loss, prior cwnd {}", self.name(), self.prior_cwnd);
            }
            CongestionState::Recovery => {
                self.save_cwnd(tcb);
                tcb.cwnd = tcb.bytes_in_flight + tcb.last_acked_sacked_bytes.max(tcb.segment_size);
                self.packet_conservation = true;
                debug!("{} recovery, cwnd {}", self.name(), tcb.cwnd);
            }
            CongestionState::Open | CongestionState::Disorder | CongestionState::Cwr => (),
        }
    }

    fn on_cwnd_event(&mut self, tcb: &mut TransportControlBlock, event: CwndEvent, now: Instant) {
        match event {
            CwndEvent::CompleteCwr => {
                self.packet_conservation = false;
                self.restore_cwnd(tcb);
            }
            CwndEvent::TxStart => self.handle_restart_from_idle(tcb, now),
            CwndEvent::EcnIsCe => self.dctcp.on_ce(tcb),
            CwndEvent::EcnNoCe => self.dctcp.on_no_ce(tcb),
            CwndEvent::DelayedAck => self.dctcp.set_delayed_ack_reserved(true),
            CwndEvent::NonDelayedAck => self.dctcp.set_delayed_ack_reserved(false),
            CwndEvent::CwndRestart | CwndEvent::Loss => (),
        }
    }

    fn has_cong_control(&self) -> bool {
        true
    }

    fn on_congestion_control(
        &mut self,
        tcb: &mut TransportControlBlock,
        rc: &mut ConnectionRateState,
        rs: &DeliverySample,
        now: Instant,
    ) {
        if !self.is_initialized {
            self.init_model(tcb, now);
        }

        self.delivered = rc.delivered;
        self.app_limited = rc.app_limited;

        self.update_model_and_state(tcb, rc, rs, now);
        self.update_control_parameters(tcb, rs);

        rc.app_limited = self.app_limited;
        self.push_metrics(tcb, now);
    }

    fn ssthresh(&mut self, tcb: &TransportControlBlock, bytes_in_flight: u64) -> u64 {
        self.save_cwnd(tcb);
        if self.has_model_ssthresh {
            tcb.ssthresh
        } else {
            self.fallback.ssthresh(tcb, bytes_in_flight)
        }
    }

    fn on_packets_acked(
        &mut self,
        tcb: &TransportControlBlock,
        segments_acked: u32,
        rtt: Duration,
        now: Instant,
    ) {
        let mut cwnd_gain = self.mode.cwnd_gain();
        let update = self.dctcp.on_packets_acked(
            tcb,
            segments_acked,
            rtt,
            self.model.min_rtt(),
            &mut cwnd_gain,
        );
        self.mode.set_cwnd_gain(cwnd_gain);

        if let Some(update) = update {
            self.push_event(
                now,
                EventData::RecoveryCongestionEstimateUpdated {
                    bytes_acked: update.bytes_acked,
                    bytes_marked: update.bytes_marked,
                    alpha: update.alpha,
                },
            );
        }

        if !rtt.is_zero() {
            if let Some(cache) = &self.rtt_cache {
                cache.push_sample_at(rtt, now);
            }
        }
    }

    fn fork(&self) -> Box<dyn CongestionController> {
        let mut bbr = self.clone();
        bbr.events.clear();
        Box::new(bbr)
    }

    fn take_events(&mut self) -> Vec<CongestionEvent> {
        self.events.drain(..).collect()
    }
}

mod ack_aggregation;
mod dctcp;
mod estimator;
mod mode;
