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

//! BBR state machine and its gain table.
//!
//! See draft-cardwell-iccrg-bbr-congestion-control-00 Section 3.4.

use std::time::Duration;
use std::time::Instant;

use log::*;
use strum_macros::EnumIter;
use strum_macros::IntoStaticStr;

/// BBRGainCycleLen: the number of phases in the BBR ProbeBW gain cycle:
/// 8.
pub const GAIN_CYCLE_LEN: usize = 8;

/// Pacing Gain Cycles. Each phase normally lasts for roughly BBR.RTprop.
pub const PACING_GAIN_CYCLE: [f64; GAIN_CYCLE_LEN] = [1.25, 0.75, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0];

/// Number of candidate phase offsets drawn on ProbeBW entry.
pub const PROBE_BW_PHASE_OFFSETS: usize = 6;

/// Cwnd gain used in ProbeBW.
const PROBE_BW_CWND_GAIN: f64 = 2.0;

/// BBR State Machine.
///
/// See draft-cardwell-iccrg-bbr-congestion-control-00 Section 3.4.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, EnumIter, IntoStaticStr)]
pub enum BbrMode {
    /// Ramp up sending rate rapidly to fill pipe.
    #[default]
    #[strum(serialize = "BBR_STARTUP")]
    Startup,

    /// Drain any queue created during startup.
    #[strum(serialize = "BBR_DRAIN")]
    Drain,

    /// Discover, share bw: pace around estimated bw.
    #[strum(serialize = "BBR_PROBE_BW")]
    ProbeBw,

    /// Cut inflight to min to probe min_rtt.
    #[strum(serialize = "BBR_PROBE_RTT")]
    ProbeRtt,
}

impl BbrMode {
    /// Name used in logs and qlog events.
    pub fn name(self) -> &'static str {
        self.into()
    }
}

/// Current mode, the gains it implies, and the ProbeBW cycle position.
#[derive(Debug, Clone)]
pub struct ModeController {
    /// Current mode.
    mode: BbrMode,

    /// BBR.pacing_gain: The dynamic gain factor used to scale BBR.BtlBw to
    /// produce BBR.pacing_rate.
    pacing_gain: f64,

    /// BBR.cwnd_gain: The dynamic gain factor used to scale the estimated
    /// BDP to produce a congestion window (cwnd).
    cwnd_gain: f64,

    /// Current index of pacing_gain_cycle[].
    cycle_index: usize,

    /// Last time when cycle_index is updated.
    cycle_stamp: Instant,

    /// Startup gain.
    high_gain: f64,
}

impl ModeController {
    pub fn new(high_gain: f64, now: Instant) -> Self {
        Self {
            mode: BbrMode::Startup,
            pacing_gain: high_gain,
            cwnd_gain: high_gain,
            cycle_index: 0,
            cycle_stamp: now,
            high_gain,
        }
    }

    pub fn mode(&self) -> BbrMode {
        self.mode
    }

    pub fn pacing_gain(&self) -> f64 {
        self.pacing_gain
    }

    pub fn cwnd_gain(&self) -> f64 {
        self.cwnd_gain
    }

    /// The cwnd gain is also nudged by the ECN estimator.
    pub fn set_cwnd_gain(&mut self, gain: f64) {
        self.cwnd_gain = gain;
    }

    pub fn cycle_index(&self) -> usize {
        self.cycle_index
    }

    pub fn cycle_stamp(&self) -> Instant {
        self.cycle_stamp
    }

    pub fn high_gain(&self) -> f64 {
        self.high_gain
    }

    /// Enter the Startup state. Return the mode left.
    ///
    /// See draft-cardwell-iccrg-bbr-congestion-control-00 Section 4.3.2.1.
    pub fn enter_startup(&mut self) -> BbrMode {
        let old = self.switch(BbrMode::Startup);
        self.pacing_gain = self.high_gain;
        self.cwnd_gain = self.high_gain;
        old
    }

    /// Enter the Drain state, pacing slowly while keeping the cwnd.
    ///
    /// See draft-cardwell-iccrg-bbr-congestion-control-00 Section 4.3.3.
    pub fn enter_drain(&mut self) -> BbrMode {
        let old = self.switch(BbrMode::Drain);
        self.pacing_gain = 1.0 / self.high_gain;
        self.cwnd_gain = self.high_gain;
        old
    }

    /// Enter the ProbeBW state. `offset` is a uniform draw from
    /// `[0, PROBE_BW_PHASE_OFFSETS)` picking the initial phase, never the 3/4
    /// phase.
    ///
    /// See draft-cardwell-iccrg-bbr-congestion-control-00 Section 4.3.4.3.
    pub fn enter_probe_bw(&mut self, offset: usize, now: Instant) -> BbrMode {
        let old = self.switch(BbrMode::ProbeBw);
        self.pacing_gain = 1.0;
        self.cwnd_gain = PROBE_BW_CWND_GAIN;
        self.cycle_index = GAIN_CYCLE_LEN - 1 - offset.min(PROBE_BW_PHASE_OFFSETS - 1);
        self.advance_cycle_phase(now);
        old
    }

    /// Enter the ProbeRTT state.
    ///
    /// See draft-cardwell-iccrg-bbr-congestion-control-00 Section 4.3.5.
    pub fn enter_probe_rtt(&mut self) -> BbrMode {
        let old = self.switch(BbrMode::ProbeRtt);
        self.pacing_gain = 1.0;
        self.cwnd_gain = 1.0;
        old
    }

    /// Advance cycle phase during ProbeBW state.
    pub fn advance_cycle_phase(&mut self, now: Instant) {
        self.cycle_stamp = now;
        self.cycle_index = (self.cycle_index + 1) % GAIN_CYCLE_LEN;
        self.pacing_gain = PACING_GAIN_CYCLE[self.cycle_index];
        trace!(
            "{:?} advance gain cycle to {} (gain {})",
            self.mode,
            self.cycle_index,
            self.pacing_gain
        );
    }

    /// Whether the current phase has lasted at least `min_rtt`.
    pub fn is_full_length(&self, now: Instant, min_rtt: Option<Duration>) -> bool {
        match min_rtt {
            Some(min_rtt) => now.saturating_duration_since(self.cycle_stamp) >= min_rtt,
            None => false,
        }
    }

    /// Check if it's time to advance to the next gain cycle phase in ProbeBW
    /// state. `target` is the inflight target at the current pacing gain and
    /// `bdp_target` the one at gain 1.
    pub fn is_next_cycle_phase(
        &self,
        now: Instant,
        min_rtt: Option<Duration>,
        has_losses: bool,
        prior_in_flight: u64,
        target: u64,
        bdp_target: u64,
    ) -> bool {
        let is_full_length = self.is_full_length(now, min_rtt);

        if self.pacing_gain > 1.0 {
            // Cycle gain = 5/4: wait for inflight to reach the target or for
            // losses.
            is_full_length && (has_losses || prior_in_flight >= target)
        } else if self.pacing_gain < 1.0 {
            // Cycle gain = 3/4: until a full phase elapsed or inflight drops
            // below the estimated BDP.
            is_full_length || prior_in_flight <= bdp_target
        } else {
            is_full_length
        }
    }

    fn switch(&mut self, mode: BbrMode) -> BbrMode {
        let old = self.mode;
        self.mode = mode;
        if old != mode {
            debug!("BBR mode {} -> {}", old.name(), mode.name());
        }
        old
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn mode_names() {
        let names: Vec<&str> = BbrMode::iter().map(|m| m.name()).collect();
        assert_eq!(
            names,
            vec!["BBR_STARTUP", "BBR_DRAIN", "BBR_PROBE_BW", "BBR_PROBE_RTT"]
        );
    }

    #[test]
    fn mode_gains() {
        let now = Instant::now();
        let mut mc = ModeController::new(2.89, now);
        assert_eq!(mc.mode(), BbrMode::Startup);
        assert_eq!(mc.pacing_gain(), 2.89);
        assert_eq!(mc.cwnd_gain(), 2.89);

        assert_eq!(mc.enter_drain(), BbrMode::Startup);
        assert!((mc.pacing_gain() - 1.0 / 2.89).abs() < 1e-9);
        assert_eq!(mc.cwnd_gain(), 2.89);

        assert_eq!(mc.enter_probe_bw(0, now), BbrMode::Drain);
        assert_eq!(mc.cwnd_gain(), 2.0);
        // Offset 0 starts at the last phase then advances to the first.
        assert_eq!(mc.cycle_index(), 0);
        assert_eq!(mc.pacing_gain(), 1.25);

        assert_eq!(mc.enter_probe_rtt(), BbrMode::ProbeBw);
        assert_eq!(mc.pacing_gain(), 1.0);
        assert_eq!(mc.cwnd_gain(), 1.0);

        assert_eq!(mc.enter_startup(), BbrMode::ProbeRtt);
        assert_eq!(mc.pacing_gain(), 2.89);
    }

    #[test]
    fn mode_probe_bw_never_starts_in_drain_phase() {
        let now = Instant::now();
        for offset in 0..PROBE_BW_PHASE_OFFSETS {
            let mut mc = ModeController::new(2.89, now);
            mc.enter_probe_bw(offset, now);
            assert_ne!(mc.cycle_index(), 1);
            assert_ne!(mc.cycle_index(), 2);
            assert!(mc.pacing_gain() > 0.0 && mc.cwnd_gain() > 0.0);
        }
    }

    #[test]
    fn mode_gain_cycle_sequence() {
        let now = Instant::now();
        let mut mc = ModeController::new(2.89, now);
        mc.enter_probe_bw(3, now);
        let start = mc.cycle_index();

        let mut gains = Vec::new();
        for i in 0..GAIN_CYCLE_LEN {
            gains.push(mc.pacing_gain());
            mc.advance_cycle_phase(now + Duration::from_millis(i as u64));
        }
        let expected: Vec<f64> = (0..GAIN_CYCLE_LEN)
            .map(|i| PACING_GAIN_CYCLE[(start + i) % GAIN_CYCLE_LEN])
            .collect();
        assert_eq!(gains, expected);
        assert_eq!(mc.cycle_index(), start);
    }

    #[test]
    fn mode_next_cycle_phase() {
        let now = Instant::now();
        let min_rtt = Some(Duration::from_millis(10));
        let mut mc = ModeController::new(2.89, now);
        mc.enter_probe_bw(0, now);
        assert_eq!(mc.pacing_gain(), 1.25);

        let later = now + Duration::from_millis(10);
        // Gain 5/4 needs a full phase and either losses or enough inflight.
        assert!(!mc.is_next_cycle_phase(now, min_rtt, true, 0, 100, 80));
        assert!(!mc.is_next_cycle_phase(later, min_rtt, false, 99, 100, 80));
        assert!(mc.is_next_cycle_phase(later, min_rtt, false, 100, 100, 80));
        assert!(mc.is_next_cycle_phase(later, min_rtt, true, 0, 100, 80));

        // Gain 3/4 leaves early once inflight drops to the BDP.
        mc.advance_cycle_phase(now);
        assert_eq!(mc.pacing_gain(), 0.75);
        assert!(mc.is_next_cycle_phase(now, min_rtt, false, 80, 60, 80));
        assert!(!mc.is_next_cycle_phase(now, min_rtt, false, 81, 60, 80));
        assert!(mc.is_next_cycle_phase(later, min_rtt, false, 81, 60, 80));

        // Gain 1 only waits for time, and never advances without a min RTT.
        mc.advance_cycle_phase(now);
        assert_eq!(mc.pacing_gain(), 1.0);
        assert!(!mc.is_next_cycle_phase(now, min_rtt, true, 1000, 80, 80));
        assert!(mc.is_next_cycle_phase(later, min_rtt, false, 0, 80, 80));
        assert!(!mc.is_next_cycle_phase(later, None, false, 0, 80, 80));
    }
}
