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

#![allow(unused_variables)]

use core::str::FromStr;
use std::fmt;
use std::time::Duration;
use std::time::Instant;

use crate::qlog::events::EventData;
use crate::Error;
use crate::Result;
pub use bbr::Bbr;
pub use bbr::BbrConfig;
pub use bbr::BbrMode;
pub use bbr::RandomSource;
pub use rate_sample::ConnectionRateState;
pub use rate_sample::DeliverySample;
pub use reno::LinuxReno;
pub use reno::LossBasedFallback;
pub use tcb::CongestionState;
pub use tcb::CwndEvent;
pub use tcb::EcnCodePoint;
pub use tcb::EcnMode;
pub use tcb::EcnState;
pub use tcb::SendEmptyPacketFn;
pub use tcb::SequenceNumber;
pub use tcb::TcpFlag;
pub use tcb::TransportControlBlock;

/// Available congestion control algorithm
#[repr(C)]
#[derive(Eq, PartialEq, Debug, Clone, Copy, Default)]
pub enum CongestionControlAlgorithm {
    /// BBR uses recent measurements of a transport connection's delivery rate
    /// and round-trip time to build an explicit model of the network path,
    /// here combined with a DCTCP style estimator of the ECN marking fraction
    /// and tolerance of ACK aggregation.
    #[default]
    Bbr,
}

impl FromStr for CongestionControlAlgorithm {
    type Err = Error;

    fn from_str(algor: &str) -> Result<CongestionControlAlgorithm> {
        if algor.eq_ignore_ascii_case("bbr") {
            Ok(CongestionControlAlgorithm::Bbr)
        } else {
            Err(Error::InvalidConfig("unknown".into()))
        }
    }
}

/// An observability event queued by a congestion controller.
#[derive(Debug, Clone, PartialEq)]
pub struct CongestionEvent {
    /// Time at which the event occurred.
    pub time: Instant,

    /// Event payload.
    pub data: EventData,
}

/// Congestion control interfaces invoked by the transport connection.
///
/// All calls of an instance are serial. Time dependent calls take the
/// current time.
pub trait CongestionController {
    /// Name of congestion control algorithm.
    fn name(&self) -> &str;

    /// Attach the controller to a connection.
    fn init(&mut self, tcb: &mut TransportControlBlock);

    /// Callback before the connection enters a new congestion state.
    fn on_state_change(
        &mut self,
        tcb: &mut TransportControlBlock,
        state: CongestionState,
        now: Instant,
    );

    /// Callback for window events.
    fn on_cwnd_event(&mut self, tcb: &mut TransportControlBlock, event: CwndEvent, now: Instant);

    /// Whether the controller sets the cwnd and the pacing rate itself from
    /// delivery samples.
    fn has_cong_control(&self) -> bool {
        false
    }

    /// Callback for each delivery sample.
    fn on_congestion_control(
        &mut self,
        tcb: &mut TransportControlBlock,
        rc: &mut ConnectionRateState,
        rs: &DeliverySample,
        now: Instant,
    ) {
    }

    /// Slow start threshold after a congestion event.
    fn ssthresh(&mut self, tcb: &TransportControlBlock, bytes_in_flight: u64) -> u64;

    /// Callback for a batch of acknowledged segments.
    fn on_packets_acked(
        &mut self,
        tcb: &TransportControlBlock,
        segments_acked: u32,
        rtt: Duration,
        now: Instant,
    ) {
    }

    /// Copy the controller with all its state.
    fn fork(&self) -> Box<dyn CongestionController>;

    /// Drain the pending observability events.
    fn take_events(&mut self) -> Vec<CongestionEvent> {
        Vec::new()
    }
}

impl fmt::Debug for dyn CongestionController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "congestion controller {}.", self.name())
    }
}

/// Build a congestion controller.
pub fn build_congestion_controller(conf: &BbrConfig) -> Box<dyn CongestionController> {
    Box::new(Bbr::new(conf.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn congestion_control_name() {
        let cases = [
            ("bbr", Ok(CongestionControlAlgorithm::Bbr)),
            ("Bbr", Ok(CongestionControlAlgorithm::Bbr)),
            ("BBR", Ok(CongestionControlAlgorithm::Bbr)),
            ("cubic", Err(Error::InvalidConfig("unknown".into()))),
        ];

        for (name, algor) in cases {
            assert_eq!(CongestionControlAlgorithm::from_str(name), algor);
        }
    }

    #[test]
    fn congestion_control_build() {
        let mut cc = build_congestion_controller(&BbrConfig::default());
        assert_eq!(cc.name(), "BBR");
        assert!(cc.has_cong_control());
        assert_eq!(format!("{:?}", cc), "congestion controller BBR.");

        let mut tcb = TransportControlBlock::default();
        let now = Instant::now();
        cc.init(&mut tcb);
        cc.on_state_change(&mut tcb, CongestionState::Open, now);
        assert!(tcb.pacing);
        assert_eq!(tcb.ecn_mode, EcnMode::Dctcp);
        assert!(tcb.pacing_rate > 0);
        assert!(cc.take_events().is_empty());
    }
}

#[path = "bbr/bbr.rs"]
mod bbr;

mod minmax;
mod rate_sample;
mod reno;
mod tcb;
