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

//! A BBR congestion controller with a DCTCP style ECN estimator.
//!
//! The controller is driven by a transport connection through the
//! [`CongestionController`] trait. On every acknowledgment the connection
//! hands over a delivery rate sample, and the controller updates its model
//! of the path (bottleneck bandwidth and round-trip propagation time) to set
//! the congestion window and the pacing rate.
//!
//! ## Features
//!
//! * **BBR v1**: Startup, Drain, ProbeBW and ProbeRTT modes, with packet
//!   conservation during recovery.
//! * **ECN**: the fraction of CE marked bytes is estimated per window of data
//!   as in DCTCP (RFC 8257), and ECN-Echo feedback nudges the cwnd gain.
//! * **ACK aggregation**: the excess of acknowledged bytes over the
//!   bandwidth estimate is added to the cwnd target.
//! * **Observability**: mode transitions, metrics and marking fraction
//!   updates are queued as qlog events, and recent RTT samples can be shared
//!   through an [`RttSampleCache`].
//!
//! ## Get started
//!
//! ```
//! use std::time::Instant;
//! use bbr_ecn::{build_congestion_controller, BbrConfig, CongestionState};
//! use bbr_ecn::{CongestionController, TransportControlBlock};
//!
//! let mut tcb = TransportControlBlock::default();
//! let mut cc = build_congestion_controller(&BbrConfig::default());
//! cc.init(&mut tcb);
//! cc.on_state_change(&mut tcb, CongestionState::Open, Instant::now());
//! assert!(tcb.pacing);
//! ```

/// Default segment size in bytes.
pub const DEFAULT_SEGMENT_SIZE: u64 = 1448;

/// Default initial congestion window in segments.
pub const DEFAULT_INITIAL_CWND: u64 = 10;

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    #[ctor::ctor]
    fn init() {
        env_logger::builder()
            .filter_level(log::LevelFilter::Trace)
            .format_timestamp_millis()
            .is_test(true)
            .init();
    }
}

pub use crate::congestion_control::build_congestion_controller;
pub use crate::congestion_control::Bbr;
pub use crate::congestion_control::BbrConfig;
pub use crate::congestion_control::BbrMode;
pub use crate::congestion_control::CongestionControlAlgorithm;
pub use crate::congestion_control::CongestionController;
pub use crate::congestion_control::CongestionEvent;
pub use crate::congestion_control::CongestionState;
pub use crate::congestion_control::ConnectionRateState;
pub use crate::congestion_control::CwndEvent;
pub use crate::congestion_control::DeliverySample;
pub use crate::congestion_control::EcnCodePoint;
pub use crate::congestion_control::EcnMode;
pub use crate::congestion_control::EcnState;
pub use crate::congestion_control::LinuxReno;
pub use crate::congestion_control::LossBasedFallback;
pub use crate::congestion_control::RandomSource;
pub use crate::congestion_control::SendEmptyPacketFn;
pub use crate::congestion_control::SequenceNumber;
pub use crate::congestion_control::TcpFlag;
pub use crate::congestion_control::TransportControlBlock;
pub use crate::error::Error;
pub use crate::rtt_cache::RttSample;
pub use crate::rtt_cache::RttSampleCache;

#[path = "congestion_control/congestion_control.rs"]
mod congestion_control;

#[path = "qlog/qlog.rs"]
pub mod qlog;

pub mod error;
pub mod rtt_cache;
