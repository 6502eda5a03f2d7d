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

//! DCTCP style ECN estimator.
//!
//! The sender keeps a smoothed estimate `alpha` of the fraction of bytes that
//! were ECN marked, updated once per window of data. The receiver side
//! follows CE marking edges so that a delayed ACK does not hide a change of
//! the marking state from the peer.
//!
//! See RFC 8257 Section 3.

use std::time::Duration;

use enumflags2::BitFlags;
use log::*;

use super::super::EcnCodePoint;
use super::super::EcnMode;
use super::super::EcnState;
use super::super::SequenceNumber;
use super::super::TcpFlag;
use super::super::TransportControlBlock;

/// Upper bound of the cwnd gain raised on ECT(0) marks.
const MAX_ECN_CWND_GAIN: f64 = 2.5;

/// Lower bound of the cwnd gain lowered on ECT(1) marks.
const MIN_ECN_CWND_GAIN: f64 = 1.5;

/// Step of the cwnd gain adjustment per marked batch.
const ECN_CWND_GAIN_STEP: f64 = 0.1;

/// Result of an observation window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlphaUpdate {
    /// Bytes acknowledged in the window.
    pub bytes_acked: u64,

    /// ECN marked bytes acknowledged in the window.
    pub bytes_marked: u64,

    /// Updated alpha.
    pub alpha: f64,
}

/// DCTCP marking fraction estimator.
#[derive(Debug, Clone)]
pub struct DctcpEstimator {
    /// Smoothed fraction of marked bytes, in [0, 1].
    alpha: f64,

    /// EWMA weight.
    g: f64,

    /// Bytes acknowledged in the current window.
    acked_bytes_total: u64,

    /// Marked bytes acknowledged in the current window.
    acked_bytes_ecn: u64,

    /// End of the current observation window.
    next_seq: Option<SequenceNumber>,

    /// Whether the last received segment was CE marked.
    ce_state: bool,

    /// Receive sequence at the last CE edge.
    prior_rcv_nxt: Option<SequenceNumber>,

    /// Whether a delayed ACK is pending.
    delayed_ack_reserved: bool,

    /// Smoothed deviation of RTT samples from the min RTT, in nanoseconds.
    rtt_jitter: f64,

    /// Whether the estimator has been attached to a connection.
    initialized: bool,
}

impl DctcpEstimator {
    pub fn new(g: f64, initial_alpha: f64) -> Self {
        Self {
            alpha: initial_alpha,
            g,
            acked_bytes_total: 0,
            acked_bytes_ecn: 0,
            next_seq: None,
            ce_state: false,
            prior_rcv_nxt: None,
            delayed_ack_reserved: false,
            rtt_jitter: 0.0,
            initialized: false,
        }
    }

    /// Switch the connection to DCTCP style ECN.
    pub fn init(&mut self, tcb: &mut TransportControlBlock, use_ect0: bool) {
        tcb.use_ecn = true;
        tcb.ecn_mode = EcnMode::Dctcp;
        tcb.ect_code_point = if use_ect0 {
            EcnCodePoint::Ect0
        } else {
            EcnCodePoint::Ect1
        };
        if tcb.ecn_state == EcnState::Disabled {
            tcb.ecn_state = EcnState::Idle;
        }
        self.initialized = true;
    }

    /// Set the initial alpha.
    ///
    /// # Panics
    ///
    /// Panics if the estimator is already attached to a connection.
    pub fn set_initial_alpha(&mut self, alpha: f64) {
        assert!(!self.initialized, "DCTCP has already been initialized");
        self.alpha = alpha;
    }

    /// Account for `segments_acked` newly acknowledged segments. The cwnd
    /// gain is nudged while marked ACKs arrive. Return the window result when
    /// an observation window ends.
    pub fn on_packets_acked(
        &mut self,
        tcb: &TransportControlBlock,
        segments_acked: u32,
        rtt: Duration,
        min_rtt: Option<Duration>,
        cwnd_gain: &mut f64,
    ) -> Option<AlphaUpdate> {
        if let Some(min_rtt) = min_rtt {
            let deviation = (rtt.as_nanos() as f64 - min_rtt.as_nanos() as f64).abs();
            self.rtt_jitter = (1.0 - self.g) * self.rtt_jitter + self.g * deviation;
        }

        let bytes = u64::from(segments_acked).saturating_mul(tcb.segment_size);
        self.acked_bytes_total = self.acked_bytes_total.saturating_add(bytes);
        if tcb.ecn_state == EcnState::EceRcvd {
            self.acked_bytes_ecn = self.acked_bytes_ecn.saturating_add(bytes);
            match tcb.ect_code_point {
                EcnCodePoint::Ect0 => {
                    *cwnd_gain = MAX_ECN_CWND_GAIN.min(*cwnd_gain + ECN_CWND_GAIN_STEP)
                }
                EcnCodePoint::Ect1 => {
                    *cwnd_gain = MIN_ECN_CWND_GAIN.max(*cwnd_gain - ECN_CWND_GAIN_STEP)
                }
                EcnCodePoint::NotEct | EcnCodePoint::Ce => (),
            }
        }

        let next_seq = *self.next_seq.get_or_insert(tcb.next_tx_seq);
        if tcb.last_acked_seq < next_seq {
            return None;
        }

        // Marked fraction, M in RFC 8257.
        let fraction = if self.acked_bytes_total > 0 {
            self.acked_bytes_ecn as f64 / self.acked_bytes_total as f64
        } else {
            0.0
        };
        self.alpha = (1.0 - self.g) * self.alpha + self.g * fraction;

        let update = AlphaUpdate {
            bytes_acked: self.acked_bytes_total,
            bytes_marked: self.acked_bytes_ecn,
            alpha: self.alpha,
        };
        info!(
            "dctcp marked fraction {} alpha {} g {} cwnd gain {}",
            fraction, self.alpha, self.g, cwnd_gain
        );

        self.reset(tcb);
        Some(update)
    }

    /// Start a new observation window.
    fn reset(&mut self, tcb: &TransportControlBlock) {
        self.next_seq = Some(tcb.next_tx_seq);
        self.acked_bytes_ecn = 0;
        self.acked_bytes_total = 0;
    }

    /// A CE marked segment was received.
    pub fn on_ce(&mut self, tcb: &mut TransportControlBlock) {
        if !self.ce_state {
            // Acknowledge what was received before the mark without ECE.
            self.replay_prior_ack(tcb, TcpFlag::Ack.into());
        }

        self.prior_rcv_nxt = Some(tcb.rx_next_seq);
        self.ce_state = true;
        tcb.ecn_state = EcnState::CeRcvd;
    }

    /// A segment without CE mark was received.
    pub fn on_no_ce(&mut self, tcb: &mut TransportControlBlock) {
        if self.ce_state {
            // Acknowledge what was received before the change with ECE.
            self.replay_prior_ack(tcb, TcpFlag::Ack | TcpFlag::Ece);
        }

        self.prior_rcv_nxt = Some(tcb.rx_next_seq);
        self.ce_state = false;
        if matches!(tcb.ecn_state, EcnState::CeRcvd | EcnState::SendingEce) {
            tcb.ecn_state = EcnState::Idle;
        }
    }

    /// Track whether a delayed ACK is pending.
    pub fn set_delayed_ack_reserved(&mut self, reserved: bool) {
        self.delayed_ack_reserved = reserved;
    }

    /// Send the ACK the pending delayed ACK would have sent at the last edge.
    fn replay_prior_ack(&self, tcb: &mut TransportControlBlock, flags: BitFlags<TcpFlag>) {
        if !self.delayed_ack_reserved {
            return;
        }

        if let Some(prior_rcv_nxt) = self.prior_rcv_nxt {
            let rcv_nxt = tcb.rx_next_seq;
            tcb.rx_next_seq = prior_rcv_nxt;
            tcb.send_empty_packet(flags);
            tcb.rx_next_seq = rcv_nxt;
        }
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn ce_state(&self) -> bool {
        self.ce_state
    }

    pub fn is_delayed_ack_reserved(&self) -> bool {
        self.delayed_ack_reserved
    }

    /// Smoothed RTT jitter.
    pub fn rtt_jitter(&self) -> Duration {
        Duration::from_nanos(self.rtt_jitter as u64)
    }

    pub fn acked_bytes_total(&self) -> u64 {
        self.acked_bytes_total
    }

    pub fn acked_bytes_ecn(&self) -> u64 {
        self.acked_bytes_ecn
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    type SentLog = Rc<RefCell<Vec<(BitFlags<TcpFlag>, SequenceNumber)>>>;

    fn tcb_with_log() -> (TransportControlBlock, SentLog) {
        let mut tcb = TransportControlBlock::new(1000, 10);
        let sent: SentLog = Rc::new(RefCell::new(Vec::new()));
        let log = sent.clone();
        tcb.send_empty_packet_cb = Some(Box::new(move |flags, seq| {
            log.borrow_mut().push((flags, seq));
        }));
        (tcb, sent)
    }

    #[test]
    fn dctcp_init() {
        let mut tcb = TransportControlBlock::new(1000, 10);
        let mut dctcp = DctcpEstimator::new(0.0625, 1.0);
        dctcp.set_initial_alpha(0.5);
        dctcp.init(&mut tcb, true);

        assert!(dctcp.is_initialized());
        assert!(tcb.use_ecn);
        assert_eq!(tcb.ecn_mode, EcnMode::Dctcp);
        assert_eq!(tcb.ect_code_point, EcnCodePoint::Ect0);
        assert_eq!(tcb.ecn_state, EcnState::Idle);
        assert_eq!(dctcp.alpha(), 0.5);

        let mut tcb = TransportControlBlock::new(1000, 10);
        DctcpEstimator::new(0.0625, 1.0).init(&mut tcb, false);
        assert_eq!(tcb.ect_code_point, EcnCodePoint::Ect1);
    }

    #[test]
    #[should_panic(expected = "DCTCP has already been initialized")]
    fn dctcp_initial_alpha_after_init() {
        let mut tcb = TransportControlBlock::new(1000, 10);
        let mut dctcp = DctcpEstimator::new(0.0625, 1.0);
        dctcp.init(&mut tcb, true);
        dctcp.set_initial_alpha(0.0);
    }

    #[test]
    fn dctcp_fully_marked_keeps_alpha() {
        let mut tcb = TransportControlBlock::new(1000, 10);
        let mut dctcp = DctcpEstimator::new(0.0625, 1.0);
        dctcp.init(&mut tcb, true);
        tcb.ecn_state = EcnState::EceRcvd;
        let mut gain = 2.0;

        for i in 1..=2 {
            tcb.next_tx_seq = SequenceNumber::new(1000 * i);
            tcb.last_acked_seq = SequenceNumber::new(1000 * i);
            let update = dctcp
                .on_packets_acked(&tcb, 1, Duration::from_millis(10), None, &mut gain)
                .unwrap();
            assert_eq!(update.bytes_acked, 1000);
            assert_eq!(update.bytes_marked, 1000);
            assert_eq!(update.alpha, 1.0);
        }
        assert_eq!(dctcp.alpha(), 1.0);
    }

    #[test]
    fn dctcp_alpha_ewma() {
        let mut tcb = TransportControlBlock::new(1000, 10);
        let mut dctcp = DctcpEstimator::new(0.0625, 1.0);
        dctcp.init(&mut tcb, true);
        let mut gain = 2.0;

        // The first batch opens a window ending at the next tx sequence.
        tcb.next_tx_seq = SequenceNumber::new(10_000);
        tcb.last_acked_seq = SequenceNumber::new(1000);
        assert!(dctcp
            .on_packets_acked(&tcb, 1, Duration::ZERO, None, &mut gain)
            .is_none());

        tcb.ecn_state = EcnState::EceRcvd;
        tcb.last_acked_seq = SequenceNumber::new(4000);
        assert!(dctcp
            .on_packets_acked(&tcb, 3, Duration::ZERO, None, &mut gain)
            .is_none());
        assert_eq!(dctcp.acked_bytes_total(), 4000);
        assert_eq!(dctcp.acked_bytes_ecn(), 3000);

        tcb.ecn_state = EcnState::Idle;
        tcb.last_acked_seq = SequenceNumber::new(10_000);
        tcb.next_tx_seq = SequenceNumber::new(20_000);
        let update = dctcp
            .on_packets_acked(&tcb, 6, Duration::ZERO, None, &mut gain)
            .unwrap();
        assert_eq!(update.bytes_acked, 10_000);
        assert_eq!(update.bytes_marked, 3000);
        let expected = (1.0 - 0.0625) * 1.0 + 0.0625 * 0.3;
        assert!((update.alpha - expected).abs() < 1e-12);

        // Accumulators restart and the window moves on.
        assert_eq!(dctcp.acked_bytes_total(), 0);
        assert_eq!(dctcp.acked_bytes_ecn(), 0);
        tcb.last_acked_seq = SequenceNumber::new(15_000);
        assert!(dctcp
            .on_packets_acked(&tcb, 5, Duration::ZERO, None, &mut gain)
            .is_none());
    }

    #[test]
    fn dctcp_empty_window_counts_as_unmarked() {
        let mut tcb = TransportControlBlock::new(1000, 10);
        let mut dctcp = DctcpEstimator::new(0.5, 1.0);
        dctcp.init(&mut tcb, true);
        let mut gain = 2.0;

        let update = dctcp
            .on_packets_acked(&tcb, 0, Duration::ZERO, None, &mut gain)
            .unwrap();
        assert_eq!(update.bytes_acked, 0);
        assert_eq!(update.alpha, 0.5);
    }

    #[test]
    fn dctcp_gain_nudge() {
        let mut tcb = TransportControlBlock::new(1000, 10);
        tcb.next_tx_seq = SequenceNumber::new(1_000_000);
        let mut dctcp = DctcpEstimator::new(0.0625, 1.0);
        dctcp.init(&mut tcb, true);
        tcb.ecn_state = EcnState::EceRcvd;

        let mut gain = 2.0;
        for _ in 0..10 {
            dctcp.on_packets_acked(&tcb, 1, Duration::ZERO, None, &mut gain);
        }
        assert!((gain - 2.5).abs() < 1e-9);

        tcb.ect_code_point = EcnCodePoint::Ect1;
        for _ in 0..20 {
            dctcp.on_packets_acked(&tcb, 1, Duration::ZERO, None, &mut gain);
        }
        assert!((gain - 1.5).abs() < 1e-9);

        // Unmarked ACKs leave the gain alone.
        tcb.ecn_state = EcnState::Idle;
        dctcp.on_packets_acked(&tcb, 1, Duration::ZERO, None, &mut gain);
        assert!((gain - 1.5).abs() < 1e-9);
    }

    #[test]
    fn dctcp_rtt_jitter() {
        let tcb = TransportControlBlock::new(1000, 10);
        let mut dctcp = DctcpEstimator::new(0.5, 1.0);
        let mut gain = 2.0;
        let min_rtt = Some(Duration::from_millis(10));

        dctcp.on_packets_acked(&tcb, 1, Duration::from_millis(14), None, &mut gain);
        assert_eq!(dctcp.rtt_jitter(), Duration::ZERO);

        dctcp.on_packets_acked(&tcb, 1, Duration::from_millis(14), min_rtt, &mut gain);
        assert_eq!(dctcp.rtt_jitter(), Duration::from_millis(2));
        dctcp.on_packets_acked(&tcb, 1, Duration::from_millis(8), min_rtt, &mut gain);
        assert_eq!(dctcp.rtt_jitter(), Duration::from_millis(2));
    }

    #[test]
    fn dctcp_ce_edges_with_delayed_ack() {
        let (mut tcb, sent) = tcb_with_log();
        let mut dctcp = DctcpEstimator::new(0.0625, 1.0);
        dctcp.init(&mut tcb, true);
        dctcp.set_delayed_ack_reserved(true);

        // No prior boundary yet, nothing to replay.
        tcb.rx_next_seq = SequenceNumber::new(1000);
        dctcp.on_no_ce(&mut tcb);
        assert!(sent.borrow().is_empty());

        // 0 -> 1: replay the prior ACK without ECE.
        tcb.rx_next_seq = SequenceNumber::new(3000);
        dctcp.on_ce(&mut tcb);
        assert!(dctcp.ce_state());
        assert_eq!(tcb.ecn_state, EcnState::CeRcvd);
        assert_eq!(tcb.rx_next_seq, SequenceNumber::new(3000));
        assert_eq!(
            *sent.borrow(),
            vec![(BitFlags::from(TcpFlag::Ack), SequenceNumber::new(1000))]
        );

        // Repeated marks are not edges.
        tcb.rx_next_seq = SequenceNumber::new(4000);
        dctcp.on_ce(&mut tcb);
        assert_eq!(sent.borrow().len(), 1);

        // 1 -> 0: replay the prior ACK with ECE.
        tcb.rx_next_seq = SequenceNumber::new(6000);
        dctcp.on_no_ce(&mut tcb);
        assert!(!dctcp.ce_state());
        assert_eq!(tcb.ecn_state, EcnState::Idle);
        assert_eq!(tcb.rx_next_seq, SequenceNumber::new(6000));
        assert_eq!(
            sent.borrow()[1],
            (TcpFlag::Ack | TcpFlag::Ece, SequenceNumber::new(4000))
        );
    }

    #[test]
    fn dctcp_ce_edges_without_delayed_ack() {
        let (mut tcb, sent) = tcb_with_log();
        let mut dctcp = DctcpEstimator::new(0.0625, 1.0);
        dctcp.init(&mut tcb, true);

        dctcp.set_delayed_ack_reserved(true);
        assert!(dctcp.is_delayed_ack_reserved());
        dctcp.set_delayed_ack_reserved(false);

        tcb.rx_next_seq = SequenceNumber::new(1000);
        dctcp.on_ce(&mut tcb);
        tcb.rx_next_seq = SequenceNumber::new(2000);
        dctcp.on_no_ce(&mut tcb);
        tcb.rx_next_seq = SequenceNumber::new(3000);
        dctcp.on_ce(&mut tcb);
        assert!(sent.borrow().is_empty());

        // The ECN state is kept unless the receiver was signalling CE.
        tcb.ecn_state = EcnState::EceRcvd;
        dctcp.on_no_ce(&mut tcb);
        assert_eq!(tcb.ecn_state, EcnState::EceRcvd);
    }
}
