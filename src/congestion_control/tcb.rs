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

//! Transport control block shared between a connection and its congestion
//! controller.

use std::cmp::Ordering;
use std::fmt;
use std::time::Duration;

use enumflags2::bitflags;
use enumflags2::BitFlags;
use strum_macros::EnumIter;
use strum_macros::IntoStaticStr;

/// Flags of an outgoing control segment.
#[bitflags]
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TcpFlag {
    Fin = 1 << 0,
    Syn = 1 << 1,
    Rst = 1 << 2,
    Psh = 1 << 3,
    Ack = 1 << 4,
    Urg = 1 << 5,
    /// ECN-Echo.
    Ece = 1 << 6,
    /// Congestion Window Reduced.
    Cwr = 1 << 7,
}

/// Callback used to inject an empty (pure acknowledgment) segment. It gets
/// the flags to send and the receive sequence to acknowledge.
pub type SendEmptyPacketFn = Box<dyn FnMut(BitFlags<TcpFlag>, SequenceNumber)>;

/// 32-bit wrapping sequence number.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct SequenceNumber(pub u32);

impl SequenceNumber {
    pub fn new(v: u32) -> Self {
        SequenceNumber(v)
    }

    /// Advance by `n` bytes.
    pub fn advance(self, n: u32) -> Self {
        SequenceNumber(self.0.wrapping_add(n))
    }
}

impl PartialOrd for SequenceNumber {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SequenceNumber {
    fn cmp(&self, other: &Self) -> Ordering {
        // Serial number arithmetic, see RFC 1982.
        (self.0.wrapping_sub(other.0) as i32).cmp(&0)
    }
}

/// Congestion state of the connection, following the Linux CA states.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, EnumIter, IntoStaticStr)]
pub enum CongestionState {
    /// Normal state, no dubious events.
    #[default]
    #[strum(serialize = "CA_OPEN")]
    Open,

    /// Dupacks or SACKs were received.
    #[strum(serialize = "CA_DISORDER")]
    Disorder,

    /// The window was reduced after an ECN echo.
    #[strum(serialize = "CA_CWR")]
    Cwr,

    /// Fast retransmit/recovery.
    #[strum(serialize = "CA_RECOVERY")]
    Recovery,

    /// Retransmission timeout.
    #[strum(serialize = "CA_LOSS")]
    Loss,
}

/// Events delivered to the congestion controller by the connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, EnumIter, IntoStaticStr)]
pub enum CwndEvent {
    /// First transmit when no packets are in flight.
    #[strum(serialize = "CA_EVENT_TX_START")]
    TxStart,

    /// Congestion window restart.
    #[strum(serialize = "CA_EVENT_CWND_RESTART")]
    CwndRestart,

    /// The end of congestion recovery.
    #[strum(serialize = "CA_EVENT_COMPLETE_CWR")]
    CompleteCwr,

    /// Loss timeout.
    #[strum(serialize = "CA_EVENT_LOSS")]
    Loss,

    /// A CE-marked segment was received.
    #[strum(serialize = "CA_EVENT_ECN_IS_CE")]
    EcnIsCe,

    /// A segment without CE mark was received.
    #[strum(serialize = "CA_EVENT_ECN_NO_CE")]
    EcnNoCe,

    /// A delayed acknowledgment was scheduled.
    #[strum(serialize = "CA_EVENT_DELAYED_ACK")]
    DelayedAck,

    /// An acknowledgment was sent without delay.
    #[strum(serialize = "CA_EVENT_NON_DELAYED_ACK")]
    NonDelayedAck,
}

/// ECN negotiation and signalling state of the connection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, IntoStaticStr)]
pub enum EcnState {
    /// ECN is not in use.
    #[default]
    #[strum(serialize = "ECN_DISABLED")]
    Disabled,

    /// ECN is negotiated, nothing is being signalled.
    #[strum(serialize = "ECN_IDLE")]
    Idle,

    /// The last received segment carried the CE mark.
    #[strum(serialize = "ECN_CE_RCVD")]
    CeRcvd,

    /// The receiver is echoing CE with ECE.
    #[strum(serialize = "ECN_SENDING_ECE")]
    SendingEce,

    /// The sender received an acknowledgment with ECE.
    #[strum(serialize = "ECN_ECE_RCVD")]
    EceRcvd,

    /// The sender reduced its window and set CWR.
    #[strum(serialize = "ECN_CWR_SENT")]
    CwrSent,
}

/// ECN handling mode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EcnMode {
    /// RFC 3168 behaviour.
    #[default]
    Classic,

    /// DCTCP style per-segment echo.
    Dctcp,
}

/// ECN codepoint set on outgoing data segments.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EcnCodePoint {
    #[default]
    NotEct,
    Ect1,
    Ect0,
    Ce,
}

/// Congestion state of a connection, owned by the connection and shared
/// with its congestion controller on every call.
///
/// Byte counts are in bytes and rates in bits per second.
pub struct TransportControlBlock {
    /// Congestion window.
    pub cwnd: u64,

    /// Slow start threshold.
    pub ssthresh: u64,

    /// Initial slow start threshold.
    pub initial_ssthresh: u64,

    /// Initial congestion window in segments.
    pub initial_cwnd: u64,

    /// Segment size.
    pub segment_size: u64,

    /// Bytes in flight.
    pub bytes_in_flight: u64,

    /// Bytes acked or sacked by the last acknowledgment.
    pub last_acked_sacked_bytes: u64,

    /// Whether pacing is enabled.
    pub pacing: bool,

    /// Current pacing rate.
    pub pacing_rate: u64,

    /// Upper bound of the pacing rate.
    pub max_pacing_rate: u64,

    /// Minimum RTT observed by the connection, `None` until sampled.
    pub min_rtt: Option<Duration>,

    /// Smoothed RTT, `None` until sampled.
    pub srtt: Option<Duration>,

    /// Latest RTT sample, zero until sampled.
    pub last_rtt: Duration,

    /// Congestion state.
    pub cong_state: CongestionState,

    /// Whether ECN is used.
    pub use_ecn: bool,

    /// ECN mode.
    pub ecn_mode: EcnMode,

    /// ECN signalling state.
    pub ecn_state: EcnState,

    /// ECN codepoint used on data segments.
    pub ect_code_point: EcnCodePoint,

    /// Highest cumulatively acknowledged sequence.
    pub last_acked_seq: SequenceNumber,

    /// Next sequence to transmit.
    pub next_tx_seq: SequenceNumber,

    /// Next sequence expected from the peer.
    pub rx_next_seq: SequenceNumber,

    /// Synthetic acknowledgment injection.
    pub send_empty_packet_cb: Option<SendEmptyPacketFn>,
}

impl TransportControlBlock {
    /// Create a control block with the given segment size and initial window
    /// in segments.
    pub fn new(segment_size: u64, initial_cwnd: u64) -> Self {
        Self {
            cwnd: initial_cwnd.saturating_mul(segment_size),
            ssthresh: u64::MAX,
            initial_ssthresh: u64::MAX,
            initial_cwnd,
            segment_size,
            bytes_in_flight: 0,
            last_acked_sacked_bytes: 0,
            pacing: false,
            pacing_rate: 0,
            max_pacing_rate: u64::MAX,
            min_rtt: None,
            srtt: None,
            last_rtt: Duration::ZERO,
            cong_state: CongestionState::Open,
            use_ecn: false,
            ecn_mode: EcnMode::Classic,
            ecn_state: EcnState::Disabled,
            ect_code_point: EcnCodePoint::NotEct,
            last_acked_seq: SequenceNumber::default(),
            next_tx_seq: SequenceNumber::default(),
            rx_next_seq: SequenceNumber::default(),
            send_empty_packet_cb: None,
        }
    }

    /// Initial congestion window in bytes.
    pub fn initial_window(&self) -> u64 {
        self.initial_cwnd.saturating_mul(self.segment_size)
    }

    /// Send an empty segment acknowledging `rx_next_seq`.
    pub fn send_empty_packet(&mut self, flags: BitFlags<TcpFlag>) {
        let rx_next_seq = self.rx_next_seq;
        if let Some(cb) = self.send_empty_packet_cb.as_mut() {
            cb(flags, rx_next_seq);
        }
    }
}

impl Default for TransportControlBlock {
    fn default() -> Self {
        Self::new(crate::DEFAULT_SEGMENT_SIZE, crate::DEFAULT_INITIAL_CWND)
    }
}

impl fmt::Debug for TransportControlBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportControlBlock")
            .field("cwnd", &self.cwnd)
            .field("ssthresh", &self.ssthresh)
            .field("segment_size", &self.segment_size)
            .field("bytes_in_flight", &self.bytes_in_flight)
            .field("pacing_rate", &self.pacing_rate)
            .field("min_rtt", &self.min_rtt)
            .field("last_rtt", &self.last_rtt)
            .field("cong_state", &self.cong_state)
            .field("ecn_state", &self.ecn_state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn sequence_number_wraps() {
        let a = SequenceNumber::new(u32::MAX - 10);
        let b = a.advance(20);
        assert_eq!(b, SequenceNumber::new(9));
        assert!(b > a);
        assert!(a < b);
        assert!(a >= a);
    }

    #[test]
    fn ca_names() {
        let name: &'static str = CongestionState::Recovery.into();
        assert_eq!(name, "CA_RECOVERY");
        let name: &'static str = CwndEvent::EcnIsCe.into();
        assert_eq!(name, "CA_EVENT_ECN_IS_CE");
        let name: &'static str = EcnState::EceRcvd.into();
        assert_eq!(name, "ECN_ECE_RCVD");
    }

    #[test]
    fn send_empty_packet() {
        let sent = Rc::new(RefCell::new(Vec::new()));
        let mut tcb = TransportControlBlock::new(1000, 10);
        assert_eq!(tcb.initial_window(), 10_000);

        // No callback installed.
        tcb.send_empty_packet(TcpFlag::Ack.into());

        let log = sent.clone();
        tcb.send_empty_packet_cb = Some(Box::new(move |flags, seq| {
            log.borrow_mut().push((flags, seq));
        }));
        tcb.rx_next_seq = SequenceNumber::new(4000);
        tcb.send_empty_packet(TcpFlag::Ack | TcpFlag::Ece);

        assert_eq!(
            *sent.borrow(),
            vec![(TcpFlag::Ack | TcpFlag::Ece, SequenceNumber::new(4000))]
        );
    }
}
