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

//! Inputs produced by the connection's delivery rate estimator.
//!
//! See
//! <https://datatracker.ietf.org/doc/html/draft-cheng-iccrg-delivery-rate-estimation-02>.

use std::time::Duration;

/// Rate sample generated for one acknowledgment.
///
/// See
/// <https://datatracker.ietf.org/doc/html/draft-cheng-iccrg-delivery-rate-estimation-02#section-3.1.3>.
#[derive(Debug, Clone, Default)]
pub struct DeliverySample {
    /// rs.delivery_rate: The delivery rate sample in bits per second.
    pub delivery_rate: u64,

    /// rs.interval: The length of the sampling interval.
    pub interval: Duration,

    /// rs.is_app_limited: Whether the rate sample is application-limited.
    pub is_app_limited: bool,

    /// rs.prior_delivered: The P.delivered count from the most recent packet
    /// delivered.
    pub prior_delivered: u64,

    /// The amount of data in flight before this acknowledgment.
    pub prior_in_flight: u64,

    /// Bytes newly marked lost by this acknowledgment.
    pub bytes_loss: u64,

    /// Bytes newly acked or sacked by this acknowledgment.
    pub acked_sacked: u64,

    /// rs.delivered: The amount of data marked as delivered over the sampling
    /// interval. Negative if no valid sample was produced.
    pub delivered: i64,
}

impl DeliverySample {
    /// Whether the sample can be used to update the path model.
    pub fn is_valid(&self) -> bool {
        self.delivered >= 0 && !self.interval.is_zero()
    }
}

/// Connection-wide delivery state.
#[derive(Debug, Clone, Default)]
pub struct ConnectionRateState {
    /// C.delivered: The total amount of data delivered so far.
    pub delivered: u64,

    /// C.app_limited: The delivered mark at which the connection stops being
    /// application-limited, or 0 if it is not application-limited.
    pub app_limited: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivery_sample_validity() {
        let mut rs = DeliverySample {
            delivered: 1000,
            interval: Duration::from_millis(10),
            ..DeliverySample::default()
        };
        assert!(rs.is_valid());

        rs.delivered = -1;
        assert!(!rs.is_valid());

        rs.delivered = 0;
        assert!(rs.is_valid());

        rs.interval = Duration::ZERO;
        assert!(!rs.is_valid());
    }
}
