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

//! Loss-based fallback used by model-based controllers to answer slow start
//! threshold queries before they have a model of their own.

use std::fmt;

use super::TransportControlBlock;

/// Slow start threshold provider of a loss-based algorithm.
pub trait LossBasedFallback: fmt::Debug {
    /// Name of the fallback algorithm.
    fn name(&self) -> &str;

    /// Slow start threshold to use after a congestion event.
    fn ssthresh(&self, tcb: &TransportControlBlock, bytes_in_flight: u64) -> u64;

    /// Clone into a new boxed fallback.
    fn box_clone(&self) -> Box<dyn LossBasedFallback>;
}

impl Clone for Box<dyn LossBasedFallback> {
    fn clone(&self) -> Self {
        self.box_clone()
    }
}

/// Linux Reno multiplicative decrease.
///
/// See RFC 5681 Section 3.1, equation (4).
#[derive(Debug, Clone, Copy, Default)]
pub struct LinuxReno;

impl LossBasedFallback for LinuxReno {
    fn name(&self) -> &str {
        "LinuxReno"
    }

    fn ssthresh(&self, tcb: &TransportControlBlock, bytes_in_flight: u64) -> u64 {
        // ssthresh = max (FlightSize / 2, 2*SMSS)
        (bytes_in_flight / 2).max(2 * tcb.segment_size)
    }

    fn box_clone(&self) -> Box<dyn LossBasedFallback> {
        Box::new(*self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reno_ssthresh() {
        let tcb = TransportControlBlock::new(1000, 10);
        let reno = LinuxReno;
        assert_eq!(reno.name(), "LinuxReno");

        assert_eq!(reno.ssthresh(&tcb, 20_000), 10_000);
        assert_eq!(reno.ssthresh(&tcb, 3_000), 2_000);
        assert_eq!(reno.ssthresh(&tcb, 0), 2_000);

        let boxed: Box<dyn LossBasedFallback> = Box::new(reno);
        assert_eq!(boxed.clone().ssthresh(&tcb, 8_000), 4_000);
    }
}
