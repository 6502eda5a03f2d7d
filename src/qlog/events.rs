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

//! Concrete qlog event definitions for congestion control
//! - draft-ietf-quic-qlog-quic-events-06, recovery events

use serde::Deserialize;
use serde::Serialize;

/// Each event is specified as a generic object with a number of member fields
/// and their associated data.
#[serde_with::skip_serializing_none]
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Event {
    /// The "time" field indicates the timestamp at which the event occurred.
    pub time: f32,

    /// The data field is a generic object. It contains the per-event metadata
    /// and its form and semantics are defined per specific sort of event.
    #[serde(flatten)]
    pub data: EventData,

    /// The "group_id" field associates the event to a conceptual group, such
    /// as a connection in a trace holding several flows.
    pub group_id: Option<String>,
}

impl Event {
    pub fn new(time: f32, data: EventData) -> Self {
        Event {
            time,
            data,
            group_id: Default::default(),
        }
    }

    /// Return the importance of the event.
    pub fn importance(&self) -> EventImportance {
        self.data.importance()
    }
}

impl PartialEq for Event {
    fn eq(&self, other: &Event) -> bool {
        self.time == other.time && self.data == other.data && self.group_id == other.group_id
    }
}

#[serde_with::skip_serializing_none]
#[derive(Serialize, Deserialize, Clone, PartialEq, Debug)]
#[serde(tag = "name", content = "data")]
pub enum EventData {
    /// This event is emitted when one or more of the observable recovery
    /// metrics changes value.
    #[serde(rename = "recovery:metrics_updated")]
    RecoveryMetricsUpdated {
        min_rtt: Option<f32>,
        latest_rtt: Option<f32>,
        congestion_window: Option<u64>,
        bytes_in_flight: Option<u64>,
        ssthresh: Option<u64>,
        pacing_rate: Option<u64>,
        bandwidth: Option<u64>,
        pacing_gain: Option<f64>,
        cwnd_gain: Option<f64>,
    },

    /// This event signifies when the congestion controller enters a significant
    /// new state and changes its behaviour. For BBR the states are the modes
    /// of its state machine.
    #[serde(rename = "recovery:congestion_state_updated")]
    RecoveryCongestionStateUpdated {
        old: Option<String>,
        new: String,
        trigger: Option<CongestionStateUpdatedTrigger>,
    },

    /// This event is emitted at the end of each ECN observation window with
    /// the marked and total acknowledged bytes and the resulting smoothed
    /// marking fraction.
    #[serde(rename = "recovery:congestion_estimate_updated")]
    RecoveryCongestionEstimateUpdated {
        bytes_acked: u64,
        bytes_marked: u64,
        alpha: f64,
    },
}

impl EventData {
    /// Return the importance of the event data.
    pub fn importance(&self) -> EventImportance {
        use EventData::*;
        match *self {
            RecoveryMetricsUpdated { .. } => EventImportance::Core,
            RecoveryCongestionStateUpdated { .. } => EventImportance::Base,
            RecoveryCongestionEstimateUpdated { .. } => EventImportance::Extra,
        }
    }
}

/// An "importance indicator" in decreasing order of importance and expected
/// usage.
#[derive(Clone, Debug, PartialEq, PartialOrd)]
pub enum EventImportance {
    /// The "Core" events are the events that SHOULD be present in all qlog
    /// files for a given protocol.
    Core = 0,

    /// The "Base" events add additional debugging options and CAN be present
    /// in qlog files.
    Base = 1,

    /// The "Extra" events are considered mostly useful for low-level debugging
    /// of the implementation, rather than the protocol.
    Extra = 2,
}

impl EventImportance {
    /// Return true if this importance level is included by `other`.
    pub fn is_contained_in(&self, other: &EventImportance) -> bool {
        self <= other
    }
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Debug)]
#[serde(rename_all = "snake_case")]
pub enum CongestionStateUpdatedTrigger {
    /// Model driven transition.
    Model,
    /// Restart after an idle period.
    IdleRestart,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialize_congestion_state_updated() {
        let event = Event::new(
            1.5,
            EventData::RecoveryCongestionStateUpdated {
                old: Some("BBR_STARTUP".into()),
                new: "BBR_DRAIN".into(),
                trigger: Some(CongestionStateUpdatedTrigger::Model),
            },
        );
        assert_eq!(event.importance(), EventImportance::Base);
        assert_eq!(
            serde_json::to_string(&event).unwrap(),
            r#"{"time":1.5,"name":"recovery:congestion_state_updated","data":{"old":"BBR_STARTUP","new":"BBR_DRAIN","trigger":"model"}}"#
        );
    }

    #[test]
    fn serialize_metrics_updated() {
        let data = EventData::RecoveryMetricsUpdated {
            min_rtt: Some(10.0),
            latest_rtt: None,
            congestion_window: Some(14480),
            bytes_in_flight: None,
            ssthresh: None,
            pacing_rate: Some(1_000_000),
            bandwidth: None,
            pacing_gain: Some(1.25),
            cwnd_gain: None,
        };
        assert_eq!(data.importance(), EventImportance::Core);
        assert_eq!(
            serde_json::to_string(&data).unwrap(),
            r#"{"name":"recovery:metrics_updated","data":{"min_rtt":10.0,"congestion_window":14480,"pacing_rate":1000000,"pacing_gain":1.25}}"#
        );
    }

    #[test]
    fn serialize_congestion_estimate_updated() {
        let event = Event::new(
            0.0,
            EventData::RecoveryCongestionEstimateUpdated {
                bytes_acked: 1000,
                bytes_marked: 250,
                alpha: 0.5,
            },
        );
        assert_eq!(event.importance(), EventImportance::Extra);
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(
            json,
            r#"{"time":0.0,"name":"recovery:congestion_estimate_updated","data":{"bytes_acked":1000,"bytes_marked":250,"alpha":0.5}}"#
        );
        let decoded: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn serialize_state_update_triggers() {
        let cases = [
            (CongestionStateUpdatedTrigger::Model, r#""model""#),
            (CongestionStateUpdatedTrigger::IdleRestart, r#""idle_restart""#),
        ];
        for (trigger, json) in cases {
            assert_eq!(serde_json::to_string(&trigger).unwrap(), json);
        }
        assert!(serde_json::from_str::<CongestionStateUpdatedTrigger>(r#""loss""#).is_err());
    }

    #[test]
    fn event_importance_order() {
        assert!(EventImportance::Core.is_contained_in(&EventImportance::Base));
        assert!(EventImportance::Base.is_contained_in(&EventImportance::Base));
        assert!(!EventImportance::Extra.is_contained_in(&EventImportance::Base));
    }
}
