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

//! An implementation of the qlog main logging schema for congestion control
//! traces.

use std::io::Write;
use std::time::Instant;

use serde::Deserialize;
use serde::Serialize;

use self::events::Event;
use self::events::EventData;
use self::events::EventImportance;
use crate::congestion_control::CongestionEvent;
use crate::Error;
use crate::Result;

/// The qlog_version is 0.4 for draft-ietf-quic-qlog-main-schema-07
pub const QLOG_VERSION: &str = "0.4";

/// The serialization format for QlogFileSeq is JSON-SEQ
/// See RFC 7464: JavaScript Object Notation (JSON) Text Sequences
pub const JSON_TEXT_SEQS: &str = "JSON-SEQ";

/// A qlog file using the QlogFileSeq schema can be serialized to a streamable
/// JSON format called JSON Text Sequences (JSON-SEQ) ([RFC7464])
/// See draft-ietf-quic-qlog-main-schema-07
#[serde_with::skip_serializing_none]
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct QlogFileSeq {
    /// The qlog_format field MUST have the value "JSON-SEQ".
    pub qlog_format: String,

    /// The qlog_version field MUST have the value "0.4".
    pub qlog_version: String,

    /// The title field provide additional free-text information about the file.
    pub title: Option<String>,

    /// The description field provide additional free-text information about
    /// the file.
    pub description: Option<String>,

    /// The trace field contains a singular trace metadata. All qlog events in
    /// the file are related to this trace.
    pub trace: TraceSeq,
}

#[serde_with::skip_serializing_none]
#[derive(Serialize, Deserialize, Clone, PartialEq, Debug)]
pub struct TraceSeq {
    pub title: Option<String>,
    pub description: Option<String>,
    pub common_fields: Option<CommonFields>,
    pub vantage_point: VantagePoint,
}

impl TraceSeq {
    pub fn new(
        title: Option<String>,
        description: Option<String>,
        common_fields: Option<CommonFields>,
        vantage_point: VantagePoint,
    ) -> Self {
        TraceSeq {
            title,
            description,
            common_fields,
            vantage_point,
        }
    }
}

/// Describes the vantage point from which the trace originates.
#[serde_with::skip_serializing_none]
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Debug)]
pub struct VantagePoint {
    /// Name of the vantage point.
    pub name: Option<String>,

    /// Type of vantage point may be Client/Server/Network/Unknown.
    pub r#type: VantagePointType,

    /// The flow field is only required if the type is "network". It is used to
    /// disambiguate events like "packet sent" and "packet received".
    pub flow: Option<VantagePointType>,
}

impl VantagePoint {
    /// Return the VantagePoint of a data sender or receiver.
    pub fn new(name: Option<String>, is_sender: bool) -> VantagePoint {
        let vp_type = if is_sender {
            VantagePointType::Client
        } else {
            VantagePointType::Server
        };

        Self {
            name,
            r#type: vp_type,
            flow: None,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Debug)]
#[serde(rename_all = "snake_case")]
pub enum VantagePointType {
    /// Endpoint which initiates the connection
    Client,

    /// Endpoint which accepts the connection
    Server,

    /// Observer in between client and server
    Network,

    Unknown,
}

/// qlog uses the "common_fields" list to indicate fields that are shared
/// by all events in this component trace.
#[serde_with::skip_serializing_none]
#[derive(Serialize, Deserialize, Clone, Default, PartialEq, Debug)]
pub struct CommonFields {
    /// The employed format is indicated in the "time_format" field, which
    /// allows one of three values: "absolute", "delta" or "relative"
    pub time_format: Option<String>,

    /// The "reference_time" value is typically the first absolute timestamp.
    pub reference_time: Option<f64>,

    /// The "protocol_type" array field indicates to which protocols (or
    /// protocol "stacks") this event belongs. This allows a single qlog file
    /// to aggregate traces of different protocols.
    pub protocol_type: Option<Vec<String>>,

    /// A server implementation might choose to log events for all incoming
    /// connections in a single large (streamed) qlog file. As such, we need
    /// a method for splitting up events belonging to separate logical entities.
    /// The simplest way to perform this splitting is by associating a "group
    /// identifier" to each event that indicates to which conceptual "group"
    ///  each event belongs.
    pub group_id: Option<String>,
}

/// Qlog writer using the QlogFileSeq schema
pub struct QlogWriter {
    /// The top-level element in this schema that defines only a small set of
    /// "header" fields and an array of component traces.
    qlog: QlogFileSeq,

    /// Events below this level will not be written out.
    level: EventImportance,

    /// The underlying writer for qlog streaming
    writer: Box<dyn Write + Send + Sync>,

    /// Whether the top-level element (QlogFileSeq) has been written
    ready: bool,

    /// The created time for the QlogWriter
    start_time: Instant,

    /// Group of the events written, usually a flow identifier.
    group_id: Option<String>,
}

impl QlogWriter {
    pub fn new(
        title: Option<String>,
        description: Option<String>,
        trace: TraceSeq,
        level: EventImportance,
        writer: Box<dyn Write + Send + Sync>,
        start_time: Instant,
    ) -> Self {
        let qlog = QlogFileSeq {
            qlog_format: crate::qlog::JSON_TEXT_SEQS.to_string(),
            qlog_version: crate::qlog::QLOG_VERSION.to_string(),
            title,
            description,
            trace,
        };

        QlogWriter {
            qlog,
            level,
            writer,
            ready: false,
            start_time,
            group_id: None,
        }
    }

    /// Set the group id attached to every event written.
    pub fn set_group_id(&mut self, group_id: Option<String>) {
        self.group_id = group_id;
    }

    /// Start qlog serialization and write the QlogFileSeq.
    pub fn start(&mut self) -> Result<()> {
        if self.ready {
            return Err(Error::Done);
        }

        let qlog = self.qlog.clone();
        self.write_record(&qlog)?;
        self.ready = true;
        Ok(())
    }

    /// Flush qlog serialization data.
    pub fn flush(&mut self) -> Result<()> {
        if !self.ready {
            return Err(Error::InvalidState("expect ready state".into()));
        }

        self.writer.flush()?;
        Ok(())
    }

    /// Write an event in JSON-SEQ format.
    pub fn add_event(&mut self, mut event: Event) -> Result<()> {
        self.check(event.importance())?;

        if event.group_id.is_none() {
            event.group_id = self.group_id.clone();
        }
        self.write_record(&event)
    }

    /// Write an event in JSON-SEQ format.
    pub fn add_event_data(&mut self, time: Instant, event_data: EventData) -> Result<()> {
        let event = Event::new(self.relative_time(time), event_data);
        self.add_event(event)
    }

    /// Write the events drained from a congestion controller. Events below
    /// the configured level are skipped. Return the number of events written.
    pub fn add_congestion_events<I>(&mut self, events: I) -> Result<usize>
    where
        I: IntoIterator<Item = CongestionEvent>,
    {
        let mut written = 0;
        for e in events {
            match self.add_event_data(e.time, e.data) {
                Ok(()) => written += 1,
                Err(Error::Done) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(written)
    }

    /// Return whether the event should be written
    fn check(&self, ei: EventImportance) -> Result<()> {
        if !self.ready {
            return Err(Error::InvalidState("not ready".into()));
        }
        if !ei.is_contained_in(&self.level) {
            return Err(Error::Done);
        }
        Ok(())
    }

    /// Write a record separator, a JSON text and a line feed.
    fn write_record<T: Serialize>(&mut self, value: &T) -> Result<()> {
        self.writer.write_all(b"\x1e")?;
        serde_json::to_writer(self.writer.as_mut(), value)
            .map_err(|e| Error::IoError(e.to_string()))?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    /// Return the relative time for the writer.
    pub fn relative_time(&self, time: Instant) -> f32 {
        let duration = time.saturating_duration_since(self.start_time);
        duration.as_secs_f32() * 1000.0
    }
}


pub mod events;
