//! Protobuf envelopes for bus records.
//!
//! The schemas are written out as prost structs rather than generated,
//! so the crate builds without a protoc step. Records are encoded
//! length-delimited; consumers in other languages read the same shapes
//! from the matching `.proto` definitions.

use bytes::Bytes;
use prost::Message as ProstMessage;

use crate::events::{CommandEvent, CommandFailure, SessionEvent, SessionEventKind, TelemetryEvent};
use crate::message::LocationFix;

/// Lifecycle transition kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, prost::Enumeration)]
#[repr(i32)]
pub enum SessionKind {
    SessionUnknown = 0,
    SessionConnected = 1,
    SessionDisconnected = 2,
}

/// A normalised position.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Location {
    #[prost(double, tag = "1")]
    pub latitude: f64,
    #[prost(double, tag = "2")]
    pub longitude: f64,
    #[prost(double, tag = "3")]
    pub altitude: f64,
    #[prost(uint32, tag = "4")]
    pub speed_kmh: u32,
    #[prost(uint32, tag = "5")]
    pub course: u32,
    #[prost(uint32, tag = "6")]
    pub satellites: u32,
    #[prost(bool, tag = "7")]
    pub valid: bool,
    #[prost(int64, tag = "8")]
    pub timestamp_ms: i64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Battery {
    #[prost(uint32, tag = "1")]
    pub millivolts: u32,
    #[prost(uint32, tag = "2")]
    pub percent: u32,
    #[prost(bool, tag = "3")]
    pub charging: bool,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct GsmSignal {
    #[prost(sint32, tag = "1")]
    pub dbm: i32,
    #[prost(uint32, tag = "2")]
    pub level: u32,
}

/// One decoded device message.
#[derive(Clone, PartialEq, prost::Message)]
pub struct TelemetryRecord {
    #[prost(string, tag = "1")]
    pub imei: String,
    #[prost(string, tag = "2")]
    pub message_kind: String,
    #[prost(message, optional, tag = "3")]
    pub location: Option<Location>,
    #[prost(message, optional, tag = "4")]
    pub battery: Option<Battery>,
    #[prost(message, optional, tag = "5")]
    pub gsm: Option<GsmSignal>,
    #[prost(map = "string, string", tag = "6")]
    pub attributes: std::collections::HashMap<String, String>,
    #[prost(string, tag = "7")]
    pub raw_hex: String,
    #[prost(int64, tag = "8")]
    pub at_ms: i64,
}

/// One session lifecycle transition.
#[derive(Clone, PartialEq, prost::Message)]
pub struct DeviceSessionRecord {
    #[prost(enumeration = "SessionKind", tag = "1")]
    pub kind: i32,
    #[prost(string, tag = "2")]
    pub session_id: String,
    #[prost(string, tag = "3")]
    pub imei: String,
    #[prost(string, tag = "4")]
    pub remote_addr: String,
    #[prost(uint32, tag = "5")]
    pub protocol_version: u32,
    #[prost(int64, tag = "6")]
    pub at_ms: i64,
}

/// The location subset stream.
#[derive(Clone, PartialEq, prost::Message)]
pub struct LocationRecord {
    #[prost(string, tag = "1")]
    pub imei: String,
    #[prost(message, optional, tag = "2")]
    pub location: Option<Location>,
    #[prost(int64, tag = "3")]
    pub at_ms: i64,
}

/// An outbound command, as carried on `device.command`.
#[derive(Clone, PartialEq, prost::Message)]
pub struct CommandRecord {
    #[prost(string, tag = "1")]
    pub command_id: String,
    #[prost(string, tag = "2")]
    pub imei: String,
    #[prost(string, tag = "3")]
    pub command_text: String,
    #[prost(map = "string, string", tag = "4")]
    pub parameters: std::collections::HashMap<String, String>,
    #[prost(int32, tag = "5")]
    pub priority: i32,
    #[prost(uint32, tag = "6")]
    pub retry_count: u32,
    #[prost(uint32, tag = "7")]
    pub max_retries: u32,
    #[prost(int64, tag = "8")]
    pub at_ms: i64,
}

/// Published when a command could not be delivered.
#[derive(Clone, PartialEq, prost::Message)]
pub struct CommandFailedRecord {
    #[prost(string, tag = "1")]
    pub command_id: String,
    #[prost(string, tag = "2")]
    pub imei: String,
    #[prost(string, tag = "3")]
    pub reason: String,
    #[prost(int64, tag = "4")]
    pub at_ms: i64,
}

impl From<&LocationFix> for Location {
    fn from(fix: &LocationFix) -> Location {
        Location {
            latitude: fix.latitude,
            longitude: fix.longitude,
            altitude: 0.0,
            speed_kmh: u32::from(fix.speed_kmh),
            course: u32::from(fix.course),
            satellites: u32::from(fix.satellites),
            valid: fix.gps_valid,
            timestamp_ms: fix.device_time.timestamp_millis(),
        }
    }
}

impl From<&TelemetryEvent> for TelemetryRecord {
    fn from(event: &TelemetryEvent) -> TelemetryRecord {
        TelemetryRecord {
            imei: event.imei.as_str().to_owned(),
            message_kind: event.kind.name().to_owned(),
            location: event.location.as_ref().map(Location::from),
            battery: event.battery.map(|b| Battery {
                millivolts: u32::from(b.millivolts),
                percent: u32::from(b.percent),
                charging: b.charging,
            }),
            gsm: event.gsm.map(|g| GsmSignal {
                dbm: i32::from(g.dbm),
                level: u32::from(g.level),
            }),
            attributes: event.attributes.clone(),
            raw_hex: event.raw_hex.clone(),
            at_ms: event.at.timestamp_millis(),
        }
    }
}

impl From<&SessionEvent> for DeviceSessionRecord {
    fn from(event: &SessionEvent) -> DeviceSessionRecord {
        DeviceSessionRecord {
            kind: match event.kind {
                SessionEventKind::Connected => SessionKind::SessionConnected as i32,
                SessionEventKind::Disconnected => SessionKind::SessionDisconnected as i32,
            },
            session_id: event.session_id.clone(),
            imei: event.imei.as_str().to_owned(),
            remote_addr: event.remote_addr.clone(),
            protocol_version: u32::from(event.protocol_version.unwrap_or(0)),
            at_ms: event.at.timestamp_millis(),
        }
    }
}

impl From<&CommandEvent> for CommandRecord {
    fn from(event: &CommandEvent) -> CommandRecord {
        CommandRecord {
            command_id: event.command_id.clone(),
            imei: event.imei.as_str().to_owned(),
            command_text: event.command_text.clone(),
            parameters: event.parameters.clone(),
            priority: event.priority.as_i32(),
            retry_count: event.retry_count,
            max_retries: event.max_retries,
            at_ms: event.at.timestamp_millis(),
        }
    }
}

impl From<&CommandFailure> for CommandFailedRecord {
    fn from(failure: &CommandFailure) -> CommandFailedRecord {
        CommandFailedRecord {
            command_id: failure.command_id.clone(),
            imei: failure.imei.as_str().to_owned(),
            reason: failure.reason.clone(),
            at_ms: failure.at.timestamp_millis(),
        }
    }
}

/// Encode a record length-delimited, as it travels on the bus.
pub fn encode<M: ProstMessage>(message: &M) -> Bytes {
    Bytes::from(message.encode_length_delimited_to_vec())
}
