//! Domain events crossing the session boundary.
//!
//! Session lifecycle events and per-message telemetry events are the
//! gateway's outputs; command events are its input from the bus. All of
//! them are keyed by IMEI downstream so per-device order survives
//! partitioning.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::imei::Imei;
use crate::message::{LocationFix, Message, MessageBody, MessageKind};

/// Which side of the session boundary an event marks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEventKind {
    Connected,
    Disconnected,
}

impl SessionEventKind {
    pub fn name(self) -> &'static str {
        match self {
            SessionEventKind::Connected => "connected",
            SessionEventKind::Disconnected => "disconnected",
        }
    }
}

/// Emitted on every session lifecycle transition.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionEvent {
    pub kind: SessionEventKind,
    pub session_id: String,
    pub imei: Imei,
    pub remote_addr: String,
    /// Device type identifier from the login frame, when sent.
    pub protocol_version: Option<u16>,
    pub at: DateTime<Utc>,
}

/// Battery state extracted from status-bearing messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Battery {
    pub millivolts: u16,
    pub percent: u8,
    pub charging: bool,
}

/// GSM signal extracted from status-bearing messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GsmSignal {
    pub dbm: i16,
    pub level: u8,
}

/// One decoded, non-acknowledgement message, flattened for the bus.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryEvent {
    pub imei: Imei,
    pub kind: MessageKind,
    pub location: Option<LocationFix>,
    pub battery: Option<Battery>,
    pub gsm: Option<GsmSignal>,
    pub attributes: HashMap<String, String>,
    pub raw_hex: String,
    pub at: DateTime<Utc>,
}

impl TelemetryEvent {
    /// Flatten a decoded message into its bus shape.
    pub fn from_message(message: &Message, raw_hex: String) -> TelemetryEvent {
        let mut event = TelemetryEvent {
            imei: message.imei.clone(),
            kind: message.kind(),
            location: None,
            battery: None,
            gsm: None,
            attributes: HashMap::new(),
            raw_hex,
            at: message.received_at,
        };
        match &message.body {
            MessageBody::Login(login) => {
                if let Some(type_id) = login.type_id {
                    event.set("device_type", type_id.to_string());
                }
                if let Some(tz) = login.timezone {
                    event.set("timezone", tz.to_string());
                }
            }
            MessageBody::Location(fix) => {
                event.location = Some(*fix);
            }
            MessageBody::Status(status) => {
                event.battery = Some(Battery {
                    millivolts: status.battery_mv,
                    percent: status.battery_pct,
                    charging: status.charging,
                });
                event.gsm = Some(GsmSignal {
                    dbm: status.gsm_dbm,
                    level: status.gsm_level,
                });
                event.set("ignition", status.ignition.to_string());
                event.set("external_power", status.external_power.to_string());
                if status.alarm.any() {
                    event.set("alarms", status.alarm.names().join(","));
                }
            }
            MessageBody::Heartbeat(hb) => {
                event.gsm = Some(GsmSignal {
                    dbm: hb.gsm_dbm,
                    level: hb.gsm_level,
                });
                event.set("ignition", hb.ignition.to_string());
                event.set("external_power", hb.external_power.to_string());
                if hb.alarm.any() {
                    event.set("alarms", hb.alarm.names().join(","));
                }
            }
            MessageBody::Alarm(alarm) => {
                event.location = Some(alarm.fix);
                event.battery = Some(Battery {
                    millivolts: alarm.status.battery_mv,
                    percent: alarm.status.battery_pct,
                    charging: alarm.status.charging,
                });
                event.gsm = Some(GsmSignal {
                    dbm: alarm.status.gsm_dbm,
                    level: alarm.status.gsm_level,
                });
                event.set("alarms", alarm.flags.names().join(","));
            }
            MessageBody::String(s) => {
                event.set("text", s.text.clone());
            }
            MessageBody::LbsInfo(lbs) => {
                event.set("mcc", lbs.mcc.to_string());
                event.set("mnc", lbs.mnc.to_string());
                event.set("lac", lbs.lac.to_string());
                event.set("cell_id", lbs.cell_id.to_string());
            }
            MessageBody::CommandResponse(resp) => {
                event.set("server_flag", resp.server_flag.to_string());
                event.set("response", resp.text.clone());
            }
            MessageBody::Unknown(unknown) => {
                event.set("protocol", format!("0x{:02x}", unknown.protocol));
            }
        }
        event
    }

    fn set(&mut self, key: &str, value: String) {
        self.attributes.insert(key.to_owned(), value);
    }
}

/// Coarse ordering applied within one IMEI's command queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum CommandPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl CommandPriority {
    pub fn from_i32(value: i32) -> CommandPriority {
        match value {
            0 => CommandPriority::Low,
            2 => CommandPriority::High,
            3 => CommandPriority::Critical,
            _ => CommandPriority::Normal,
        }
    }

    pub fn as_i32(self) -> i32 {
        match self {
            CommandPriority::Low => 0,
            CommandPriority::Normal => 1,
            CommandPriority::High => 2,
            CommandPriority::Critical => 3,
        }
    }
}

/// A command for a device, delivered from the bus.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandEvent {
    pub command_id: String,
    pub imei: Imei,
    pub command_text: String,
    pub parameters: HashMap<String, String>,
    pub priority: CommandPriority,
    pub retry_count: u32,
    pub max_retries: u32,
    pub at: DateTime<Utc>,
}

/// Published when a command exhausts its retries undelivered.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandFailure {
    pub command_id: String,
    pub imei: Imei,
    pub reason: String,
    pub at: DateTime<Utc>,
}
