//! Typed message model.
//!
//! The codec maps each frame to one of these variants; the connection
//! handler wraps the body with the common header (IMEI, protocol number,
//! serial, receive time) once the session identity is known.

use chrono::{DateTime, Utc};

use crate::imei::Imei;

/// The kind of a decoded message, as published on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Login,
    Location,
    Status,
    Heartbeat,
    Alarm,
    String,
    LbsInfo,
    CommandResponse,
    Unknown,
}

impl MessageKind {
    /// Stable lowercase name used in bus records.
    pub fn name(self) -> &'static str {
        match self {
            MessageKind::Login => "login",
            MessageKind::Location => "location",
            MessageKind::Status => "status",
            MessageKind::Heartbeat => "heartbeat",
            MessageKind::Alarm => "alarm",
            MessageKind::String => "string",
            MessageKind::LbsInfo => "lbs",
            MessageKind::CommandResponse => "command_response",
            MessageKind::Unknown => "unknown",
        }
    }
}

/// A decoded message with its common header.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub imei: Imei,
    pub protocol: u8,
    pub serial: u16,
    pub received_at: DateTime<Utc>,
    pub body: MessageBody,
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        self.body.kind()
    }
}

/// Variant specific message contents.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageBody {
    Login(Login),
    Location(LocationFix),
    Status(DeviceStatus),
    Heartbeat(Heartbeat),
    Alarm(Alarm),
    String(StringMessage),
    LbsInfo(LbsInfo),
    CommandResponse(CommandResponse),
    Unknown(Unknown),
}

impl MessageBody {
    pub fn kind(&self) -> MessageKind {
        match self {
            MessageBody::Login(_) => MessageKind::Login,
            MessageBody::Location(_) => MessageKind::Location,
            MessageBody::Status(_) => MessageKind::Status,
            MessageBody::Heartbeat(_) => MessageKind::Heartbeat,
            MessageBody::Alarm(_) => MessageKind::Alarm,
            MessageBody::String(_) => MessageKind::String,
            MessageBody::LbsInfo(_) => MessageKind::LbsInfo,
            MessageBody::CommandResponse(_) => MessageKind::CommandResponse,
            MessageBody::Unknown(_) => MessageKind::Unknown,
        }
    }
}

/// Login request (0x01): the device announces its identity.
#[derive(Debug, Clone, PartialEq)]
pub struct Login {
    pub imei: Imei,
    /// Device type identifier, when the firmware sends one.
    pub type_id: Option<u16>,
    /// Timezone word, when the firmware sends one.
    pub timezone: Option<u16>,
}

/// A GPS position report (0x08, 0x12, 0x94 and the location part of 0x16).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocationFix {
    /// Timestamp reported by the device, UTC.
    pub device_time: DateTime<Utc>,
    /// Signed degrees; negative is south.
    pub latitude: f64,
    /// Signed degrees; negative is west.
    pub longitude: f64,
    pub speed_kmh: u8,
    /// Course over ground in degrees, 0..360.
    pub course: u16,
    pub satellites: u8,
    /// Whether the receiver reported a valid fix.
    pub gps_valid: bool,
    /// Raw west hemisphere flag from the course/status word.
    pub west: bool,
    /// Raw south hemisphere flag from the course/status word.
    pub south: bool,
}

/// Device status report (0x13, 0x1A).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeviceStatus {
    pub ignition: bool,
    pub external_power: bool,
    pub charging: bool,
    /// Approximate battery voltage derived from the reported level.
    pub battery_mv: u16,
    pub battery_pct: u8,
    /// Approximate signal strength derived from the reported level.
    pub gsm_dbm: i16,
    /// Raw GSM level, 0 (no signal) to 4 (strong).
    pub gsm_level: u8,
    /// Alarm bits raised alongside the status, if any.
    pub alarm: AlarmFlags,
}

/// Heartbeat (0x05): a terminal status byte plus GSM level, nothing else.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Heartbeat {
    pub ignition: bool,
    pub external_power: bool,
    pub charging: bool,
    pub gsm_level: u8,
    pub gsm_dbm: i16,
    pub alarm: AlarmFlags,
}

/// Alarm report (0x16): a location fix with the alarm cause.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Alarm {
    pub fix: LocationFix,
    pub flags: AlarmFlags,
    pub status: DeviceStatus,
}

/// Which alarm conditions a message signalled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AlarmFlags {
    pub sos: bool,
    pub vibration: bool,
    pub tamper: bool,
    pub low_battery: bool,
    pub over_speed: bool,
    pub idle: bool,
}

impl AlarmFlags {
    pub fn any(&self) -> bool {
        self.sos || self.vibration || self.tamper || self.low_battery || self.over_speed || self.idle
    }

    /// Names of the raised flags, for bus record attributes.
    pub fn names(&self) -> Vec<&'static str> {
        let mut out = Vec::new();
        if self.sos {
            out.push("sos");
        }
        if self.vibration {
            out.push("vibration");
        }
        if self.tamper {
            out.push("tamper");
        }
        if self.low_battery {
            out.push("low_battery");
        }
        if self.over_speed {
            out.push("over_speed");
        }
        if self.idle {
            out.push("idle");
        }
        out
    }
}

/// Free-form text message (0x15).
#[derive(Debug, Clone, PartialEq)]
pub struct StringMessage {
    pub text: String,
}

/// Cell tower observation (0x10).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LbsInfo {
    pub mcc: u16,
    pub mnc: u8,
    pub lac: u16,
    pub cell_id: u32,
}

/// Device response to a server command (0x80, 0x8A).
#[derive(Debug, Clone, PartialEq)]
pub struct CommandResponse {
    /// Server flag echoed from the originating command.
    pub server_flag: u32,
    pub text: String,
}

/// A frame whose protocol number the codec does not know.
#[derive(Debug, Clone, PartialEq)]
pub struct Unknown {
    pub protocol: u8,
    pub payload: Vec<u8>,
}
