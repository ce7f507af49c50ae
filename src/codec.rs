//! Frame to message codec.
//!
//! Decode dispatches on the protocol number; encode produces the short
//! acknowledgement every inbound message expects, plus outbound command
//! frames. Payload layouts follow the GT06/GT06N documentation:
//!
//! | Code        | Kind             |
//! |-------------|------------------|
//! | 0x01        | Login            |
//! | 0x05        | Heartbeat        |
//! | 0x08, 0x12, 0x94 | Location    |
//! | 0x10        | LBS              |
//! | 0x13, 0x1A  | Status           |
//! | 0x15        | String           |
//! | 0x16        | Alarm            |
//! | 0x80, 0x8A  | Command response |
//!
//! Every failure is a tagged [`CodecError`] variant the connection
//! handler matches on; the codec never panics on device input.

use std::fmt;

use chrono::{DateTime, TimeZone, Utc};
use log::debug;

use crate::frame::Frame;
use crate::imei::{Imei, ImeiError, IMEI_BCD_LEN};
use crate::message::{
    Alarm, AlarmFlags, CommandResponse, DeviceStatus, Heartbeat, LbsInfo, LocationFix, Login,
    MessageBody, StringMessage, Unknown,
};

pub const PROTO_LOGIN: u8 = 0x01;
pub const PROTO_HEARTBEAT: u8 = 0x05;
pub const PROTO_LOCATION: u8 = 0x08;
pub const PROTO_LOCATION_LBS: u8 = 0x12;
pub const PROTO_LOCATION_EXT: u8 = 0x94;
pub const PROTO_LBS: u8 = 0x10;
pub const PROTO_STATUS: u8 = 0x13;
pub const PROTO_STATUS_EXT: u8 = 0x1A;
pub const PROTO_STRING: u8 = 0x15;
pub const PROTO_ALARM: u8 = 0x16;
pub const PROTO_COMMAND: u8 = 0x80;
pub const PROTO_COMMAND_RESPONSE: u8 = 0x80;
pub const PROTO_COMMAND_RESPONSE_EXT: u8 = 0x8A;

/// Language flag appended to outbound command frames (0x0002, English).
const COMMAND_LANGUAGE: [u8; 2] = [0x00, 0x02];

/// Battery voltage approximation per reported level (0..=6), millivolts.
const VOLTAGE_MV: [u16; 7] = [0, 3300, 3400, 3550, 3700, 3900, 4100];

/// GSM signal approximation per reported level (0..=4), dBm.
const GSM_DBM: [i16; 5] = [-113, -103, -93, -83, -73];

/// Errors mapping a frame to a message.
#[derive(Debug, PartialEq)]
pub enum CodecError {
    /// The login IMEI was not valid binary coded decimal.
    InvalidBcd(ImeiError),
    /// A payload ended before its fixed fields did.
    TruncatedPayload {
        protocol: u8,
        needed: usize,
        got: usize,
    },
    /// The protocol number is not one the codec knows.
    UnknownProtocol(u8),
    /// The frame checksum did not match.
    CrcMismatch { received: u16, computed: u16 },
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CodecError::InvalidBcd(e) => write!(f, "InvalidBcd: {}", e),
            CodecError::TruncatedPayload {
                protocol,
                needed,
                got,
            } => write!(
                f,
                "TruncatedPayload: protocol 0x{:02x} needs {} bytes, got {}",
                protocol, needed, got
            ),
            CodecError::UnknownProtocol(p) => write!(f, "UnknownProtocol: 0x{:02x}", p),
            CodecError::CrcMismatch { received, computed } => write!(
                f,
                "CrcMismatch: received 0x{:04x}, computed 0x{:04x}",
                received, computed
            ),
        }
    }
}

impl std::error::Error for CodecError {}

impl From<ImeiError> for CodecError {
    fn from(err: ImeiError) -> CodecError {
        CodecError::InvalidBcd(err)
    }
}

/// Decode a frame, refusing frames whose checksum failed.
pub fn decode(frame: &Frame) -> Result<MessageBody, CodecError> {
    if !frame.crc_ok {
        return Err(CodecError::CrcMismatch {
            received: frame.crc,
            computed: crate::crc::crc16_x25(&diagnostic_span(frame)),
        });
    }
    decode_lenient(frame)
}

/// Decode a frame regardless of its checksum, for diagnostics.
pub fn decode_lenient(frame: &Frame) -> Result<MessageBody, CodecError> {
    let mut r = Reader::new(frame.protocol, &frame.payload);
    match frame.protocol {
        PROTO_LOGIN => decode_login(&mut r).map(MessageBody::Login),
        PROTO_HEARTBEAT => decode_heartbeat(&mut r).map(MessageBody::Heartbeat),
        PROTO_LOCATION | PROTO_LOCATION_LBS | PROTO_LOCATION_EXT => {
            decode_location(&mut r).map(MessageBody::Location)
        }
        PROTO_LBS => decode_lbs(&mut r).map(MessageBody::LbsInfo),
        PROTO_STATUS | PROTO_STATUS_EXT => decode_status(&mut r).map(MessageBody::Status),
        PROTO_STRING => decode_string(&mut r).map(MessageBody::String),
        PROTO_ALARM => decode_alarm(&mut r).map(MessageBody::Alarm),
        PROTO_COMMAND_RESPONSE | PROTO_COMMAND_RESPONSE_EXT => {
            decode_command_response(&mut r).map(MessageBody::CommandResponse)
        }
        other => Err(CodecError::UnknownProtocol(other)),
    }
}

/// Wrap an unknown frame as a message body, for bookkeeping after the
/// handler has matched [`CodecError::UnknownProtocol`].
pub fn unknown_body(frame: &Frame) -> MessageBody {
    MessageBody::Unknown(Unknown {
        protocol: frame.protocol,
        payload: frame.payload.clone(),
    })
}

/// The short acknowledgement clearing the device's retransmit timer:
/// start `0x7878`, length 5, echoed protocol number and serial.
pub fn encode_ack(protocol: u8, serial: u16) -> Frame {
    Frame::standard(protocol, Vec::new(), serial)
}

/// An outbound command frame (0x80): length-prefixed body of the 4 byte
/// server flag and the UTF-8 command text, then the language flag.
pub fn encode_command(text: &str, server_flag: u32, serial: u16) -> Frame {
    let body_len = 4 + text.len();
    let mut payload = Vec::with_capacity(1 + body_len + 2);
    payload.push(body_len as u8);
    payload.extend_from_slice(&server_flag.to_be_bytes());
    payload.extend_from_slice(text.as_bytes());
    payload.extend_from_slice(&COMMAND_LANGUAGE);
    Frame::standard(PROTO_COMMAND, payload, serial)
}

fn decode_login(r: &mut Reader) -> Result<Login, CodecError> {
    let bcd = r.take(IMEI_BCD_LEN)?;
    let imei = Imei::from_bcd(bcd)?;
    let type_id = if r.remaining() >= 2 { Some(r.u16()?) } else { None };
    let timezone = if r.remaining() >= 2 { Some(r.u16()?) } else { None };
    Ok(Login {
        imei,
        type_id,
        timezone,
    })
}

fn decode_heartbeat(r: &mut Reader) -> Result<Heartbeat, CodecError> {
    let terminal = r.u8()?;
    let gsm_level = r.u8()?.min(4);
    // Remaining bytes are reserved.
    Ok(Heartbeat {
        ignition: terminal & 0x02 != 0,
        external_power: terminal & 0x80 == 0,
        charging: terminal & 0x04 != 0,
        gsm_level,
        gsm_dbm: GSM_DBM[usize::from(gsm_level)],
        alarm: terminal_alarm(terminal),
    })
}

fn decode_location(r: &mut Reader) -> Result<LocationFix, CodecError> {
    let device_time = decode_datetime(r)?;
    let satellites = r.u8()? & 0x0F;
    let lat_raw = r.u32()?;
    let lon_raw = r.u32()?;
    let speed_kmh = r.u8()?;
    let word = r.u16()?;

    let west = word & (1 << 10) != 0;
    let south = word & (1 << 11) != 0;
    let gps_valid = word & (1 << 12) != 0;
    let course = word & 0x03FF;

    let mut latitude = f64::from(lat_raw) / 1_800_000.0;
    let mut longitude = f64::from(lon_raw) / 1_800_000.0;
    if south {
        latitude = -latitude;
    }
    if west {
        longitude = -longitude;
    }

    // Trailing bytes (LBS block on 0x12, extension fields on 0x94) are
    // not part of the fix.
    Ok(LocationFix {
        device_time,
        latitude,
        longitude,
        speed_kmh,
        course,
        satellites,
        gps_valid,
        west,
        south,
    })
}

fn decode_lbs(r: &mut Reader) -> Result<LbsInfo, CodecError> {
    let mcc = r.u16()?;
    let mnc = r.u8()?;
    let lac = r.u16()?;
    let cell_id = r.u24()?;
    Ok(LbsInfo {
        mcc,
        mnc,
        lac,
        cell_id,
    })
}

fn decode_status(r: &mut Reader) -> Result<DeviceStatus, CodecError> {
    let terminal = r.u8()?;
    let voltage = r.u8()?;
    let gsm = r.u8()?;
    let alarm_code = r.u8()?;
    let _language = r.u8()?;
    // An optional timezone word may follow; it does not alter the status.
    Ok(status_from_parts(terminal, voltage, gsm, alarm_code))
}

fn decode_string(r: &mut Reader) -> Result<StringMessage, CodecError> {
    let len = usize::from(r.u8()?);
    let bytes = r.take(len.min(r.remaining()))?;
    Ok(StringMessage {
        text: String::from_utf8_lossy(bytes).into_owned(),
    })
}

fn decode_alarm(r: &mut Reader) -> Result<Alarm, CodecError> {
    let fix = decode_location(r)?;
    // Between the fix and the status tail sits a cell tower block whose
    // length varies by firmware; the tail is the last five bytes.
    let rest = r.rest();
    let (flags, status) = if rest.len() >= 5 {
        let tail = &rest[rest.len() - 5..];
        let status = status_from_parts(tail[0], tail[1], tail[2], tail[3]);
        (alarm_from_code(tail[3]), status)
    } else if let Some(&code) = rest.last() {
        (
            alarm_from_code(code),
            status_from_parts(0, 0, 0, code),
        )
    } else {
        (AlarmFlags::default(), status_from_parts(0, 0, 0, 0))
    };
    Ok(Alarm { fix, flags, status })
}

fn decode_command_response(r: &mut Reader) -> Result<CommandResponse, CodecError> {
    let server_flag = r.u32()?;
    let mut content = r.rest();
    // Strip the trailing language flag when the firmware appends one.
    if content.len() >= 2 && content[content.len() - 2] == 0x00 {
        let lang = content[content.len() - 1];
        if lang == 0x01 || lang == 0x02 {
            content = &content[..content.len() - 2];
        }
    }
    Ok(CommandResponse {
        server_flag,
        text: String::from_utf8_lossy(content).into_owned(),
    })
}

fn decode_datetime(r: &mut Reader) -> Result<DateTime<Utc>, CodecError> {
    let b = r.take(6)?;
    let (yy, mm, dd, hh, mi, ss) = (b[0], b[1], b[2], b[3], b[4], b[5]);
    match Utc
        .with_ymd_and_hms(
            2000 + i32::from(yy),
            u32::from(mm),
            u32::from(dd),
            u32::from(hh),
            u32::from(mi),
            u32::from(ss),
        )
        .single()
    {
        Some(t) => Ok(t),
        None => {
            debug!(
                "unparseable device date {:02}-{:02}-{:02} {:02}:{:02}:{:02}",
                yy, mm, dd, hh, mi, ss
            );
            Ok(DateTime::UNIX_EPOCH)
        }
    }
}

fn status_from_parts(terminal: u8, voltage: u8, gsm: u8, alarm_code: u8) -> DeviceStatus {
    let level = voltage.min(6);
    let gsm_level = gsm.min(4);
    let mut alarm = terminal_alarm(terminal);
    merge_alarm(&mut alarm, alarm_from_code(alarm_code));
    DeviceStatus {
        ignition: terminal & 0x02 != 0,
        external_power: terminal & 0x80 == 0,
        charging: terminal & 0x04 != 0,
        battery_mv: VOLTAGE_MV[usize::from(level)],
        battery_pct: (u16::from(level) * 100 / 6) as u8,
        gsm_dbm: GSM_DBM[usize::from(gsm_level)],
        gsm_level,
        alarm,
    }
}

/// Alarm bits 3..5 of the terminal status byte.
fn terminal_alarm(terminal: u8) -> AlarmFlags {
    let mut flags = AlarmFlags::default();
    match (terminal >> 3) & 0x07 {
        1 => flags.vibration = true,
        2 => flags.tamper = true,
        3 => flags.low_battery = true,
        4 => flags.sos = true,
        _ => {}
    }
    flags
}

/// Alarm type byte of 0x16 frames and the status tail.
fn alarm_from_code(code: u8) -> AlarmFlags {
    let mut flags = AlarmFlags::default();
    match code {
        0x01 => flags.sos = true,
        0x02 => flags.tamper = true,
        0x03 => flags.vibration = true,
        0x04 => flags.idle = true,
        0x06 => flags.over_speed = true,
        0x0E | 0x0F => flags.low_battery = true,
        _ => {}
    }
    flags
}

fn merge_alarm(into: &mut AlarmFlags, other: AlarmFlags) {
    into.sos |= other.sos;
    into.vibration |= other.vibration;
    into.tamper |= other.tamper;
    into.low_battery |= other.low_battery;
    into.over_speed |= other.over_speed;
    into.idle |= other.idle;
}

/// The CRC span of a received frame, for reporting the computed value.
fn diagnostic_span(frame: &Frame) -> Vec<u8> {
    let bytes = frame.to_bytes();
    bytes[2..bytes.len() - 4].to_vec()
}

/// Cursor over a payload with truncation-aware reads.
struct Reader<'a> {
    protocol: u8,
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(protocol: u8, buf: &'a [u8]) -> Reader<'a> {
        Reader {
            protocol,
            buf,
            pos: 0,
        }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < n {
            return Err(CodecError::TruncatedPayload {
                protocol: self.protocol,
                needed: self.pos + n,
                got: self.buf.len(),
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, CodecError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u24(&mut self) -> Result<u32, CodecError> {
        let b = self.take(3)?;
        Ok(u32::from_be_bytes([0, b[0], b[1], b[2]]))
    }

    fn u32(&mut self) -> Result<u32, CodecError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }
}
