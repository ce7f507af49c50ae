//! GT06 frame reassembly.
//!
//! A frame on the wire is `start (2) | length (1 or 2) | protocol (1) |
//! payload (N) | serial (2) | crc (2) | stop (2)`. The start marker
//! `0x7878` announces a one byte length field, `0x7979` a two byte one.
//! The length counts the bytes from the protocol number through the CRC;
//! the stop sequence follows it. The CRC-16/X-25 covers the length field
//! through the serial number inclusive.
//!
//! [`FrameCodec`] reassembles frames from an arbitrary chunking of the
//! byte stream: unrecognisable bytes are skipped as noise, partial frames
//! stay buffered, and a frame is never emitted before its final byte has
//! arrived. Frames with a bad checksum are still emitted, flagged with
//! `crc_ok = false`, so the session layer can answer them without acting
//! on their contents.

use std::cmp;
use std::io;

use bytes::{Buf, BufMut, BytesMut};
use log::{debug, warn};
use tokio_util::codec::{Decoder, Encoder};

use crate::crc::crc16_x25;

/// Start marker announcing a one byte length field.
pub const START_STANDARD: [u8; 2] = [0x78, 0x78];

/// Start marker announcing a two byte length field.
pub const START_EXTENDED: [u8; 2] = [0x79, 0x79];

/// The stop sequence the protocol specifies.
pub const STOP_STANDARD: [u8; 2] = [0x0D, 0x0A];

/// Stop sequences observed from device variants in the field. All are
/// accepted; the non-standard ones are logged.
pub const STOP_ACCEPTED: [[u8; 2]; 4] = [
    STOP_STANDARD,
    [0x0A, 0x0D],
    [0x00, 0x00],
    [0xFF, 0xFF],
];

/// Default ceiling on the declared frame length.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024;

/// Default number of buffered bytes scanned for a start marker per pass.
pub const DEFAULT_SEARCH_WINDOW: usize = 100;

/// The protocol number plus serial and CRC; the smallest declarable length.
const MIN_DECLARED_LEN: usize = 5;

/// Which start marker a frame carried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartMarker {
    /// `0x7878`, one byte length field.
    Standard,
    /// `0x7979`, two byte length field.
    Extended,
}

impl StartMarker {
    fn bytes(self) -> [u8; 2] {
        match self {
            StartMarker::Standard => START_STANDARD,
            StartMarker::Extended => START_EXTENDED,
        }
    }

    fn length_field_len(self) -> usize {
        match self {
            StartMarker::Standard => 1,
            StartMarker::Extended => 2,
        }
    }
}

/// One structurally complete frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub start: StartMarker,
    pub protocol: u8,
    pub payload: Vec<u8>,
    pub serial: u16,
    pub crc: u16,
    /// Whether the received CRC matched the computed one.
    pub crc_ok: bool,
    pub stop: [u8; 2],
}

impl Frame {
    /// Build an outbound frame with a one byte length field, computing
    /// the CRC and using the standard stop sequence.
    pub fn standard(protocol: u8, payload: Vec<u8>, serial: u16) -> Frame {
        Frame::with_marker(StartMarker::Standard, protocol, payload, serial)
    }

    /// Build an outbound frame with a two byte length field.
    pub fn extended(protocol: u8, payload: Vec<u8>, serial: u16) -> Frame {
        Frame::with_marker(StartMarker::Extended, protocol, payload, serial)
    }

    fn with_marker(start: StartMarker, protocol: u8, payload: Vec<u8>, serial: u16) -> Frame {
        let mut span = Vec::with_capacity(payload.len() + 5 + start.length_field_len());
        let declared = payload.len() + MIN_DECLARED_LEN;
        match start {
            StartMarker::Standard => span.push(declared as u8),
            StartMarker::Extended => span.extend_from_slice(&(declared as u16).to_be_bytes()),
        }
        span.push(protocol);
        span.extend_from_slice(&payload);
        span.extend_from_slice(&serial.to_be_bytes());
        let crc = crc16_x25(&span);
        Frame {
            start,
            protocol,
            payload,
            serial,
            crc,
            crc_ok: true,
            stop: STOP_STANDARD,
        }
    }

    /// The declared length field value: protocol through CRC.
    pub fn declared_len(&self) -> usize {
        self.payload.len() + MIN_DECLARED_LEN
    }

    /// Serialise the frame back to its wire form. For received frames
    /// this reproduces the original bytes, stored CRC and stop included.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.declared_len() + 6);
        out.extend_from_slice(&self.start.bytes());
        match self.start {
            StartMarker::Standard => out.push(self.declared_len() as u8),
            StartMarker::Extended => {
                out.extend_from_slice(&(self.declared_len() as u16).to_be_bytes())
            }
        }
        out.push(self.protocol);
        out.extend_from_slice(&self.payload);
        out.extend_from_slice(&self.serial.to_be_bytes());
        out.extend_from_slice(&self.crc.to_be_bytes());
        out.extend_from_slice(&self.stop);
        out
    }

    /// Hex rendering of the wire form, for diagnostics and bus records.
    pub fn to_hex(&self) -> String {
        hex_string(&self.to_bytes())
    }
}

/// Render bytes as lowercase hex.
pub fn hex_string(bytes: &[u8]) -> String {
    use std::fmt::Write;

    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(s, "{:02x}", b);
    }
    s
}

/// Incremental frame decoder and encoder over a byte stream.
///
/// Stateless apart from its limits; the caller owns the accumulation
/// buffer (one per connection).
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_bytes: usize,
    search_window: usize,
}

impl Default for FrameCodec {
    fn default() -> FrameCodec {
        FrameCodec::new(DEFAULT_MAX_FRAME_BYTES, DEFAULT_SEARCH_WINDOW)
    }
}

impl FrameCodec {
    pub fn new(max_frame_bytes: usize, search_window: usize) -> FrameCodec {
        FrameCodec {
            max_frame_bytes: cmp::max(max_frame_bytes, MIN_DECLARED_LEN),
            search_window: cmp::max(search_window, 2),
        }
    }

    /// Extract the next complete frame from `buf`, leaving any partial
    /// suffix in place. Returns `None` when more input is needed.
    ///
    /// Noise in front of a start marker is discarded; a byte that could
    /// begin a marker split across reads is kept, so any chunking of the
    /// same stream yields the same frame sequence.
    pub fn decode_buf(&self, buf: &mut BytesMut) -> Option<Frame> {
        loop {
            if buf.len() < MIN_DECLARED_LEN {
                return None;
            }

            // Locate a start marker within the search window.
            let scan_end = cmp::min(buf.len() - 1, self.search_window);
            let at = (0..scan_end).find(|&i| {
                buf[i] == buf[i + 1] && (buf[i] == 0x78 || buf[i] == 0x79)
            });
            let Some(at) = at else {
                debug!("no start marker in {} buffered bytes, discarding", scan_end);
                buf.advance(scan_end);
                continue;
            };
            if at > 0 {
                debug!("skipping {} noise bytes before start marker", at);
                buf.advance(at);
                continue;
            }

            let start = if buf[0] == 0x78 {
                StartMarker::Standard
            } else {
                StartMarker::Extended
            };
            let header_len = 2 + start.length_field_len();
            if buf.len() < header_len {
                return None;
            }
            let declared = match start {
                StartMarker::Standard => usize::from(buf[2]),
                StartMarker::Extended => usize::from(u16::from_be_bytes([buf[2], buf[3]])),
            };
            if declared < MIN_DECLARED_LEN || declared > self.max_frame_bytes {
                debug!("implausible declared length {}, resynchronising", declared);
                buf.advance(1);
                continue;
            }

            let total = header_len + declared + 2;
            if buf.len() < total {
                return None;
            }

            let raw = buf.split_to(total);
            return Some(parse_complete(start, header_len, declared, &raw));
        }
    }
}

fn parse_complete(start: StartMarker, header_len: usize, declared: usize, raw: &[u8]) -> Frame {
    let body_end = header_len + declared;
    let protocol = raw[header_len];
    let payload = raw[header_len + 1..body_end - 4].to_vec();
    let serial = u16::from_be_bytes([raw[body_end - 4], raw[body_end - 3]]);
    let crc = u16::from_be_bytes([raw[body_end - 2], raw[body_end - 1]]);
    let computed = crc16_x25(&raw[2..body_end - 2]);
    let crc_ok = crc == computed;
    if !crc_ok {
        warn!(
            "CRC mismatch on protocol 0x{:02x} frame: received 0x{:04x}, computed 0x{:04x}",
            protocol, crc, computed
        );
    }
    let stop = [raw[body_end], raw[body_end + 1]];
    if stop != STOP_STANDARD {
        if STOP_ACCEPTED.contains(&stop) {
            debug!("device variant stop bits {:02x}{:02x}", stop[0], stop[1]);
        } else {
            warn!("unexpected stop bits {:02x}{:02x}, accepting frame", stop[0], stop[1]);
        }
    }
    Frame {
        start,
        protocol,
        payload,
        serial,
        crc,
        crc_ok,
        stop,
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, io::Error> {
        Ok(self.decode_buf(src))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), io::Error> {
        dst.put_slice(&frame.to_bytes());
        Ok(())
    }
}
