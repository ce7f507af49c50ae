//! The `gt06_gateway` crate terminates TCP connections from fleet
//! tracking hardware speaking the GT06/GT06N binary protocol,
//! authenticates each device by its IMEI, decodes the telemetry stream
//! (positions, status, alarms, heartbeats) and fans the results out onto
//! a durable event bus for downstream consumers. Commands travelling the
//! other way are consumed from the bus and written back to the correct
//! live connection.
//!
//! The gateway keeps the bus and the session store behind narrow
//! interfaces ([`bus::EventBus`], [`bus::CommandSource`],
//! [`session::SessionStore`]); in-memory implementations back the tests
//! and single-node deployments, partitioned-log and scripted key-value
//! clients slot in for production.
//!
//! # Wire format
//!
//! A GT06 frame is `start (2) | length (1 or 2) | protocol (1) | payload
//! | serial (2) | crc (2) | stop (2)`, start `0x7878` or `0x7979`, CRC
//! CRC-16/X-25 over the length field through the serial number. Devices
//! log in with an 8 byte BCD IMEI; positions are scaled by
//! `1/1_800_000` degrees with hemisphere flags in the course/status
//! word. Every inbound message is answered with a 10 byte
//! acknowledgement echoing the protocol number and serial, which clears
//! the device's retransmit timer.
//!
//! # Architecture
//!
//! One task owns each connection: frame reassembly ([`frame`]), message
//! decode ([`codec`]), session registration ([`registry`]) and event
//! publication ([`publisher`]) all run on it, strictly serial per
//! device. Background tasks carry the publisher pump, the command
//! consumer ([`command`]) and the idle reaper ([`reaper`]). The session
//! registry is the only shared mutable state and serialises per session
//! inside the store.
//!
//! # Development notes
//!
//! Run the gateway locally with logging:
//!
//! ```sh
//! RUST_LOG=gt06_gateway=debug cargo run
//! ```
//!
//! and replay a captured login frame against it:
//!
//! ```sh
//! printf '\x78\x78\x0d\x01\x03\x53\x41\x90\x36\x70\x13\x42\x00\x01\x8c\xdd\x0d\x0a' | nc localhost 5023 | xxd
//! ```
//!
//! Most devices can be pointed at the gateway by SMS, typically
//! `SERVER,1,<host>,5023,0#` followed by `GPRSON,1#`.

pub mod bus;
pub mod codec;
pub mod command;
pub mod config;
pub mod crc;
pub mod events;
pub mod frame;
pub mod handler;
pub mod imei;
pub mod message;
pub mod publisher;
pub mod reaper;
pub mod records;
pub mod registry;
pub mod server;
pub mod session;

pub use bus::{BusError, BusRecord, CommandSource, EventBus, MemoryBus, MemoryCommandQueue};
pub use codec::CodecError;
pub use config::GatewayConfig;
pub use events::{CommandEvent, CommandPriority, SessionEvent, SessionEventKind, TelemetryEvent};
pub use frame::{Frame, FrameCodec};
pub use imei::Imei;
pub use message::{Message, MessageBody, MessageKind};
pub use server::run;
pub use session::{MemoryStore, SessionRecord, SessionStore};
