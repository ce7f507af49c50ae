//! A minimal GT06 device simulator for poking a running gateway.
//!
//! Logs in with a fixed IMEI, then alternates heartbeats and location
//! fixes on a short interval, printing every acknowledgement the
//! gateway returns. Start the gateway first, then:
//!
//! ```sh
//! RUST_LOG=info cargo run --example simulator -- 127.0.0.1:5023
//! ```

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use log::{error, info};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use gt06_gateway::codec;
use gt06_gateway::frame::{Frame, FrameCodec};

const IMEI_BCD: [u8; 8] = [0x01, 0x23, 0x45, 0x67, 0x89, 0x01, 0x23, 0x45];

fn location_payload(tick: u32) -> Vec<u8> {
    // A fix drifting north-east from a base position, valid, 7 sats.
    let mut payload = vec![0x19, 0x06, 0x01, 0x0C, 0x00, 0x00, 0xC7];
    payload.extend_from_slice(&(40_594_680 + tick * 1_800).to_be_bytes());
    payload.extend_from_slice(&(205_596_000 + tick * 1_800).to_be_bytes());
    payload.push(0x28);
    payload.extend_from_slice(&((1u16 << 12) | 120).to_be_bytes());
    payload
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:5023".to_owned());
    let socket = match TcpStream::connect(&addr).await {
        Ok(socket) => socket,
        Err(e) => {
            error!("cannot reach gateway at {}: {}", addr, e);
            return;
        }
    };
    info!("connected to {}", addr);

    let mut framed = Framed::new(socket, FrameCodec::default());
    let mut serial: u16 = 1;
    if let Err(e) = framed
        .send(Frame::standard(codec::PROTO_LOGIN, IMEI_BCD.to_vec(), serial))
        .await
    {
        error!("login write failed: {}", e);
        return;
    }

    let mut ticker = tokio::time::interval(Duration::from_secs(5));
    let mut tick: u32 = 0;
    loop {
        tokio::select! {
            ack = framed.next() => match ack {
                Some(Ok(frame)) => info!(
                    "gateway answered protocol 0x{:02x} serial {}",
                    frame.protocol, frame.serial
                ),
                Some(Err(e)) => {
                    error!("read failed: {}", e);
                    return;
                }
                None => {
                    info!("gateway closed the connection");
                    return;
                }
            },
            _ = ticker.tick() => {
                serial = serial.wrapping_add(1);
                tick += 1;
                let frame = if tick % 3 == 0 {
                    Frame::standard(codec::PROTO_HEARTBEAT, vec![0x06, 0x04, 0x00, 0x01], serial)
                } else {
                    Frame::standard(codec::PROTO_LOCATION, location_payload(tick), serial)
                };
                info!("sending protocol 0x{:02x} serial {}", frame.protocol, serial);
                if let Err(e) = framed.send(frame).await {
                    error!("write failed: {}", e);
                    return;
                }
            }
        }
    }
}
