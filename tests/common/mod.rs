//! Shared helpers for the integration tests: a known token with
//! pre-computed cipher vectors, and a loopback UDP device simulator.

#![allow(dead_code)]

use std::net::SocketAddr;

use bytes::Bytes;
use serde_json::{Value, json};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

use miio::crypto::{Keyring, Token};
use miio::packet::Packet;

pub const TEST_TOKEN_HEX: &str = "00112233445566778899aabbccddeeff";
pub const TEST_DEVICE_ID: u32 = 0x00aa_bbcc;
pub const TEST_STAMP: u32 = 0x0000_177f;

pub fn test_token() -> Token {
    TEST_TOKEN_HEX.parse().expect("test token hex")
}

pub fn test_keyring() -> Keyring {
    Keyring::derive(&test_token())
}

pub fn hex_to_bytes(hex: &str) -> Bytes {
    Bytes::from(hex::decode(hex).expect("valid hex in test"))
}

/// How the simulated device answers data packets.
pub enum ReplyMode {
    /// Decrypt the command and answer `{"id": n, "result": ["ok"]}`.
    Echo,
    /// Never answer data packets (handshakes still work).
    Silent,
}

/// A minimal MiIO device on a loopback UDP socket: answers hello probes
/// with a handshake reply carrying `token` in the checksum field, and data
/// packets according to [`ReplyMode`].
pub struct FakeDevice {
    pub addr: SocketAddr,
    handle: JoinHandle<()>,
}

impl FakeDevice {
    pub async fn spawn(token: Token, device_id: u32, stamp: u32, mode: ReplyMode) -> FakeDevice {
        let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind fake device");
        let addr = socket.local_addr().expect("fake device addr");
        let keyring = Keyring::derive(&token);

        let handle = tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            loop {
                let Ok((len, source)) = socket.recv_from(&mut buf).await else {
                    return;
                };
                let Ok(packet) = Packet::parse(&buf[..len]) else {
                    continue;
                };
                if packet.is_handshake() {
                    let reply = Packet {
                        unknown: 0,
                        device_id,
                        stamp,
                        checksum: *token.as_bytes(),
                        payload: Bytes::new(),
                    };
                    let bytes = reply.to_bytes().expect("handshake reply");
                    let _ = socket.send_to(&bytes, source).await;
                    continue;
                }
                if matches!(mode, ReplyMode::Silent) {
                    continue;
                }
                let Ok(plaintext) = packet.decrypt_payload(&keyring) else {
                    continue;
                };
                let Ok(body) = serde_json::from_slice::<Value>(&plaintext) else {
                    continue;
                };
                let Some(id) = body.get("id").and_then(Value::as_u64) else {
                    continue;
                };
                let response = json!({ "id": id, "result": ["ok"] });
                let reply = Packet::command(
                    device_id,
                    stamp,
                    &keyring,
                    response.to_string().as_bytes(),
                )
                .expect("encode fake reply");
                let bytes = reply.to_bytes().expect("fake reply bytes");
                let _ = socket.send_to(&bytes, source).await;
            }
        });

        FakeDevice { addr, handle }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn stop(&self) {
        self.handle.abort();
    }
}

impl Drop for FakeDevice {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
