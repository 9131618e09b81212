//! Device discovery.
//!
//! Discovery broadcasts the unauthenticated hello probe and harvests the
//! handshake replies: each one names a device id and, for provisioned
//! devices, leaks the token in the checksum field. A reply whose checksum
//! field is all 0xFF is still a found device; it just cannot be commanded
//! until the user extracts the token through the vendor app.
//!
//! Scans run on their own ephemeral sockets and never touch the command
//! path.

use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::constants::{BUFFER_LENGTH, COMMAND_PORT, DISCOVERY_TIMEOUT, MULTICAST_ADDRESS};
use crate::crypto::Token;
use crate::error::Result;
use crate::packet::Packet;

/// One handshake reply seen during a scan.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredDevice {
    pub address: SocketAddr,
    pub device_id: u32,
    /// `None` when the device answered with the all-0xFF placeholder.
    pub token: Option<Token>,
}

pub struct Discovery {
    port: u16,
    window: std::time::Duration,
}

impl Default for Discovery {
    fn default() -> Self {
        Discovery::new()
    }
}

impl Discovery {
    pub fn new() -> Self {
        Discovery {
            port: COMMAND_PORT,
            window: DISCOVERY_TIMEOUT,
        }
    }

    /// Target port override, for tests against simulated devices.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_window(mut self, window: std::time::Duration) -> Self {
        self.window = window;
        self
    }

    /// Probe the multicast discovery address plus the caller-supplied
    /// interface broadcast addresses and collect every device that answers
    /// within the window. Per-target socket errors are logged and skipped
    /// so one dead interface cannot abort the scan.
    pub async fn probe(&self, broadcast_addresses: &[IpAddr]) -> Vec<DiscoveredDevice> {
        let mut targets: Vec<IpAddr> = vec![IpAddr::V4(MULTICAST_ADDRESS)];
        for addr in broadcast_addresses {
            if !targets.contains(addr) {
                targets.push(*addr);
            }
        }

        let mut found: Vec<DiscoveredDevice> = Vec::new();
        for target in targets {
            match self.probe_target(target).await {
                Ok(replies) => {
                    for device in replies {
                        if !found.iter().any(|d| d.address == device.address) {
                            found.push(device);
                        }
                    }
                }
                Err(e) => trace!("discovery on {target} failed: {e}"),
            }
        }
        found
    }

    async fn probe_target(&self, target: IpAddr) -> Result<Vec<DiscoveredDevice>> {
        let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
        socket.set_broadcast(true)?;
        let destination = SocketAddr::new(target, self.port);
        let hello = Packet::hello().to_bytes()?;

        // Sent twice to tolerate datagram loss
        for _ in 0..2 {
            socket.send_to(&hello, destination).await?;
        }
        debug!("sent discovery hello to {destination}");

        let mut found = Vec::new();
        let deadline = Instant::now() + self.window;
        let mut buf = [0u8; BUFFER_LENGTH];
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let (len, source) = match timeout(remaining, socket.recv_from(&mut buf)).await {
                Ok(Ok(received)) => received,
                Ok(Err(e)) => {
                    trace!("discovery receive on {target} failed: {e}");
                    break;
                }
                Err(_) => break,
            };
            match Packet::parse(&buf[..len]) {
                Ok(packet) if packet.is_handshake() => {
                    if let Some(device) = harvest(&packet, source) {
                        if !found.iter().any(|d: &DiscoveredDevice| d.address == source) {
                            found.push(device);
                        }
                    }
                }
                Ok(_) => trace!("ignoring data packet from {source} during discovery"),
                Err(e) => debug!("ignoring malformed discovery reply from {source}: {e}"),
            }
        }
        Ok(found)
    }
}

fn harvest(packet: &Packet, source: SocketAddr) -> Option<DiscoveredDevice> {
    let token = packet.token_from_checksum();
    if token.is_unset() {
        debug!(
            "discovered device {} at {source} without a token; reset the device \
             and re-run discovery from its setup network to obtain one",
            packet.device_id
        );
        Some(DiscoveredDevice {
            address: source,
            device_id: packet.device_id,
            token: None,
        })
    } else {
        debug!("discovered device {} at {source} with token {token}", packet.device_id);
        Some(DiscoveredDevice {
            address: source,
            device_id: packet.device_id,
            token: Some(token),
        })
    }
}
