//! Per-device session state.
//!
//! Tracks the handshake lifecycle, the device identifier and clock stamp
//! learned from it, and the monotonically increasing request-id counter.
//! The session owns no I/O; [`crate::device::MiIoDevice`] drives it.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::constants::STAMP_TTL;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Handshaking,
    Ready,
    Disconnected,
}

#[derive(Debug)]
pub struct DeviceSession {
    addr: SocketAddr,
    state: SessionState,
    device_id: u32,
    stamp: u32,
    stamp_at: Option<Instant>,
    stamp_ttl: Duration,
    last_id: u32,
}

impl DeviceSession {
    /// `last_id` carries the request-id counter forward from a previous
    /// session so ids stay unique and increasing across reconnects.
    pub fn new(addr: SocketAddr, last_id: u32) -> Self {
        DeviceSession {
            addr,
            state: SessionState::Uninitialized,
            device_id: 0,
            stamp: 0,
            stamp_at: None,
            stamp_ttl: STAMP_TTL,
            last_id,
        }
    }

    /// Override how long a handshake stamp stays usable before the session
    /// must re-handshake.
    pub fn with_stamp_ttl(mut self, ttl: Duration) -> Self {
        self.stamp_ttl = ttl;
        self
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn device_id(&self) -> u32 {
        self.device_id
    }

    pub fn last_id(&self) -> u32 {
        self.last_id
    }

    /// Return the next request id. Unique and increasing for the lifetime of
    /// the process; stale in-flight responses can never alias a new request.
    pub fn next_request_id(&mut self) -> u32 {
        self.last_id = self.last_id.wrapping_add(1);
        self.last_id
    }

    /// The hello packet is on the wire; a reply will complete the handshake.
    pub fn begin_handshake(&mut self) {
        if self.state != SessionState::Ready {
            self.state = SessionState::Handshaking;
        }
    }

    /// Record the device id and clock stamp from a handshake reply.
    pub fn complete_handshake(&mut self, device_id: u32, stamp: u32) {
        debug!("handshake with {}: device id {device_id}, stamp {stamp}", self.addr);
        self.device_id = device_id;
        self.stamp = stamp;
        self.stamp_at = Some(Instant::now());
        self.state = SessionState::Ready;
    }

    /// An unrecoverable I/O or crypto fault; the caller clears its queue and
    /// re-handshakes lazily on next use. The id counter survives.
    pub fn mark_disconnected(&mut self) {
        debug!("session with {} disconnected", self.addr);
        self.state = SessionState::Disconnected;
        self.stamp_at = None;
    }

    pub fn is_ready(&self) -> bool {
        self.state == SessionState::Ready && !self.stamp_expired()
    }

    /// The stamp is a cached value with a capture time; once it expires the
    /// session must re-handshake before sending.
    pub fn stamp_expired(&self) -> bool {
        match self.stamp_at {
            Some(at) => at.elapsed() > self.stamp_ttl,
            None => true,
        }
    }

    /// Device-relative clock for outgoing packets: the handshake stamp plus
    /// the seconds elapsed since it was captured.
    pub fn current_stamp(&self) -> Option<u32> {
        let at = self.stamp_at?;
        Some(self.stamp.wrapping_add(at.elapsed().as_secs() as u32))
    }
}
