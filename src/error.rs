use std::io;
use std::time::Duration;

use thiserror::Error;

/// The primary error type for the `miio-rs` library.
#[derive(Error, Debug)]
pub enum MiIoError {
    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    #[error("packet checksum mismatch")]
    ChecksumMismatch,

    #[error("payload decryption failed (invalid padding or wrong token)")]
    Decryption,

    #[error("crypto configuration error: {0}")]
    CryptoConfiguration(String),

    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    #[error("no handshake reply within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("no response for request {0} within {1:?}")]
    RequestTimeout(u32, Duration),

    #[error("packet of {0} bytes exceeds the 16-bit length field")]
    PacketTooLarge(usize),

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl From<serde_json::Error> for MiIoError {
    fn from(e: serde_json::Error) -> Self {
        MiIoError::Protocol(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, MiIoError>;
