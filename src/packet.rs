//! The MiIO wire format.
//!
//! Every datagram starts with a fixed 32-byte big-endian header followed by
//! an optional AES-encrypted JSON body:
//!
//! ```text
//! | magic (2) | length (2) | unknown (4) | device_id (4) | stamp (4) | checksum (16) | payload |
//! ```
//!
//! `length` covers the whole packet including the header. The checksum is
//! MD5 over the header with the device token substituted into the checksum
//! slot, followed by the encrypted payload. A packet with no payload is a
//! handshake probe or reply and never touches the cipher; its checksum field
//! carries the device token on discovery replies.

use bytes::Bytes;
use md5::{Digest, Md5};
use zerocopy::byteorder::big_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::constants::{CHECKSUM_SIZE, HEADER_SIZE, MAGIC};
use crate::crypto::{Keyring, Token};
use crate::error::{MiIoError, Result};

/// Raw wire header, parsed in place.
#[derive(Debug, Clone, Copy, PartialEq, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct Header {
    magic: U16,
    length: U16,
    unknown: U32,
    device_id: U32,
    stamp: U32,
    checksum: [u8; CHECKSUM_SIZE],
}

/// A decoded MiIO packet: header fields plus the (still encrypted) payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub unknown: u32,
    pub device_id: u32,
    pub stamp: u32,
    pub checksum: [u8; CHECKSUM_SIZE],
    pub payload: Bytes,
}

impl Packet {
    /// The unauthenticated "hello" probe used for discovery and handshake:
    /// header-only, every field after the length set to 0xFF.
    pub fn hello() -> Self {
        Packet {
            unknown: 0xffff_ffff,
            device_id: 0xffff_ffff,
            stamp: 0xffff_ffff,
            checksum: [0xff; CHECKSUM_SIZE],
            payload: Bytes::new(),
        }
    }

    /// Build an encrypted command packet for a session that completed the
    /// handshake. The checksum is computed over header and ciphertext with
    /// the token in the checksum slot.
    pub fn command(
        device_id: u32,
        stamp: u32,
        keyring: &Keyring,
        plaintext: &[u8],
    ) -> Result<Self> {
        let payload = Bytes::from(keyring.encrypt(plaintext));
        let mut packet = Packet {
            unknown: 0,
            device_id,
            stamp,
            checksum: [0; CHECKSUM_SIZE],
            payload,
        };
        packet.checksum = packet.compute_checksum(keyring.token())?;
        Ok(packet)
    }

    /// Parse header fields and split off the payload. Validates magic and
    /// the declared length against the actual byte count; does not need a
    /// token (discovery reads the checksum field as the token).
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let (header, payload) = Header::ref_from_prefix(bytes).map_err(|_| {
            MiIoError::MalformedPacket(format!(
                "{} bytes is shorter than the {HEADER_SIZE}-byte header",
                bytes.len()
            ))
        })?;
        if header.magic.get() != MAGIC {
            return Err(MiIoError::MalformedPacket(format!(
                "bad magic 0x{:04x}",
                header.magic.get()
            )));
        }
        if header.length.get() as usize != bytes.len() {
            return Err(MiIoError::MalformedPacket(format!(
                "declared length {} but received {} bytes",
                header.length.get(),
                bytes.len()
            )));
        }
        Ok(Packet {
            unknown: header.unknown.get(),
            device_id: header.device_id.get(),
            stamp: header.stamp.get(),
            checksum: header.checksum,
            payload: Bytes::copy_from_slice(payload),
        })
    }

    /// Emit wire bytes. Fails with [`MiIoError::PacketTooLarge`] when the
    /// total length overflows the 16-bit length field.
    pub fn to_bytes(&self) -> Result<Bytes> {
        let header = self.header()?;
        let mut out = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(&self.payload);
        Ok(Bytes::from(out))
    }

    /// A header-only packet: handshake probe or reply.
    pub fn is_handshake(&self) -> bool {
        self.payload.is_empty()
    }

    /// Recompute the MD5 integrity tag and compare it against the checksum
    /// field. Must pass before any decryption attempt; a mismatch means a
    /// corrupt or foreign datagram and is not fatal to the receive loop.
    pub fn verify_checksum(&self, token: &Token) -> Result<()> {
        if self.compute_checksum(token)? == self.checksum {
            Ok(())
        } else {
            Err(MiIoError::ChecksumMismatch)
        }
    }

    /// Verify the checksum, then decrypt the payload.
    pub fn decrypt_payload(&self, keyring: &Keyring) -> Result<Vec<u8>> {
        self.verify_checksum(keyring.token())?;
        keyring.decrypt(&self.payload)
    }

    /// The checksum field of a handshake reply, interpreted as the token.
    /// All 0xFF means the device has not been provisioned yet.
    pub fn token_from_checksum(&self) -> Token {
        Token::new(self.checksum)
    }

    fn header(&self) -> Result<Header> {
        let total = HEADER_SIZE + self.payload.len();
        let length =
            u16::try_from(total).map_err(|_| MiIoError::PacketTooLarge(total))?;
        Ok(Header {
            magic: U16::new(MAGIC),
            length: U16::new(length),
            unknown: U32::new(self.unknown),
            device_id: U32::new(self.device_id),
            stamp: U32::new(self.stamp),
            checksum: self.checksum,
        })
    }

    fn compute_checksum(&self, token: &Token) -> Result<[u8; CHECKSUM_SIZE]> {
        let mut header = self.header()?;
        header.checksum = *token.as_bytes();
        let mut hasher = Md5::new();
        hasher.update(header.as_bytes());
        hasher.update(&self.payload);
        Ok(hasher.finalize().into())
    }
}
