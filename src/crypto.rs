//! Device tokens and the AES keyring derived from them.
//!
//! Every MiIO device shares a 16-byte token with the controller. The payload
//! cipher is AES-128-CBC with PKCS#7 padding, keyed as
//! `key = MD5(token)`, `iv = MD5(key || token)`.

use std::fmt;
use std::str::FromStr;

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use md5::{Digest, Md5};
use serde::Deserialize;
use serde::de;

use crate::constants::TOKEN_SIZE;
use crate::error::{MiIoError, Result};

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

/// 16-byte pre-shared device secret.
///
/// Discovery reports [`Token::UNSET`] (all 0xFF) for devices that have not
/// been provisioned; such a device is reachable but cannot be commanded until
/// the user supplies the real token.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Token([u8; TOKEN_SIZE]);

impl Token {
    /// Sentinel meaning "no token known".
    pub const UNSET: Token = Token([0xff; TOKEN_SIZE]);

    pub fn new(bytes: [u8; TOKEN_SIZE]) -> Self {
        Token(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; TOKEN_SIZE] = bytes.try_into().map_err(|_| {
            MiIoError::CryptoConfiguration(format!(
                "token must be {} bytes, got {}",
                TOKEN_SIZE,
                bytes.len()
            ))
        })?;
        Ok(Token(arr))
    }

    pub fn is_unset(&self) -> bool {
        self.0 == [0xff; TOKEN_SIZE]
    }

    pub fn as_bytes(&self) -> &[u8; TOKEN_SIZE] {
        &self.0
    }
}

impl FromStr for Token {
    type Err = MiIoError;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = hex::decode(s.trim())
            .map_err(|e| MiIoError::CryptoConfiguration(format!("invalid token hex: {e}")))?;
        Token::from_slice(&bytes)
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Token({})", hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for Token {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: de::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// AES key and IV derived from a device token. Read-only after derivation.
#[derive(Clone, Copy)]
pub struct Keyring {
    key: [u8; 16],
    iv: [u8; 16],
    token: Token,
}

impl Keyring {
    /// Derive the cipher parameters from a token. Pure; no state.
    pub fn derive(token: &Token) -> Self {
        let key: [u8; 16] = Md5::digest(token.as_bytes()).into();

        let mut hasher = Md5::new();
        hasher.update(key);
        hasher.update(token.as_bytes());
        let iv: [u8; 16] = hasher.finalize().into();

        Keyring {
            key,
            iv,
            token: *token,
        }
    }

    pub fn token(&self) -> &Token {
        &self.token
    }

    pub fn key(&self) -> &[u8; 16] {
        &self.key
    }

    pub fn iv(&self) -> &[u8; 16] {
        &self.iv
    }

    /// Encrypt a JSON body. PKCS#7 padding is always applied, so the
    /// ciphertext is a non-empty multiple of the block size.
    pub fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        Aes128CbcEnc::new(&self.key.into(), &self.iv.into())
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext)
    }

    /// Decrypt a payload. Invalid padding fails with
    /// [`MiIoError::Decryption`] rather than truncating silently.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.is_empty() || ciphertext.len() % 16 != 0 {
            return Err(MiIoError::Decryption);
        }
        Aes128CbcDec::new(&self.key.into(), &self.iv.into())
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| MiIoError::Decryption)
    }
}

impl fmt::Debug for Keyring {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // key and iv omitted
        write!(f, "Keyring(token {})", self.token)
    }
}
