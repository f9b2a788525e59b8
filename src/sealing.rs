//! Authenticated encryption for session cookies and cached token records.
//!
//! A single 256-bit key drives AES-256-GCM sealing of small payloads. Every
//! sealed blob carries its creation time as authenticated associated data,
//! so stale ciphertext can be rejected without trusting the payload, and a
//! single flipped bit anywhere in the frame fails the GCM tag check.
//!
//! Frame layout, base64url-encoded without padding:
//! 8-byte big-endian unix timestamp || 12-byte nonce || ciphertext+tag.

use aes_gcm::{
    Aes256Gcm, KeyInit,
    aead::{Aead, Payload, generic_array::GenericArray},
};
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::TryRngCore;
use rand::rngs::OsRng;
use std::time::Duration;
use thiserror::Error;

const TIMESTAMP_LEN: usize = 8;
const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

/// Errors from unsealing a blob. Sealing itself cannot fail.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SealError {
    /// Not base64url, too short, or failed the authentication tag.
    #[error("sealed value is malformed or has been tampered with")]
    Malformed,

    /// Authenticated timestamp is older than the allowed age.
    #[error("sealed value has expired")]
    Expired,

    /// The provided key is not a base64-encoded 256-bit value.
    #[error("sealing key must be 32 bytes of base64url data")]
    BadKey,
}

/// AES-256-GCM sealer shared by the session manager and the token cache.
#[derive(Clone)]
pub struct Sealer {
    cipher: Aes256Gcm,
}

impl Sealer {
    pub fn new(key: &[u8; KEY_LEN]) -> Self {
        Self {
            cipher: Aes256Gcm::new(GenericArray::from_slice(key)),
        }
    }

    /// Build a sealer from a base64url-encoded 256-bit key, the format of
    /// the `session_secret_file` contents.
    pub fn from_base64(encoded: &str) -> Result<Self, SealError> {
        let raw = URL_SAFE_NO_PAD
            .decode(encoded.trim())
            .map_err(|_| SealError::BadKey)?;
        let key: [u8; KEY_LEN] = raw.try_into().map_err(|_| SealError::BadKey)?;
        Ok(Self::new(&key))
    }

    /// Generate a fresh base64url-encoded key suitable for
    /// `session_secret_file`.
    pub fn generate_key() -> String {
        let mut key = [0u8; KEY_LEN];
        OsRng
            .try_fill_bytes(&mut key)
            .expect("OsRng failed to produce random bytes");
        URL_SAFE_NO_PAD.encode(key)
    }

    /// Seal a payload, stamping it with the current time.
    pub fn seal(&self, plaintext: &[u8]) -> String {
        let timestamp = chrono::Utc::now().timestamp().to_be_bytes();
        let mut nonce = [0u8; NONCE_LEN];
        OsRng
            .try_fill_bytes(&mut nonce)
            .expect("OsRng failed to produce random bytes");
        let ciphertext = self
            .cipher
            .encrypt(
                GenericArray::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: &timestamp,
                },
            )
            .expect("AES-GCM encryption cannot fail with a valid nonce");

        let mut frame = Vec::with_capacity(TIMESTAMP_LEN + NONCE_LEN + ciphertext.len());
        frame.extend_from_slice(&timestamp);
        frame.extend_from_slice(&nonce);
        frame.extend_from_slice(&ciphertext);
        URL_SAFE_NO_PAD.encode(frame)
    }

    /// Unseal a blob, rejecting anything older than `max_age` or failing
    /// authentication.
    pub fn unseal(&self, blob: &str, max_age: Duration) -> Result<Vec<u8>, SealError> {
        let frame = URL_SAFE_NO_PAD
            .decode(blob.trim())
            .map_err(|_| SealError::Malformed)?;
        if frame.len() < TIMESTAMP_LEN + NONCE_LEN {
            return Err(SealError::Malformed);
        }
        let (timestamp_bytes, rest) = frame.split_at(TIMESTAMP_LEN);
        let (nonce, ciphertext) = rest.split_at(NONCE_LEN);

        let plaintext = self
            .cipher
            .decrypt(
                GenericArray::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: timestamp_bytes,
                },
            )
            .map_err(|_| SealError::Malformed)?;

        let sealed_at = i64::from_be_bytes(
            timestamp_bytes
                .try_into()
                .expect("timestamp slice has fixed length"),
        );
        let age = chrono::Utc::now().timestamp().saturating_sub(sealed_at);
        if age < 0 || age as u64 > max_age.as_secs() {
            return Err(SealError::Expired);
        }

        Ok(plaintext)
    }
}

impl std::fmt::Debug for Sealer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Sealer(..)")
    }
}
