//! Vault media key.

use std::fmt;

use rand::RngCore;
use thiserror::Error;
use zeroize::Zeroizing;

/// Length of a media key in bytes.
pub const MEDIA_KEY_LEN: usize = 32;

#[derive(Error, Debug)]
pub enum KeyError {
    #[error("media key is not valid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),

    #[error("media key must be {MEDIA_KEY_LEN} bytes, got {0}")]
    InvalidLength(usize),
}

/// AES-256 key that wraps every per-file content key in a vault.
///
/// The bytes are zeroed on drop and never printed by `Debug`.
#[derive(Clone)]
pub struct MediaKey(Zeroizing<[u8; MEDIA_KEY_LEN]>);

impl MediaKey {
    /// Generate a fresh key from the thread-local CSPRNG.
    pub fn random() -> Self {
        let mut bytes = Zeroizing::new([0u8; MEDIA_KEY_LEN]);
        rand::rng().fill_bytes(&mut bytes[..]);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; MEDIA_KEY_LEN]) -> Self {
        Self(Zeroizing::new(bytes))
    }

    /// Parse a key from 64 hex characters. Surrounding whitespace is ignored.
    pub fn from_hex(encoded: &str) -> Result<Self, KeyError> {
        let decoded = Zeroizing::new(hex::decode(encoded.trim())?);
        if decoded.len() != MEDIA_KEY_LEN {
            return Err(KeyError::InvalidLength(decoded.len()));
        }
        let mut bytes = Zeroizing::new([0u8; MEDIA_KEY_LEN]);
        bytes.copy_from_slice(&decoded);
        Ok(Self(bytes))
    }

    /// Hex encoding of the key, zeroed when dropped.
    pub fn to_hex(&self) -> Zeroizing<String> {
        Zeroizing::new(hex::encode(&self.0[..]))
    }

    pub(crate) fn as_bytes(&self) -> &[u8; MEDIA_KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for MediaKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("MediaKey").field(&"[REDACTED]").finish()
    }
}
