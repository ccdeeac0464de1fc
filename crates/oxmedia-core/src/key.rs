//! Content keys for the decrypt cache.

use std::fmt;
use std::io;
use std::path::Path;
use std::time::UNIX_EPOCH;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// How a [`ContentKey`] is derived from an encrypted file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyDerivation {
    /// SHA-256 of the path bytes. Needs no I/O.
    #[default]
    Path,
    /// SHA-256 of the path, file length and modification time.
    ///
    /// A file replaced at the same path gets a new key, at the cost of one
    /// `stat` per lookup.
    PathAndMetadata,
}

/// 256-bit digest identifying one encrypted media item.
///
/// Equal inputs always yield equal keys.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentKey([u8; 32]);

impl ContentKey {
    /// Derive a key from the file path alone.
    pub fn from_path(path: impl AsRef<Path>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(path.as_ref().as_os_str().as_encoded_bytes());
        Self(hasher.finalize().into())
    }

    /// Derive a key from the path plus the file's length and mtime.
    pub fn from_path_and_metadata(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let metadata = std::fs::metadata(path)?;
        let mtime_nanos = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map_or(0, |d| d.as_nanos());

        let mut hasher = Sha256::new();
        hasher.update(path.as_os_str().as_encoded_bytes());
        hasher.update([0u8]);
        hasher.update(metadata.len().to_le_bytes());
        hasher.update(mtime_nanos.to_le_bytes());
        Ok(Self(hasher.finalize().into()))
    }

    /// Derive a key using the given strategy.
    pub fn derive(path: impl AsRef<Path>, derivation: KeyDerivation) -> io::Result<Self> {
        match derivation {
            KeyDerivation::Path => Ok(Self::from_path(path)),
            KeyDerivation::PathAndMetadata => Self::from_path_and_metadata(path),
        }
    }

    /// Wrap raw digest bytes.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentKey({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}
