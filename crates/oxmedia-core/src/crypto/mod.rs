//! Decryption capabilities consumed by the cache and streaming source.
//!
//! The core never talks to a cipher directly. It calls a [`Decryptor`] for
//! whole-file plaintext and, where available, a [`BlockDecryptor`] for
//! random access to independently decryptable blocks. [`VaultDecryptor`]
//! implements both for the chunked AES-256-GCM format in [`format`].

pub mod file;
pub mod format;
pub mod keys;
pub mod vault;

use std::fmt;
use std::io;
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;

use crate::error::MediaContext;

pub use file::{EncryptError, encrypt_media, write_media_file};
pub use keys::{KeyError, MediaKey};
pub use vault::{VaultBlockReader, VaultDecryptor};

/// Failure to produce plaintext for a media file.
#[derive(Error, Debug)]
pub enum DecryptError {
    #[error("IO error reading {context}: {source}")]
    Io {
        #[source]
        source: io::Error,
        context: MediaContext,
    },

    /// The header has the wrong size or the body length is impossible.
    #[error("Invalid media file for {context}: {reason}")]
    InvalidHeader {
        reason: String,
        context: MediaContext,
    },

    #[error(
        "Failed to decrypt header for {context}: invalid authentication tag - possible tampering or wrong key"
    )]
    HeaderAuthentication { context: MediaContext },

    #[error(
        "Failed to decrypt content for {context}: invalid authentication tag - possible tampering or wrong key"
    )]
    BlockAuthentication { context: MediaContext },

    #[error("Incomplete block for {context}: expected {expected} bytes, got {actual}")]
    IncompleteBlock {
        expected: usize,
        actual: usize,
        context: MediaContext,
    },

    #[error("Block {block} out of range for {context}: file has {block_count} blocks")]
    BlockOutOfRange {
        block: u64,
        block_count: u64,
        context: MediaContext,
    },

    /// Failure reported by a decryptor outside this crate.
    #[error("Decryptor failed for {context}: {reason}")]
    Backend {
        reason: String,
        context: MediaContext,
    },
}

impl From<io::Error> for DecryptError {
    fn from(source: io::Error) -> Self {
        DecryptError::Io {
            source,
            context: MediaContext::new(),
        }
    }
}

impl DecryptError {
    #[must_use]
    pub fn io_with_context(source: io::Error, context: MediaContext) -> Self {
        DecryptError::Io { source, context }
    }

    /// Error for decryptor implementations that have no richer variant.
    #[must_use]
    pub fn backend(reason: impl Into<String>, path: impl AsRef<Path>) -> Self {
        DecryptError::Backend {
            reason: reason.into(),
            context: MediaContext::new().with_path(path.as_ref()),
        }
    }

    pub fn context(&self) -> &MediaContext {
        match self {
            DecryptError::Io { context, .. }
            | DecryptError::InvalidHeader { context, .. }
            | DecryptError::HeaderAuthentication { context }
            | DecryptError::BlockAuthentication { context }
            | DecryptError::IncompleteBlock { context, .. }
            | DecryptError::BlockOutOfRange { context, .. }
            | DecryptError::Backend { context, .. } => context,
        }
    }

    /// True for authentication failures: wrong key or tampered data.
    pub fn is_integrity_violation(&self) -> bool {
        matches!(
            self,
            DecryptError::HeaderAuthentication { .. } | DecryptError::BlockAuthentication { .. }
        )
    }
}

/// Plaintext of one media file plus its resolved MIME type.
///
/// Cheap to clone: the payload is reference counted and never mutated.
#[derive(Clone, PartialEq, Eq)]
pub struct DecryptedMedia {
    pub data: Bytes,
    pub mime_type: Arc<str>,
}

impl DecryptedMedia {
    pub fn new(data: impl Into<Bytes>, mime_type: impl Into<Arc<str>>) -> Self {
        Self {
            data: data.into(),
            mime_type: mime_type.into(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl fmt::Debug for DecryptedMedia {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecryptedMedia")
            .field("len", &self.data.len())
            .field("mime_type", &self.mime_type)
            .finish()
    }
}

/// Whole-file decryption.
///
/// Must be safe to call concurrently for different files. The decrypt cache
/// guarantees it is not called twice at once for the same file.
pub trait Decryptor: Send + Sync {
    fn decrypt(&self, path: &Path) -> Result<DecryptedMedia, DecryptError>;
}

impl<F> Decryptor for F
where
    F: Fn(&Path) -> Result<DecryptedMedia, DecryptError> + Send + Sync,
{
    fn decrypt(&self, path: &Path) -> Result<DecryptedMedia, DecryptError> {
        self(path)
    }
}

/// Random access to fixed-size, independently decryptable blocks.
pub trait BlockDecryptor: Send + Sync {
    fn open_blocks(&self, path: &Path) -> Result<Box<dyn BlockReader>, DecryptError>;
}

/// An opened file whose blocks can be decrypted in any order.
pub trait BlockReader: Send {
    /// Plaintext bytes per block. Only the last block may be shorter.
    fn block_size(&self) -> usize;

    /// Total plaintext length of the file.
    fn plaintext_len(&self) -> u64;

    fn block_count(&self) -> u64 {
        let block_size = self.block_size().max(1) as u64;
        self.plaintext_len().div_ceil(block_size)
    }

    /// Block index holding plaintext `offset`, and the offset within it.
    fn locate(&self, offset: u64) -> (u64, usize) {
        let block_size = self.block_size().max(1) as u64;
        (offset / block_size, (offset % block_size) as usize)
    }

    /// Decrypt block `index`, returning its plaintext.
    fn decrypt_block(&mut self, index: u64) -> Result<Bytes, DecryptError>;
}
