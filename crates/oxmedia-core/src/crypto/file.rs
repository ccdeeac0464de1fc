//! Header and block primitives for encrypted media files.

use std::fmt;
use std::io::{self, Write};
use std::path::Path;

use aead::Payload;
use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, KeyInit},
};
use rand::RngCore;
use thiserror::Error;
use tracing::{debug, instrument, warn};
use zeroize::Zeroizing;

use super::DecryptError;
use super::format::{
    BLOCK_NONCE_SIZE, BLOCK_OVERHEAD, BLOCK_PLAINTEXT_SIZE, HEADER_NONCE_SIZE, HEADER_RESERVED,
    HEADER_SIZE,
};
use super::keys::MediaKey;
use crate::error::MediaContext;

#[derive(Error, Debug)]
pub enum EncryptError {
    #[error("Failed to encrypt {context}: {reason}")]
    Cipher {
        reason: String,
        context: MediaContext,
    },

    #[error("IO error writing {context}: {source}")]
    Io {
        #[source]
        source: io::Error,
        context: MediaContext,
    },
}

/// Decrypted file header.
pub struct MediaHeader {
    pub nonce: [u8; HEADER_NONCE_SIZE],
    pub content_key: Zeroizing<[u8; 32]>,
}

impl fmt::Debug for MediaHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaHeader")
            .field("nonce", &hex::encode(self.nonce))
            .field("content_key", &"[REDACTED]")
            .finish()
    }
}

fn block_aad(block: u64, header_nonce: &[u8; HEADER_NONCE_SIZE]) -> [u8; 20] {
    let mut aad = [0u8; 8 + HEADER_NONCE_SIZE];
    aad[..8].copy_from_slice(&block.to_be_bytes());
    aad[8..].copy_from_slice(header_nonce);
    aad
}

/// Unwrap the content key from a 68-byte header.
#[instrument(level = "trace", skip(encrypted_header, key), fields(header_size = encrypted_header.len()))]
pub fn decrypt_header(
    encrypted_header: &[u8],
    key: &MediaKey,
    context: &MediaContext,
) -> Result<MediaHeader, DecryptError> {
    if encrypted_header.len() != HEADER_SIZE {
        warn!(actual_size = encrypted_header.len(), "Invalid header size");
        return Err(DecryptError::InvalidHeader {
            reason: format!(
                "expected {HEADER_SIZE} header bytes, got {}",
                encrypted_header.len()
            ),
            context: context.clone(),
        });
    }

    let mut nonce = [0u8; HEADER_NONCE_SIZE];
    nonce.copy_from_slice(&encrypted_header[..HEADER_NONCE_SIZE]);

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    let decrypted = Zeroizing::new(
        cipher
            .decrypt(Nonce::from_slice(&nonce), &encrypted_header[HEADER_NONCE_SIZE..])
            .map_err(|_| {
                warn!("Header authentication failed");
                DecryptError::HeaderAuthentication {
                    context: context.clone(),
                }
            })?,
    );

    if decrypted.len() != HEADER_RESERVED.len() + 32 {
        return Err(DecryptError::InvalidHeader {
            reason: format!("decrypted header has {} bytes", decrypted.len()),
            context: context.clone(),
        });
    }
    if decrypted[..8] != HEADER_RESERVED {
        debug!("Header reserved bytes differ from 0xFF padding");
    }

    let mut content_key = Zeroizing::new([0u8; 32]);
    content_key.copy_from_slice(&decrypted[8..]);
    Ok(MediaHeader { nonce, content_key })
}

/// Wrap `content_key` into a fresh header under `key`.
pub fn encrypt_header(
    content_key: &[u8; 32],
    key: &MediaKey,
    context: &MediaContext,
) -> Result<(Vec<u8>, [u8; HEADER_NONCE_SIZE]), EncryptError> {
    let mut nonce = [0u8; HEADER_NONCE_SIZE];
    rand::rng().fill_bytes(&mut nonce);

    let mut plaintext = Zeroizing::new(Vec::with_capacity(HEADER_RESERVED.len() + 32));
    plaintext.extend_from_slice(&HEADER_RESERVED);
    plaintext.extend_from_slice(content_key);

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext.as_slice())
        .map_err(|e| EncryptError::Cipher {
            reason: e.to_string(),
            context: context.clone().with_operation("encrypt_header"),
        })?;

    let mut header = Vec::with_capacity(HEADER_SIZE);
    header.extend_from_slice(&nonce);
    header.extend_from_slice(&ciphertext);
    Ok((header, nonce))
}

/// Decrypt one encrypted block (`nonce || ciphertext || tag`).
pub fn decrypt_block(
    encrypted: &[u8],
    block: u64,
    content_key: &[u8; 32],
    header_nonce: &[u8; HEADER_NONCE_SIZE],
    context: &MediaContext,
) -> Result<Vec<u8>, DecryptError> {
    if encrypted.len() < BLOCK_OVERHEAD {
        warn!(block, actual_size = encrypted.len(), "Incomplete block");
        return Err(DecryptError::IncompleteBlock {
            expected: BLOCK_OVERHEAD,
            actual: encrypted.len(),
            context: context.clone().with_block(block),
        });
    }

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(content_key));
    let aad = block_aad(block, header_nonce);
    let payload = Payload {
        msg: &encrypted[BLOCK_NONCE_SIZE..],
        aad: &aad,
    };

    cipher
        .decrypt(Nonce::from_slice(&encrypted[..BLOCK_NONCE_SIZE]), payload)
        .map_err(|_| {
            warn!(block, "Block authentication failed");
            DecryptError::BlockAuthentication {
                context: context.clone().with_block(block),
            }
        })
}

/// Encrypt a whole plaintext into the media file format.
#[instrument(level = "debug", skip_all, fields(plaintext_len = plaintext.len()))]
pub fn encrypt_media(plaintext: &[u8], key: &MediaKey) -> Result<Vec<u8>, EncryptError> {
    let context = MediaContext::new().with_operation("encrypt_media");

    let mut content_key = Zeroizing::new([0u8; 32]);
    rand::rng().fill_bytes(&mut content_key[..]);

    let (header, header_nonce) = encrypt_header(&content_key, key, &context)?;
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&content_key[..]));

    let blocks: Vec<&[u8]> = if plaintext.is_empty() {
        vec![&[]]
    } else {
        plaintext.chunks(BLOCK_PLAINTEXT_SIZE).collect()
    };

    let mut out =
        Vec::with_capacity(HEADER_SIZE + plaintext.len() + blocks.len() * BLOCK_OVERHEAD);
    out.extend_from_slice(&header);

    for (index, chunk) in blocks.into_iter().enumerate() {
        let block = index as u64;
        let mut nonce = [0u8; BLOCK_NONCE_SIZE];
        rand::rng().fill_bytes(&mut nonce);

        let aad = block_aad(block, &header_nonce);
        let sealed = cipher
            .encrypt(Nonce::from_slice(&nonce), Payload { msg: chunk, aad: &aad })
            .map_err(|e| EncryptError::Cipher {
                reason: e.to_string(),
                context: context.clone().with_block(block),
            })?;

        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
    }

    debug!(encrypted_len = out.len(), "Media encrypted");
    Ok(out)
}

/// Encrypt `plaintext` and write it to `path`.
///
/// The file is written to a temporary sibling and renamed into place, so
/// readers never see a partial file.
#[instrument(level = "debug", skip(plaintext, key), fields(path = %path.display()))]
pub fn write_media_file(path: &Path, plaintext: &[u8], key: &MediaKey) -> Result<(), EncryptError> {
    let context = MediaContext::new()
        .with_path(path)
        .with_operation("write_media_file");
    let encrypted = encrypt_media(plaintext, key)?;

    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let io_err = |source: io::Error| EncryptError::Io {
        source,
        context: context.clone(),
    };

    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(io_err)?;
    tmp.write_all(&encrypted).map_err(io_err)?;
    tmp.as_file().sync_all().map_err(io_err)?;
    tmp.persist(path).map_err(|e| io_err(e.error))?;
    Ok(())
}
