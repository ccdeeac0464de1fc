//! Decryptor for files in the vault media format.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tracing::{debug, instrument, trace};
use zeroize::Zeroizing;

use super::file::{decrypt_block, decrypt_header};
use super::format::{
    BLOCK_ENCRYPTED_SIZE, BLOCK_OVERHEAD, BLOCK_PLAINTEXT_SIZE, HEADER_NONCE_SIZE, HEADER_SIZE,
    block_count, block_to_encrypted_offset, encrypted_to_plaintext_size, plaintext_to_block,
    plaintext_to_block_offset,
};
use super::keys::MediaKey;
use super::{BlockDecryptor, BlockReader, DecryptError, DecryptedMedia, Decryptor};
use crate::error::MediaContext;
use crate::mime::sniff_mime;
use crate::pool::BufferPool;

/// Read until `buf` is full or the reader hits EOF. Returns bytes read.
fn read_up_to(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Decrypts vault media files with a single media key.
///
/// Ciphertext scratch buffers are borrowed from a shared [`BufferPool`] and
/// returned after each block.
#[derive(Clone)]
pub struct VaultDecryptor {
    key: MediaKey,
    pool: Arc<BufferPool>,
}

impl VaultDecryptor {
    pub fn new(key: MediaKey) -> Self {
        Self::with_pool(key, Arc::new(BufferPool::new()))
    }

    pub fn with_pool(key: MediaKey, pool: Arc<BufferPool>) -> Self {
        Self { key, pool }
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    /// Open `path`, authenticate its header and size its body.
    #[instrument(level = "debug", skip(self), fields(path = %path.display()))]
    pub fn open(&self, path: &Path) -> Result<VaultBlockReader, DecryptError> {
        let context = MediaContext::new().with_path(path).with_operation("open");
        let io_err = |e: io::Error| DecryptError::io_with_context(e, context.clone());

        let mut file = File::open(path).map_err(io_err)?;
        let encrypted_len = file.metadata().map_err(io_err)?.len();
        let plaintext_len =
            encrypted_to_plaintext_size(encrypted_len).ok_or_else(|| DecryptError::InvalidHeader {
                reason: format!("{encrypted_len} bytes is not a valid encrypted size"),
                context: context.clone(),
            })?;

        let mut header_bytes = [0u8; HEADER_SIZE];
        file.read_exact(&mut header_bytes).map_err(io_err)?;
        let header = decrypt_header(&header_bytes, &self.key, &context)?;

        let mut reader = VaultBlockReader {
            file,
            path: path.to_path_buf(),
            content_key: header.content_key,
            header_nonce: header.nonce,
            plaintext_len,
            pool: Arc::clone(&self.pool),
        };

        // An empty file still carries one authenticated block.
        if plaintext_len == 0 {
            reader.read_block(0)?;
        }

        debug!(plaintext_len, blocks = block_count(plaintext_len), "Opened media file");
        Ok(reader)
    }
}

impl std::fmt::Debug for VaultDecryptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultDecryptor")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

impl Decryptor for VaultDecryptor {
    #[instrument(level = "debug", skip(self), fields(path = %path.display()))]
    fn decrypt(&self, path: &Path) -> Result<DecryptedMedia, DecryptError> {
        let mut reader = self.open(path)?;
        let mut plaintext = BytesMut::with_capacity(reader.plaintext_len as usize);
        for block in 0..block_count(reader.plaintext_len) {
            plaintext.extend_from_slice(&reader.read_block(block)?);
        }

        let data = plaintext.freeze();
        let mime_type = sniff_mime(&data);
        debug!(len = data.len(), mime_type, "Decrypted media file");
        Ok(DecryptedMedia::new(data, mime_type))
    }
}

impl BlockDecryptor for VaultDecryptor {
    fn open_blocks(&self, path: &Path) -> Result<Box<dyn BlockReader>, DecryptError> {
        Ok(Box::new(self.open(path)?))
    }
}

/// Open vault file serving individual blocks.
pub struct VaultBlockReader {
    file: File,
    path: PathBuf,
    content_key: Zeroizing<[u8; 32]>,
    header_nonce: [u8; HEADER_NONCE_SIZE],
    plaintext_len: u64,
    pool: Arc<BufferPool>,
}

impl VaultBlockReader {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read and decrypt block `block` without a range check.
    fn read_block(&mut self, block: u64) -> Result<Vec<u8>, DecryptError> {
        let context = MediaContext::new()
            .with_path(&self.path)
            .with_block(block)
            .with_operation("read_block");

        let block_start = block * BLOCK_PLAINTEXT_SIZE as u64;
        let plain_len = self
            .plaintext_len
            .saturating_sub(block_start)
            .min(BLOCK_PLAINTEXT_SIZE as u64) as usize;
        let expected = plain_len + BLOCK_OVERHEAD;

        self.file
            .seek(SeekFrom::Start(block_to_encrypted_offset(block)))
            .map_err(|e| DecryptError::io_with_context(e, context.clone()))?;

        let mut buffer = self.pool.borrow(BLOCK_ENCRYPTED_SIZE);
        let read = read_up_to(&mut self.file, &mut buffer[..expected]);
        let result = match read {
            Ok(n) if n == expected => {
                trace!(block, size = n, "Decrypting block");
                decrypt_block(
                    &buffer[..n],
                    block,
                    &self.content_key,
                    &self.header_nonce,
                    &context,
                )
            }
            Ok(n) => Err(DecryptError::IncompleteBlock {
                expected,
                actual: n,
                context,
            }),
            Err(e) => Err(DecryptError::io_with_context(e, context)),
        };
        self.pool.recycle(buffer);
        result
    }
}

impl BlockReader for VaultBlockReader {
    fn block_size(&self) -> usize {
        BLOCK_PLAINTEXT_SIZE
    }

    fn plaintext_len(&self) -> u64 {
        self.plaintext_len
    }

    fn locate(&self, offset: u64) -> (u64, usize) {
        (plaintext_to_block(offset), plaintext_to_block_offset(offset))
    }

    fn decrypt_block(&mut self, index: u64) -> Result<Bytes, DecryptError> {
        let blocks = block_count(self.plaintext_len);
        if index >= blocks {
            return Err(DecryptError::BlockOutOfRange {
                block: index,
                block_count: blocks,
                context: MediaContext::new().with_path(&self.path),
            });
        }
        self.read_block(index).map(Bytes::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::file::write_media_file;

    fn fixture(len: usize) -> (tempfile::TempDir, PathBuf, MediaKey, Vec<u8>) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("item.bin");
        let key = MediaKey::random();
        let plaintext: Vec<u8> = (0..len).map(|i| (i * 7 % 256) as u8).collect();
        write_media_file(&path, &plaintext, &key).unwrap();
        (dir, path, key, plaintext)
    }

    #[test]
    fn test_whole_file_decrypt() {
        let (_dir, path, key, plaintext) = fixture(70_000);
        let media = VaultDecryptor::new(key).decrypt(&path).unwrap();
        assert_eq!(&media.data[..], &plaintext[..]);
        assert_eq!(&*media.mime_type, "application/octet-stream");
    }

    #[test]
    fn test_blocks_in_any_order() {
        let (_dir, path, key, plaintext) = fixture(3 * BLOCK_PLAINTEXT_SIZE + 10);
        let mut reader = VaultDecryptor::new(key).open_blocks(&path).unwrap();
        assert_eq!(reader.block_count(), 4);
        assert_eq!(reader.locate(0), (0, 0));
        assert_eq!(reader.locate(2 * BLOCK_PLAINTEXT_SIZE as u64 + 9), (2, 9));

        let last = reader.decrypt_block(3).unwrap();
        assert_eq!(&last[..], &plaintext[3 * BLOCK_PLAINTEXT_SIZE..]);
        let first = reader.decrypt_block(0).unwrap();
        assert_eq!(&first[..], &plaintext[..BLOCK_PLAINTEXT_SIZE]);

        assert!(matches!(
            reader.decrypt_block(4),
            Err(DecryptError::BlockOutOfRange { block: 4, block_count: 4, .. })
        ));
    }

    #[test]
    fn test_empty_file() {
        let (_dir, path, key, _) = fixture(0);
        let decryptor = VaultDecryptor::new(key);
        assert!(decryptor.decrypt(&path).unwrap().is_empty());
        assert_eq!(decryptor.open(&path).unwrap().block_count(), 0);
    }

    #[test]
    fn test_scratch_buffers_are_pooled() {
        let (_dir, path, key, _) = fixture(5 * BLOCK_PLAINTEXT_SIZE);
        let decryptor = VaultDecryptor::new(key);
        decryptor.decrypt(&path).unwrap();
        decryptor.decrypt(&path).unwrap();

        let stats = decryptor.pool().stats();
        assert_eq!(stats.borrows, 10);
        assert_eq!(stats.fresh_allocations, 1);
        assert_eq!(stats.reuses, 9);
    }

    #[test]
    fn test_wrong_key_and_missing_file() {
        let (_dir, path, _key, _) = fixture(100);
        let decryptor = VaultDecryptor::new(MediaKey::random());
        assert!(matches!(
            decryptor.decrypt(&path),
            Err(DecryptError::HeaderAuthentication { .. })
        ));
        assert!(matches!(
            decryptor.decrypt(Path::new("/no/such/file.bin")),
            Err(DecryptError::Io { .. })
        ));
    }

    #[test]
    fn test_truncated_file_rejected() {
        let (_dir, path, key, _) = fixture(1000);
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..HEADER_SIZE + 10]).unwrap();
        assert!(matches!(
            VaultDecryptor::new(key).decrypt(&path),
            Err(DecryptError::InvalidHeader { .. })
        ));
    }
}
