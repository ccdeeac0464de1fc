//! Seekable plaintext source for streaming playback.
//!
//! A [`StreamingDecryptingSource`] serves range reads over an encrypted
//! file's plaintext to a media player's I/O layer. It bypasses the decrypt
//! cache: video payloads are too large to cache whole.
//!
//! Two modes share the same open/read/close contract:
//!
//! - **Whole file** ([`StreamingDecryptingSource::new`]): `open` decrypts the
//!   entire file once, synchronously, then reads copy out of memory. The
//!   first byte is only available after the full decrypt, which is slow for
//!   large files.
//! - **Block-wise** ([`StreamingDecryptingSource::blockwise`]): `open` only
//!   reads the header; each read decrypts the blocks it touches and keeps the
//!   most recent ones in a small LRU.

use std::collections::HashSet;
use std::io;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use lru::LruCache;
use thiserror::Error;
use tracing::{debug, instrument, trace};

use crate::config::DEFAULT_BLOCK_CACHE_BLOCKS;
use crate::crypto::{BlockDecryptor, BlockReader, DecryptError, Decryptor};
use crate::error::MediaContext;
use crate::key::ContentKey;
use crate::progress::DecryptionProgressRegistry;

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("Source is not open for {context}")]
    NotOpen { context: MediaContext },

    #[error("Decryption error: {0}")]
    Decrypt(#[from] DecryptError),

    #[error(
        "Invalid read range: offset {offset} + length {length} exceeds buffer of {buffer_len} bytes"
    )]
    InvalidRange {
        offset: usize,
        length: usize,
        buffer_len: usize,
    },
}

impl From<StreamError> for io::Error {
    fn from(err: StreamError) -> Self {
        let kind = match &err {
            StreamError::NotOpen { .. } => io::ErrorKind::NotConnected,
            StreamError::InvalidRange { .. } => io::ErrorKind::InvalidInput,
            StreamError::Decrypt(DecryptError::Io { source, .. }) => source.kind(),
            StreamError::Decrypt(_) => io::ErrorKind::InvalidData,
        };
        io::Error::new(kind, err)
    }
}

/// Result of a single [`StreamingDecryptingSource::read`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// This many bytes were copied into the buffer.
    Read(usize),
    /// The cursor is at the end of the plaintext.
    EndOfInput,
}

/// Observer for bytes moving from a source to its consumer.
///
/// Mirrors what a player's bandwidth meter wants to see.
pub trait TransferListener: Send + Sync {
    fn on_transfer_start(&self, _path: &Path) {}
    fn on_bytes_transferred(&self, _path: &Path, _bytes: usize) {}
    fn on_transfer_end(&self, _path: &Path) {}
}

enum Backend {
    Whole(Arc<dyn Decryptor>),
    Blocks {
        decryptor: Arc<dyn BlockDecryptor>,
        cache_blocks: NonZeroUsize,
    },
}

struct BlockState {
    reader: Box<dyn BlockReader>,
    cache: LruCache<u64, Bytes>,
    /// Blocks decrypted at least once, for progress reporting.
    seen: HashSet<u64>,
}

enum OpenState {
    Closed,
    Whole(Bytes),
    Blocks(BlockState),
}

/// Range-readable plaintext view of one encrypted file.
///
/// Not meant for concurrent reads: the consumer serializes its own calls.
pub struct StreamingDecryptingSource {
    path: PathBuf,
    backend: Backend,
    state: OpenState,
    plaintext_len: u64,
    position: u64,
    remaining: u64,
    transferred: u64,
    progress: Option<(Arc<DecryptionProgressRegistry>, ContentKey)>,
    listener: Option<Arc<dyn TransferListener>>,
}

impl StreamingDecryptingSource {
    /// Source that decrypts the whole file on `open`.
    pub fn new(path: impl Into<PathBuf>, decryptor: Arc<dyn Decryptor>) -> Self {
        Self::with_backend(path.into(), Backend::Whole(decryptor))
    }

    /// Source that decrypts blocks on demand, keeping up to `cache_blocks`
    /// decrypted blocks.
    pub fn blockwise(
        path: impl Into<PathBuf>,
        decryptor: Arc<dyn BlockDecryptor>,
        cache_blocks: usize,
    ) -> Self {
        let cache_blocks = NonZeroUsize::new(cache_blocks)
            .or(NonZeroUsize::new(DEFAULT_BLOCK_CACHE_BLOCKS))
            .unwrap_or(NonZeroUsize::MIN);
        Self::with_backend(
            path.into(),
            Backend::Blocks {
                decryptor,
                cache_blocks,
            },
        )
    }

    fn with_backend(path: PathBuf, backend: Backend) -> Self {
        Self {
            path,
            backend,
            state: OpenState::Closed,
            plaintext_len: 0,
            position: 0,
            remaining: 0,
            transferred: 0,
            progress: None,
            listener: None,
        }
    }

    /// Publish decrypt progress for `key` to `registry`.
    #[must_use]
    pub fn with_progress(
        mut self,
        registry: Arc<DecryptionProgressRegistry>,
        key: ContentKey,
    ) -> Self {
        self.progress = Some((registry, key));
        self
    }

    #[must_use]
    pub fn with_listener(mut self, listener: Arc<dyn TransferListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_open(&self) -> bool {
        !matches!(self.state, OpenState::Closed)
    }

    pub fn is_blockwise(&self) -> bool {
        matches!(self.backend, Backend::Blocks { .. })
    }

    /// Plaintext length, once open.
    pub fn len(&self) -> Option<u64> {
        self.is_open().then_some(self.plaintext_len)
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    /// Bytes left between the cursor and the end of the plaintext.
    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    fn publish_progress(&self, percent: u8) {
        if let Some((registry, key)) = &self.progress {
            registry.publish(key, percent);
        }
    }

    /// Prepare for reads starting at plaintext offset `position`.
    ///
    /// Returns the number of bytes available from there. A position at or
    /// past the end yields zero. Calling `open` on an already open source
    /// does nothing and returns the current remaining count; the new
    /// `position` is ignored.
    #[instrument(level = "debug", skip(self), fields(path = %self.path.display()))]
    pub fn open(&mut self, position: u64) -> Result<u64, StreamError> {
        if self.is_open() {
            trace!(remaining = self.remaining, "Already open");
            return Ok(self.remaining);
        }

        self.publish_progress(0);
        let state = match &self.backend {
            Backend::Whole(decryptor) => {
                let media = decryptor.decrypt(&self.path)?;
                self.plaintext_len = media.data.len() as u64;
                self.publish_progress(100);
                OpenState::Whole(media.data)
            }
            Backend::Blocks {
                decryptor,
                cache_blocks,
            } => {
                let reader = decryptor.open_blocks(&self.path)?;
                self.plaintext_len = reader.plaintext_len();
                if reader.block_count() == 0 {
                    self.publish_progress(100);
                }
                OpenState::Blocks(BlockState {
                    reader,
                    cache: LruCache::new(*cache_blocks),
                    seen: HashSet::new(),
                })
            }
        };

        self.state = state;
        self.position = position.min(self.plaintext_len);
        self.remaining = self.plaintext_len - self.position;
        self.transferred = 0;

        if let Some(listener) = &self.listener {
            listener.on_transfer_start(&self.path);
        }
        debug!(
            plaintext_len = self.plaintext_len,
            position = self.position,
            remaining = self.remaining,
            blockwise = self.is_blockwise(),
            "Opened streaming source"
        );
        Ok(self.remaining)
    }

    /// Copy up to `length` bytes from the cursor into `buffer[offset..]`.
    pub fn read(
        &mut self,
        buffer: &mut [u8],
        offset: usize,
        length: usize,
    ) -> Result<ReadOutcome, StreamError> {
        if offset.checked_add(length).is_none_or(|end| end > buffer.len()) {
            return Err(StreamError::InvalidRange {
                offset,
                length,
                buffer_len: buffer.len(),
            });
        }
        if !self.is_open() {
            return Err(StreamError::NotOpen {
                context: MediaContext::new()
                    .with_path(&self.path)
                    .with_operation("read"),
            });
        }
        if length == 0 {
            return Ok(ReadOutcome::Read(0));
        }
        if self.remaining == 0 {
            return Ok(ReadOutcome::EndOfInput);
        }

        let count = (length as u64).min(self.remaining) as usize;
        let target = &mut buffer[offset..offset + count];
        let copied = match &mut self.state {
            OpenState::Closed => 0,
            OpenState::Whole(data) => {
                let start = self.position as usize;
                target.copy_from_slice(&data[start..start + count]);
                count
            }
            OpenState::Blocks(blocks) => {
                let percent = Self::read_blocks(blocks, &self.path, self.position, target)?;
                if let Some(percent) = percent {
                    self.publish_progress(percent);
                }
                count
            }
        };

        self.position += copied as u64;
        self.remaining -= copied as u64;
        self.transferred += copied as u64;
        if let Some(listener) = &self.listener {
            listener.on_bytes_transferred(&self.path, copied);
        }
        trace!(copied, position = self.position, "Read from streaming source");
        Ok(ReadOutcome::Read(copied))
    }

    /// Fill `target` from the blocks starting at `position`. Returns a new
    /// progress percentage when a block was decrypted for the first time.
    fn read_blocks(
        blocks: &mut BlockState,
        path: &Path,
        mut position: u64,
        target: &mut [u8],
    ) -> Result<Option<u8>, DecryptError> {
        let mut progressed = false;
        let mut filled = 0;

        while filled < target.len() {
            let (index, within) = blocks.reader.locate(position);

            let block = match blocks.cache.get(&index) {
                Some(block) => block.clone(),
                None => {
                    let block = blocks.reader.decrypt_block(index)?;
                    trace!(block = index, "Decrypted block");
                    blocks.cache.put(index, block.clone());
                    progressed |= blocks.seen.insert(index);
                    block
                }
            };

            let available = block.len().saturating_sub(within);
            if available == 0 {
                // A short block before the end means the reader lied about
                // its length.
                return Err(DecryptError::IncompleteBlock {
                    expected: within + 1,
                    actual: block.len(),
                    context: MediaContext::new().with_path(path).with_block(index),
                });
            }
            let n = available.min(target.len() - filled);
            target[filled..filled + n].copy_from_slice(&block[within..within + n]);
            filled += n;
            position += n as u64;
        }

        if !progressed {
            return Ok(None);
        }
        let total = blocks.reader.block_count().max(1);
        let percent = (blocks.seen.len() as u64 * 100 / total).min(100) as u8;
        Ok(Some(percent))
    }

    /// Release the plaintext and notify the listener. Safe to call twice.
    pub fn close(&mut self) {
        if !self.is_open() {
            return;
        }
        self.state = OpenState::Closed;
        self.remaining = 0;
        if let Some(listener) = &self.listener {
            listener.on_transfer_end(&self.path);
        }
        debug!(
            path = %self.path.display(),
            transferred = self.transferred,
            "Closed streaming source"
        );
    }
}

impl Drop for StreamingDecryptingSource {
    fn drop(&mut self) {
        self.close();
    }
}

impl io::Read for StreamingDecryptingSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let len = buf.len();
        match StreamingDecryptingSource::read(self, buf, 0, len)? {
            ReadOutcome::Read(n) => Ok(n),
            ReadOutcome::EndOfInput => Ok(0),
        }
    }
}

impl std::fmt::Debug for StreamingDecryptingSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingDecryptingSource")
            .field("path", &self.path)
            .field("open", &self.is_open())
            .field("blockwise", &self.is_blockwise())
            .field("position", &self.position)
            .field("remaining", &self.remaining)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::DecryptedMedia;
    use std::io::Read;
    use std::sync::Mutex;

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 253) as u8).collect()
    }

    fn whole(len: usize) -> StreamingDecryptingSource {
        let data = Bytes::from(payload(len));
        let decryptor: Arc<dyn Decryptor> =
            Arc::new(move |_: &Path| -> Result<DecryptedMedia, DecryptError> {
                Ok(DecryptedMedia::new(data.clone(), "video/mp4"))
            });
        StreamingDecryptingSource::new("/vault/clip.bin", decryptor)
    }

    /// In-memory block reader with a tiny block size.
    struct MemBlocks {
        data: Bytes,
        block_size: usize,
        decrypts: Arc<Mutex<Vec<u64>>>,
    }

    impl BlockReader for MemBlocks {
        fn block_size(&self) -> usize {
            self.block_size
        }

        fn plaintext_len(&self) -> u64 {
            self.data.len() as u64
        }

        fn decrypt_block(&mut self, index: u64) -> Result<Bytes, DecryptError> {
            self.decrypts.lock().unwrap().push(index);
            let start = index as usize * self.block_size;
            let end = (start + self.block_size).min(self.data.len());
            Ok(self.data.slice(start..end))
        }
    }

    struct MemBlockDecryptor {
        data: Bytes,
        block_size: usize,
        decrypts: Arc<Mutex<Vec<u64>>>,
    }

    impl BlockDecryptor for MemBlockDecryptor {
        fn open_blocks(&self, _path: &Path) -> Result<Box<dyn BlockReader>, DecryptError> {
            Ok(Box::new(MemBlocks {
                data: self.data.clone(),
                block_size: self.block_size,
                decrypts: Arc::clone(&self.decrypts),
            }))
        }
    }

    fn blockwise(
        len: usize,
        block_size: usize,
        cache: usize,
    ) -> (StreamingDecryptingSource, Arc<Mutex<Vec<u64>>>) {
        let decrypts = Arc::new(Mutex::new(Vec::new()));
        let decryptor = Arc::new(MemBlockDecryptor {
            data: Bytes::from(payload(len)),
            block_size,
            decrypts: Arc::clone(&decrypts),
        });
        (
            StreamingDecryptingSource::blockwise("/vault/clip.bin", decryptor, cache),
            decrypts,
        )
    }

    /// Claims 64-byte blocks but returns only 10 bytes for each.
    struct ShortBlocks;

    impl BlockReader for ShortBlocks {
        fn block_size(&self) -> usize {
            64
        }

        fn plaintext_len(&self) -> u64 {
            256
        }

        fn decrypt_block(&mut self, _index: u64) -> Result<Bytes, DecryptError> {
            Ok(Bytes::from(payload(10)))
        }
    }

    impl BlockDecryptor for ShortBlocks {
        fn open_blocks(&self, _path: &Path) -> Result<Box<dyn BlockReader>, DecryptError> {
            Ok(Box::new(ShortBlocks))
        }
    }

    fn drain(source: &mut StreamingDecryptingSource, chunk: usize) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = vec![0u8; chunk];
        loop {
            match source.read(&mut buf, 0, chunk).unwrap() {
                ReadOutcome::Read(n) => out.extend_from_slice(&buf[..n]),
                ReadOutcome::EndOfInput => return out,
            }
        }
    }

    #[test]
    fn test_short_block_names_path() {
        let mut source =
            StreamingDecryptingSource::blockwise("/vault/short.bin", Arc::new(ShortBlocks), 2);
        source.open(20).unwrap();
        let mut buf = [0u8; 8];
        let err = source.read(&mut buf, 0, 8).unwrap_err();
        assert!(matches!(
            err,
            StreamError::Decrypt(DecryptError::IncompleteBlock { expected: 21, actual: 10, .. })
        ));
        assert!(err.to_string().contains("short.bin"), "{err}");
    }

    #[test]
    fn test_open_at_end_reads_nothing() {
        let mut source = whole(1000);
        assert_eq!(source.open(1000).unwrap(), 0);
        let mut buf = [0u8; 16];
        assert_eq!(source.read(&mut buf, 0, 16).unwrap(), ReadOutcome::EndOfInput);
    }

    #[test]
    fn test_open_past_end_is_zero() {
        let mut source = whole(10);
        assert_eq!(source.open(50).unwrap(), 0);
        assert_eq!(source.position(), 10);
    }

    #[test]
    fn test_full_read_yields_payload() {
        let mut source = whole(10_000);
        assert_eq!(source.open(0).unwrap(), 10_000);
        assert_eq!(drain(&mut source, 777), payload(10_000));
        assert_eq!(source.remaining(), 0);
    }

    #[test]
    fn test_read_respects_offset() {
        let mut source = whole(100);
        source.open(10).unwrap();
        let mut buf = [0xEEu8; 8];
        assert_eq!(source.read(&mut buf, 3, 4).unwrap(), ReadOutcome::Read(4));
        assert_eq!(buf, [0xEE, 0xEE, 0xEE, 10, 11, 12, 13, 0xEE]);
        assert_eq!(source.position(), 14);
    }

    #[test]
    fn test_second_open_is_noop() {
        let mut source = whole(100);
        assert_eq!(source.open(40).unwrap(), 60);
        let mut buf = [0u8; 10];
        source.read(&mut buf, 0, 10).unwrap();
        assert_eq!(source.open(0).unwrap(), 50);
        assert_eq!(source.position(), 50);
    }

    #[test]
    fn test_read_errors() {
        let mut source = whole(100);
        let mut buf = [0u8; 4];
        assert!(matches!(
            source.read(&mut buf, 0, 4),
            Err(StreamError::NotOpen { .. })
        ));
        source.open(0).unwrap();
        assert!(matches!(
            source.read(&mut buf, 2, 3),
            Err(StreamError::InvalidRange { .. })
        ));
        assert_eq!(source.read(&mut buf, 0, 0).unwrap(), ReadOutcome::Read(0));
    }

    #[test]
    fn test_close_is_idempotent_and_notifies_once() {
        #[derive(Default)]
        struct Counting {
            starts: Mutex<u32>,
            bytes: Mutex<usize>,
            ends: Mutex<u32>,
        }
        impl TransferListener for Counting {
            fn on_transfer_start(&self, _: &Path) {
                *self.starts.lock().unwrap() += 1;
            }
            fn on_bytes_transferred(&self, _: &Path, bytes: usize) {
                *self.bytes.lock().unwrap() += bytes;
            }
            fn on_transfer_end(&self, _: &Path) {
                *self.ends.lock().unwrap() += 1;
            }
        }

        let listener = Arc::new(Counting::default());
        let mut source =
            whole(64).with_listener(Arc::clone(&listener) as Arc<dyn TransferListener>);
        source.open(0).unwrap();
        drain(&mut source, 10);
        source.close();
        source.close();
        drop(source);

        assert_eq!(*listener.starts.lock().unwrap(), 1);
        assert_eq!(*listener.bytes.lock().unwrap(), 64);
        assert_eq!(*listener.ends.lock().unwrap(), 1);
    }

    #[test]
    fn test_reopen_after_close() {
        let mut source = whole(30);
        source.open(0).unwrap();
        source.close();
        assert!(!source.is_open());
        assert_eq!(source.open(5).unwrap(), 25);
    }

    #[test]
    fn test_blockwise_matches_payload_across_boundaries() {
        let (mut source, decrypts) = blockwise(1000, 64, 4);
        assert_eq!(source.open(0).unwrap(), 1000);
        assert!(decrypts.lock().unwrap().is_empty());
        assert_eq!(drain(&mut source, 50), payload(1000));
        assert_eq!(decrypts.lock().unwrap().len(), 16);
    }

    #[test]
    fn test_blockwise_seek_only_touches_needed_blocks() {
        let (mut source, decrypts) = blockwise(1000, 100, 4);
        assert_eq!(source.open(950).unwrap(), 50);
        let mut buf = [0u8; 100];
        assert_eq!(source.read(&mut buf, 0, 100).unwrap(), ReadOutcome::Read(50));
        assert_eq!(&buf[..50], &payload(1000)[950..]);
        assert_eq!(*decrypts.lock().unwrap(), vec![9]);
    }

    #[test]
    fn test_block_cache_avoids_redecrypt() {
        let (mut source, decrypts) = blockwise(256, 64, 2);
        source.open(0).unwrap();
        let mut buf = [0u8; 8];
        for _ in 0..8 {
            source.read(&mut buf, 0, 8).unwrap();
        }
        // 64 bytes read, all inside block 0.
        assert_eq!(*decrypts.lock().unwrap(), vec![0]);
    }

    #[test]
    fn test_blockwise_progress() {
        let registry = Arc::new(DecryptionProgressRegistry::new());
        let key = ContentKey::from_path("/vault/clip.bin");
        let (source, _) = blockwise(400, 100, 8);
        let mut source = source.with_progress(Arc::clone(&registry), key);
        let _rx = registry.progress_for(key);

        source.open(0).unwrap();
        assert_eq!(registry.current(&key), 0);
        let mut buf = [0u8; 100];
        source.read(&mut buf, 0, 100).unwrap();
        assert_eq!(registry.current(&key), 25);
        drain(&mut source, 100);
        assert_eq!(registry.current(&key), 100);
    }

    #[test]
    fn test_io_read_adapter() {
        let mut source = whole(5000);
        source.open(0).unwrap();
        let mut out = Vec::new();
        source.read_to_end(&mut out).unwrap();
        assert_eq!(out, payload(5000));

        let mut closed = whole(10);
        let err = closed.read_to_end(&mut Vec::new()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }

    #[test]
    fn test_empty_payload() {
        let mut source = whole(0);
        assert_eq!(source.open(0).unwrap(), 0);
        let mut buf = [0u8; 1];
        assert_eq!(source.read(&mut buf, 0, 1).unwrap(), ReadOutcome::EndOfInput);
    }
}
