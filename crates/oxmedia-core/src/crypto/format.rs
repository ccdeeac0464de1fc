//! Layout of an encrypted media file.
//!
//! ```text
//! header (68 bytes)  = nonce (12) || AES-GCM(reserved 0xFF x8 || content key) || tag (16)
//! block  (<= 32796)  = nonce (12) || AES-GCM(plaintext <= 32 KiB) || tag (16)
//! ```
//!
//! Each block authenticates `block_number (u64 BE) || header_nonce` as AAD,
//! so blocks cannot be reordered or moved between files. An empty file still
//! carries one empty block.

/// Size of the file header in bytes (nonce + encrypted payload + tag).
pub const HEADER_SIZE: usize = 68;

/// Size of the header nonce in bytes.
pub const HEADER_NONCE_SIZE: usize = 12;

/// Size of a block nonce in bytes.
pub const BLOCK_NONCE_SIZE: usize = 12;

/// Size of the GCM authentication tag in bytes.
pub const TAG_SIZE: usize = 16;

/// Maximum plaintext bytes per block (32 KiB).
pub const BLOCK_PLAINTEXT_SIZE: usize = 32 * 1024;

/// Per-block overhead (nonce + tag).
pub const BLOCK_OVERHEAD: usize = BLOCK_NONCE_SIZE + TAG_SIZE;

/// Maximum encrypted block size.
pub const BLOCK_ENCRYPTED_SIZE: usize = BLOCK_PLAINTEXT_SIZE + BLOCK_OVERHEAD;

/// Reserved header prefix written before the content key.
pub(crate) const HEADER_RESERVED: [u8; 8] = [0xFF; 8];

/// Block containing the given plaintext offset.
#[inline]
pub fn plaintext_to_block(offset: u64) -> u64 {
    offset / BLOCK_PLAINTEXT_SIZE as u64
}

/// Offset of `offset` within its block.
#[inline]
pub fn plaintext_to_block_offset(offset: u64) -> usize {
    (offset % BLOCK_PLAINTEXT_SIZE as u64) as usize
}

/// Position of block `block` in the encrypted file.
#[inline]
pub fn block_to_encrypted_offset(block: u64) -> u64 {
    HEADER_SIZE as u64 + block * BLOCK_ENCRYPTED_SIZE as u64
}

/// Number of plaintext blocks for `plaintext_len` bytes (zero for empty).
#[inline]
pub fn block_count(plaintext_len: u64) -> u64 {
    plaintext_len.div_ceil(BLOCK_PLAINTEXT_SIZE as u64)
}

/// Encrypted file size for `plaintext_len` bytes of plaintext.
pub fn plaintext_to_encrypted_size(plaintext_len: u64) -> u64 {
    let blocks = block_count(plaintext_len).max(1);
    HEADER_SIZE as u64 + plaintext_len + blocks * BLOCK_OVERHEAD as u64
}

/// Plaintext size implied by an encrypted file size.
///
/// Returns `None` if the size cannot belong to a well-formed file.
pub fn encrypted_to_plaintext_size(encrypted_size: u64) -> Option<u64> {
    let body = encrypted_size.checked_sub(HEADER_SIZE as u64)?;
    if body < BLOCK_OVERHEAD as u64 {
        return None;
    }

    let full_blocks = body / BLOCK_ENCRYPTED_SIZE as u64;
    let remainder = body % BLOCK_ENCRYPTED_SIZE as u64;
    let mut plaintext = full_blocks * BLOCK_PLAINTEXT_SIZE as u64;

    if remainder > 0 {
        if remainder < BLOCK_OVERHEAD as u64 {
            return None;
        }
        plaintext += remainder - BLOCK_OVERHEAD as u64;
    }
    Some(plaintext)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_math() {
        assert_eq!(plaintext_to_block(0), 0);
        assert_eq!(plaintext_to_block(32767), 0);
        assert_eq!(plaintext_to_block(32768), 1);
        assert_eq!(plaintext_to_block_offset(32770), 2);
        assert_eq!(block_to_encrypted_offset(0), 68);
        assert_eq!(block_to_encrypted_offset(2), 68 + 2 * 32796);
    }

    #[test]
    fn test_block_count() {
        assert_eq!(block_count(0), 0);
        assert_eq!(block_count(1), 1);
        assert_eq!(block_count(32768), 1);
        assert_eq!(block_count(32769), 2);
    }

    #[test]
    fn test_size_conversion_agrees() {
        for len in [0u64, 1, 100, 32767, 32768, 32769, 65536, 100_000] {
            let encrypted = plaintext_to_encrypted_size(len);
            assert_eq!(encrypted_to_plaintext_size(encrypted), Some(len), "len {len}");
        }
    }

    #[test]
    fn test_invalid_sizes() {
        assert_eq!(encrypted_to_plaintext_size(0), None);
        assert_eq!(encrypted_to_plaintext_size(68), None);
        assert_eq!(encrypted_to_plaintext_size(68 + 27), None);
        assert_eq!(encrypted_to_plaintext_size(68 + 32796 + 5), None);
    }
}
