//! Configuration for the media core.
//!
//! Defaults are sized for a phone-class device: a 64 MiB plaintext cache, a
//! 2 MiB small-object threshold that pressure can move between 512 KiB and
//! 4 MiB, and a buffer pool with 8/16/32/64 KiB size classes.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::key::KeyDerivation;

const KIB: usize = 1024;
const MIB: usize = 1024 * KIB;

/// Lowest value the adaptive threshold can reach (512 KiB).
pub const DEFAULT_THRESHOLD_FLOOR: usize = 512 * KIB;

/// Highest value the adaptive threshold can reach (4 MiB).
pub const DEFAULT_THRESHOLD_CEILING: usize = 4 * MIB;

/// Threshold value at startup (2 MiB).
pub const DEFAULT_THRESHOLD_INITIAL: usize = 2 * MIB;

/// Default decrypt cache capacity in bytes (64 MiB).
pub const DEFAULT_CACHE_CAPACITY_BYTES: u64 = 64 * MIB as u64;

/// Default number of decrypted blocks a streaming source keeps.
pub const DEFAULT_BLOCK_CACHE_BLOCKS: usize = 16;

/// Default buffer pool size classes.
pub const DEFAULT_SIZE_CLASSES: [usize; 4] = [8 * KIB, 16 * KIB, 32 * KIB, 64 * KIB];

/// Default number of buffers retained per size class.
pub const DEFAULT_MAX_PER_BUCKET: usize = 8;

/// Configuration errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("threshold floor {floor} must be positive and not exceed ceiling {ceiling}")]
    InvalidThresholdBounds { floor: usize, ceiling: usize },

    #[error("cache capacity must be greater than zero")]
    ZeroCacheCapacity,

    #[error("buffer pool needs at least one size class")]
    NoSizeClasses,

    #[error("buffer pool size classes must be non-zero")]
    ZeroSizeClass,

    #[error("streaming block cache must hold at least one block")]
    ZeroBlockCache,
}

/// Bounds of the adaptive small-object threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdConfig {
    pub floor: usize,
    pub ceiling: usize,
    /// Starting value, clamped into `[floor, ceiling]`.
    pub initial: usize,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            floor: DEFAULT_THRESHOLD_FLOOR,
            ceiling: DEFAULT_THRESHOLD_CEILING,
            initial: DEFAULT_THRESHOLD_INITIAL,
        }
    }
}

impl ThresholdConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.floor == 0 || self.floor > self.ceiling {
            return Err(ConfigError::InvalidThresholdBounds {
                floor: self.floor,
                ceiling: self.ceiling,
            });
        }
        Ok(())
    }
}

/// Buffer pool layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Buffer sizes in bytes. Order does not matter; duplicates are ignored.
    pub size_classes: Vec<usize>,
    /// Maximum number of idle buffers kept per size class.
    pub max_per_bucket: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size_classes: DEFAULT_SIZE_CLASSES.to_vec(),
            max_per_bucket: DEFAULT_MAX_PER_BUCKET,
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.size_classes.is_empty() {
            return Err(ConfigError::NoSizeClasses);
        }
        if self.size_classes.contains(&0) {
            return Err(ConfigError::ZeroSizeClass);
        }
        Ok(())
    }
}

/// Top-level configuration for [`MediaCore`](crate::MediaCore).
///
/// Deserializes with every field optional, so a config file only needs to
/// name what it changes:
///
/// ```
/// use oxmedia_core::CoreConfig;
///
/// let config: CoreConfig = serde_json::from_str(r#"{"cache_capacity_bytes": 1048576}"#).unwrap();
/// assert_eq!(config.cache_capacity_bytes, 1_048_576);
/// assert_eq!(config.block_cache_blocks, 16);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Total plaintext bytes the decrypt cache may hold.
    pub cache_capacity_bytes: u64,
    pub threshold: ThresholdConfig,
    pub pool: PoolConfig,
    /// Decrypted blocks kept per block-wise streaming source.
    pub block_cache_blocks: usize,
    pub key_derivation: KeyDerivation,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            cache_capacity_bytes: DEFAULT_CACHE_CAPACITY_BYTES,
            threshold: ThresholdConfig::default(),
            pool: PoolConfig::default(),
            block_cache_blocks: DEFAULT_BLOCK_CACHE_BLOCKS,
            key_derivation: KeyDerivation::default(),
        }
    }
}

impl CoreConfig {
    /// Check every section, returning the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache_capacity_bytes == 0 {
            return Err(ConfigError::ZeroCacheCapacity);
        }
        if self.block_cache_blocks == 0 {
            return Err(ConfigError::ZeroBlockCache);
        }
        self.threshold.validate()?;
        self.pool.validate()
    }

    /// Sets the decrypt cache capacity in bytes.
    #[must_use]
    pub fn cache_capacity_bytes(mut self, bytes: u64) -> Self {
        self.cache_capacity_bytes = bytes;
        self
    }

    /// Sets the adaptive threshold bounds.
    #[must_use]
    pub fn threshold(mut self, threshold: ThresholdConfig) -> Self {
        self.threshold = threshold;
        self
    }

    /// Sets the buffer pool layout.
    #[must_use]
    pub fn pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    /// Sets how many decrypted blocks a streaming source keeps.
    #[must_use]
    pub fn block_cache_blocks(mut self, blocks: usize) -> Self {
        self.block_cache_blocks = blocks;
        self
    }

    /// Sets how content keys are derived.
    #[must_use]
    pub fn key_derivation(mut self, derivation: KeyDerivation) -> Self {
        self.key_derivation = derivation;
        self
    }
}
