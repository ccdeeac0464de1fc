//! Decrypt, cache and streaming core for encrypted media vaults.
//!
//! Every consumer that needs plaintext from the vault goes through one of two
//! paths:
//!
//! - [`DecryptCache`] for still images and thumbnails. Concurrent requests for
//!   the same item are coalesced onto a single decrypt, and small results are
//!   kept in a byte-bounded LRU whose admission limit follows memory pressure
//!   through [`AdaptiveThresholdController`].
//! - [`StreamingDecryptingSource`] for video playback. It serves range reads
//!   either from one whole-file decrypt or, when a [`BlockDecryptor`] is
//!   available, block by block.
//!
//! [`MediaCore`] wires the pieces together for an application.

pub mod cache;
pub mod config;
pub mod crypto;
pub mod error;
pub mod key;
pub mod media_core;
pub mod metrics;
pub mod mime;
pub mod pool;
pub mod progress;
pub mod sidecar;
pub mod stream;

pub use cache::{
    AdaptiveThresholdController, DecryptCache, DecryptCacheBuilder, MemoryPressure, WeightedLru,
};
pub use config::{CoreConfig, PoolConfig, ThresholdConfig};
pub use crypto::{BlockDecryptor, BlockReader, DecryptedMedia, Decryptor, MediaKey, VaultDecryptor};
pub use error::{
    CacheError, ConfigError, CoreError, DecryptError, MediaContext, SidecarError, StreamError,
};
pub use key::{ContentKey, KeyDerivation};
pub use media_core::{MediaCore, MediaCoreBuilder};
pub use metrics::{MetricsCollector, MetricsSnapshot};
pub use pool::{BufferPool, PoolStats};
pub use progress::DecryptionProgressRegistry;
pub use sidecar::{MetadataSidecarCache, SidecarKey, SidecarMetadataEntry};
pub use stream::{ReadOutcome, StreamingDecryptingSource, TransferListener};
