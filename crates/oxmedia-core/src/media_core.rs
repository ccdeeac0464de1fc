//! Application-level owner of the media core components.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::cache::{AdaptiveThresholdController, CacheError, DecryptCache, MemoryPressure};
use crate::config::{ConfigError, CoreConfig};
use crate::crypto::{BlockDecryptor, DecryptedMedia, Decryptor, MediaKey, VaultDecryptor};
use crate::metrics::{MetricsCollector, MetricsSnapshot};
use crate::pool::BufferPool;
use crate::progress::DecryptionProgressRegistry;
use crate::sidecar::{MetadataSidecarCache, SidecarError};
use crate::stream::StreamingDecryptingSource;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Sidecar store error: {0}")]
    Sidecar(#[from] SidecarError),

    #[error("No decryptor configured: set a decryptor or a vault key")]
    MissingDecryptor,
}

/// Owns one instance of every shared component, built from a [`CoreConfig`].
///
/// Construct it once at startup and hand out references (or an `Arc`);
/// nothing in the crate relies on global state.
pub struct MediaCore {
    config: CoreConfig,
    metrics: Arc<MetricsCollector>,
    threshold: Arc<AdaptiveThresholdController>,
    pool: Arc<BufferPool>,
    progress: Arc<DecryptionProgressRegistry>,
    cache: DecryptCache,
    sidecars: Option<MetadataSidecarCache>,
    block_decryptor: Option<Arc<dyn BlockDecryptor>>,
    decryptor: Arc<dyn Decryptor>,
}

impl MediaCore {
    pub fn builder() -> MediaCoreBuilder {
        MediaCoreBuilder::default()
    }

    /// Plaintext for `path` through the decrypt cache.
    pub async fn get(&self, path: &Path) -> Result<DecryptedMedia, CacheError> {
        self.cache.get(path).await
    }

    /// Streaming source for `path`.
    ///
    /// Block-wise when a block decryptor is available, whole-file otherwise.
    /// Progress is published under the same key the cache uses.
    pub fn open_stream(&self, path: impl Into<PathBuf>) -> StreamingDecryptingSource {
        let path = path.into();
        let key = self.cache.key_for(&path).ok();

        let source = match &self.block_decryptor {
            Some(blocks) => StreamingDecryptingSource::blockwise(
                path,
                Arc::clone(blocks),
                self.config.block_cache_blocks,
            ),
            None => StreamingDecryptingSource::new(path, Arc::clone(&self.decryptor)),
        };

        match key {
            Some(key) => source.with_progress(Arc::clone(&self.progress), key),
            None => source,
        }
    }

    /// Apply a memory-pressure signal. Returns the new admission threshold.
    ///
    /// On critical pressure, cached entries above the new threshold are
    /// dropped and idle pooled buffers are released.
    pub fn handle_pressure(&self, level: MemoryPressure) -> usize {
        let threshold = self.threshold.on_pressure(level);
        if level == MemoryPressure::Critical {
            let purged = self.cache.purge_above(threshold);
            let freed = self.pool.clear();
            info!(threshold, purged, freed_pool_bytes = freed, "Critical memory pressure");
        } else {
            debug!(%level, threshold, "Memory pressure signal");
        }
        threshold
    }

    /// Feed pressure signals from `signals` into [`handle_pressure`](Self::handle_pressure)
    /// until the sender side is dropped.
    pub fn spawn_pressure_listener(
        self: &Arc<Self>,
        mut signals: mpsc::Receiver<MemoryPressure>,
    ) -> JoinHandle<()> {
        let core = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(level) = signals.recv().await {
                core.handle_pressure(level);
            }
            debug!("Pressure channel closed");
        })
    }

    pub fn cache(&self) -> &DecryptCache {
        &self.cache
    }

    pub fn sidecars(&self) -> Option<&MetadataSidecarCache> {
        self.sidecars.as_ref()
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn threshold(&self) -> &Arc<AdaptiveThresholdController> {
        &self.threshold
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    pub fn progress(&self) -> &Arc<DecryptionProgressRegistry> {
        &self.progress
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }
}

impl std::fmt::Debug for MediaCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaCore")
            .field("config", &self.config)
            .field("cache", &self.cache)
            .field("blockwise_streams", &self.block_decryptor.is_some())
            .finish_non_exhaustive()
    }
}

/// Builder for [`MediaCore`].
#[derive(Default)]
pub struct MediaCoreBuilder {
    config: CoreConfig,
    decryptor: Option<Arc<dyn Decryptor>>,
    block_decryptor: Option<Arc<dyn BlockDecryptor>>,
    vault_key: Option<MediaKey>,
    sidecar_dir: Option<PathBuf>,
}

impl MediaCoreBuilder {
    #[must_use]
    pub fn config(mut self, config: CoreConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn decryptor(mut self, decryptor: Arc<dyn Decryptor>) -> Self {
        self.decryptor = Some(decryptor);
        self
    }

    #[must_use]
    pub fn block_decryptor(mut self, decryptor: Arc<dyn BlockDecryptor>) -> Self {
        self.block_decryptor = Some(decryptor);
        self
    }

    /// Use the built-in vault format for both whole-file and block-wise
    /// decryption, sharing the core's buffer pool. Explicitly set
    /// decryptors take precedence.
    #[must_use]
    pub fn vault_key(mut self, key: MediaKey) -> Self {
        self.vault_key = Some(key);
        self
    }

    /// Directory for metadata sidecar records.
    #[must_use]
    pub fn sidecar_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.sidecar_dir = Some(dir.into());
        self
    }

    pub fn build(self) -> Result<MediaCore, CoreError> {
        let config = self.config;
        config.validate()?;

        let metrics = Arc::new(MetricsCollector::new());
        let threshold = Arc::new(AdaptiveThresholdController::new(config.threshold));
        let pool = Arc::new(BufferPool::with_config(&config.pool));
        let progress = Arc::new(DecryptionProgressRegistry::new());

        let vault = self
            .vault_key
            .map(|key| Arc::new(VaultDecryptor::with_pool(key, Arc::clone(&pool))));

        let decryptor: Arc<dyn Decryptor> = match (self.decryptor, &vault) {
            (Some(decryptor), _) => decryptor,
            (None, Some(vault)) => Arc::clone(vault) as Arc<dyn Decryptor>,
            (None, None) => return Err(CoreError::MissingDecryptor),
        };
        let block_decryptor = self
            .block_decryptor
            .or_else(|| vault.map(|v| v as Arc<dyn BlockDecryptor>));

        let cache = DecryptCache::builder(Arc::clone(&decryptor))
            .capacity_bytes(config.cache_capacity_bytes)
            .metrics(Arc::clone(&metrics))
            .threshold_controller(Arc::clone(&threshold))
            .progress(Arc::clone(&progress))
            .key_derivation(config.key_derivation)
            .build();

        let sidecars = self
            .sidecar_dir
            .map(|dir| MetadataSidecarCache::new(dir, Arc::clone(&metrics)))
            .transpose()?;

        debug!(
            capacity = config.cache_capacity_bytes,
            threshold = threshold.current_threshold(),
            blockwise = block_decryptor.is_some(),
            "Media core ready"
        );

        Ok(MediaCore {
            config,
            metrics,
            threshold,
            pool,
            progress,
            cache,
            sidecars,
            block_decryptor,
            decryptor,
        })
    }
}
