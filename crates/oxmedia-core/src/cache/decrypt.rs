//! Single-flight decrypt cache.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{Span, debug, instrument, trace, warn};

use super::single_flight::{Attach, EpisodeGuard, EpisodeResult, InFlightDecrypts};
use super::store::WeightedLru;
use super::threshold::AdaptiveThresholdController;
use crate::config::{DEFAULT_CACHE_CAPACITY_BYTES, DEFAULT_THRESHOLD_INITIAL};
use crate::crypto::{DecryptError, DecryptedMedia, Decryptor};
use crate::error::MediaContext;
use crate::key::{ContentKey, KeyDerivation};
use crate::metrics::MetricsCollector;
use crate::progress::DecryptionProgressRegistry;

#[derive(Error, Debug)]
pub enum CacheError {
    /// The decryptor failed. Every caller of the episode gets the same error.
    #[error("Decryption error: {0}")]
    Decrypt(#[source] Arc<DecryptError>),

    #[error("Timed out after {timeout:?} waiting for {}", .path.display())]
    Timeout { path: PathBuf, timeout: Duration },

    /// The decrypt task ended without publishing a result (it panicked).
    #[error("Decrypt episode aborted for {context}")]
    EpisodeAborted { context: MediaContext },

    /// The content key could not be derived.
    #[error("IO error for {context}: {source}")]
    Io {
        #[source]
        source: io::Error,
        context: MediaContext,
    },
}

impl CacheError {
    /// The underlying decrypt failure, if that is what this is.
    pub fn decrypt_error(&self) -> Option<&DecryptError> {
        match self {
            CacheError::Decrypt(e) => Some(e),
            _ => None,
        }
    }
}

/// How the admission limit is chosen.
enum Admission {
    Adaptive(Arc<AdaptiveThresholdController>),
    Fixed(usize),
}

impl Admission {
    #[inline]
    fn limit(&self) -> usize {
        match self {
            Admission::Adaptive(controller) => controller.current_threshold(),
            Admission::Fixed(limit) => *limit,
        }
    }
}

fn media_weight(media: &DecryptedMedia) -> u64 {
    media.len() as u64
}

struct CacheInner {
    decryptor: Arc<dyn Decryptor>,
    store: WeightedLru<ContentKey, DecryptedMedia>,
    in_flight: Arc<InFlightDecrypts>,
    metrics: Arc<MetricsCollector>,
    admission: Admission,
    progress: Option<Arc<DecryptionProgressRegistry>>,
    key_derivation: KeyDerivation,
    /// Bumped by every removal (invalidate, purge, clear).
    generation: AtomicU64,
}

impl CacheInner {
    fn bump_generation(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Admit `media` unless a removal ran since `started_at`.
    ///
    /// The entry is inserted first and taken back out if the generation
    /// moved, so a removal racing with the insert cannot be lost.
    fn admit(&self, key: ContentKey, media: &DecryptedMedia, started_at: u64) -> bool {
        if !self.store.insert(key, media.clone()) {
            return false;
        }
        if self.generation.load(Ordering::SeqCst) != started_at {
            self.store.remove(&key);
            return false;
        }
        true
    }

    /// Run the decrypt for one episode and publish its result.
    ///
    /// The store is updated before the in-flight entry is removed, so a
    /// request arriving in between sees either the entry or the cached value.
    fn run_episode(&self, guard: EpisodeGuard, path: &Path) {
        let key = *guard.key();
        if let Some(progress) = &self.progress {
            progress.publish(&key, 0);
        }

        self.metrics.record_decrypt_invocation();
        let generation = self.generation.load(Ordering::SeqCst);
        let started = Instant::now();
        let result: EpisodeResult = match self.decryptor.decrypt(path) {
            Ok(media) => {
                let limit = self.admission.limit();
                let admitted = media.len() <= limit && self.admit(key, &media, generation);
                debug!(
                    len = media.len(),
                    limit,
                    admitted,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Decrypt complete"
                );
                if let Some(progress) = &self.progress {
                    progress.publish(&key, 100);
                }
                Ok(media)
            }
            Err(e) => {
                warn!(error = %e, "Decrypt failed");
                if let Some(progress) = &self.progress {
                    progress.publish(&key, 0);
                }
                Err(Arc::new(e))
            }
        };

        let waiters = guard.complete(result);
        trace!(waiters, "Released episode waiters");
    }
}

/// Content-addressed cache of decrypted media with single-flight decrypts.
///
/// For a given key the decryptor runs at most once per miss episode: callers
/// that arrive while a decrypt is in flight wait for it and receive the same
/// result. Results no larger than the admission threshold are kept in a
/// byte-bounded LRU; larger results are returned but not cached. Failures are
/// never cached. A decrypt that was in flight when the cache was invalidated,
/// purged or cleared still answers its callers but is not cached.
///
/// The decrypt itself runs on tokio's blocking pool and is detached from the
/// caller, so a caller that stops waiting (dropped future or
/// [`get_with_timeout`](Self::get_with_timeout)) does not cancel it for others.
#[derive(Clone)]
pub struct DecryptCache {
    inner: Arc<CacheInner>,
}

impl DecryptCache {
    /// Cache with default capacity and a fixed 2 MiB admission threshold.
    pub fn new(decryptor: Arc<dyn Decryptor>) -> Self {
        Self::builder(decryptor).build()
    }

    pub fn builder(decryptor: Arc<dyn Decryptor>) -> DecryptCacheBuilder {
        DecryptCacheBuilder {
            decryptor,
            capacity_bytes: DEFAULT_CACHE_CAPACITY_BYTES,
            metrics: None,
            admission: Admission::Fixed(DEFAULT_THRESHOLD_INITIAL),
            progress: None,
            key_derivation: KeyDerivation::default(),
        }
    }

    /// Content key for `path` under this cache's derivation strategy.
    pub fn key_for(&self, path: &Path) -> Result<ContentKey, CacheError> {
        ContentKey::derive(path, self.inner.key_derivation).map_err(|source| CacheError::Io {
            source,
            context: MediaContext::new()
                .with_path(path)
                .with_operation("derive_key"),
        })
    }

    /// Plaintext for `path`, from the cache or a (possibly shared) decrypt.
    #[instrument(level = "debug", skip(self), fields(path = %path.display()))]
    pub async fn get(&self, path: &Path) -> Result<DecryptedMedia, CacheError> {
        let key = self.key_for(path)?;

        if let Some(hit) = self.inner.store.get(&key) {
            self.inner.metrics.record_cache_hit();
            trace!("Cache hit");
            return Ok(hit);
        }

        let receiver = match self.inner.in_flight.try_attach(key) {
            Attach::Waiter(receiver) => {
                self.inner.metrics.record_coalesced_waiter();
                trace!("Joined in-flight decrypt");
                receiver
            }
            Attach::Owner(receiver) => {
                self.start_episode(key, path);
                receiver
            }
        };

        Self::await_episode(receiver, path).await
    }

    /// Like [`get`](Self::get), but gives up waiting after `timeout`.
    ///
    /// The decrypt keeps running for any other callers and still populates
    /// the cache when it finishes.
    pub async fn get_with_timeout(
        &self,
        path: &Path,
        timeout: Duration,
    ) -> Result<DecryptedMedia, CacheError> {
        match tokio::time::timeout(timeout, self.get(path)).await {
            Ok(result) => result,
            Err(_) => {
                debug!(path = %path.display(), ?timeout, "Gave up waiting for decrypt");
                Err(CacheError::Timeout {
                    path: path.to_path_buf(),
                    timeout,
                })
            }
        }
    }

    fn start_episode(&self, key: ContentKey, path: &Path) {
        let guard = EpisodeGuard::new(Arc::clone(&self.inner.in_flight), key);

        // The previous episode may have filled the store between our lookup
        // and becoming owner.
        if let Some(hit) = self.inner.store.peek(&key) {
            self.inner.metrics.record_cache_hit();
            guard.complete(Ok(hit));
            return;
        }

        self.inner.metrics.record_cache_miss();
        let inner = Arc::clone(&self.inner);
        let path = path.to_path_buf();
        let span = Span::current();
        let episode = move || span.in_scope(|| inner.run_episode(guard, &path));

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                // Detached; the guard inside the closure ends the episode if
                // the task never runs to completion.
                drop(handle.spawn_blocking(episode));
            }
            Err(_) => episode(),
        }
    }

    async fn await_episode(
        mut receiver: broadcast::Receiver<EpisodeResult>,
        path: &Path,
    ) -> Result<DecryptedMedia, CacheError> {
        match receiver.recv().await {
            Ok(Ok(media)) => Ok(media),
            Ok(Err(e)) => Err(CacheError::Decrypt(e)),
            Err(_) => Err(CacheError::EpisodeAborted {
                context: MediaContext::new().with_path(path).with_operation("get"),
            }),
        }
    }

    /// True if a decrypted result for `path` is currently cached.
    pub fn contains(&self, path: &Path) -> bool {
        self.key_for(path)
            .is_ok_and(|key| self.inner.store.contains(&key))
    }

    pub fn contains_key(&self, key: &ContentKey) -> bool {
        self.inner.store.contains(key)
    }

    /// Drop the cached result for `path`. Returns whether one was present.
    pub fn invalidate(&self, path: &Path) -> Result<bool, CacheError> {
        let key = self.key_for(path)?;
        Ok(self.invalidate_key(&key))
    }

    pub fn invalidate_key(&self, key: &ContentKey) -> bool {
        self.inner.bump_generation();
        self.inner.store.remove(key).is_some()
    }

    /// Drop cached results larger than `limit` bytes.
    pub fn purge_above(&self, limit: usize) -> usize {
        self.inner.bump_generation();
        let removed = self.inner.store.remove_heavier_than(limit as u64);
        if removed > 0 {
            debug!(removed, limit, "Purged oversized cache entries");
        }
        removed
    }

    pub fn clear(&self) {
        self.inner.bump_generation();
        self.inner.store.clear();
    }

    pub fn entry_count(&self) -> usize {
        self.inner.store.len()
    }

    /// Total plaintext bytes currently cached.
    pub fn weighted_size(&self) -> u64 {
        self.inner.store.weighted_size()
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.inner.store.capacity()
    }

    /// Admission limit in effect right now.
    pub fn admission_threshold(&self) -> usize {
        self.inner.admission.limit()
    }

    pub fn in_flight_count(&self) -> usize {
        self.inner.in_flight.in_flight_count()
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.inner.metrics
    }
}

impl std::fmt::Debug for DecryptCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecryptCache")
            .field("entries", &self.entry_count())
            .field("weighted_size", &self.weighted_size())
            .field("capacity_bytes", &self.capacity_bytes())
            .field("in_flight", &self.in_flight_count())
            .finish_non_exhaustive()
    }
}

/// Builder for [`DecryptCache`].
pub struct DecryptCacheBuilder {
    decryptor: Arc<dyn Decryptor>,
    capacity_bytes: u64,
    metrics: Option<Arc<MetricsCollector>>,
    admission: Admission,
    progress: Option<Arc<DecryptionProgressRegistry>>,
    key_derivation: KeyDerivation,
}

impl DecryptCacheBuilder {
    /// Maximum total plaintext bytes held by the store.
    #[must_use]
    pub fn capacity_bytes(mut self, bytes: u64) -> Self {
        self.capacity_bytes = bytes;
        self
    }

    /// Share a metrics collector instead of creating a private one.
    #[must_use]
    pub fn metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Follow an adaptive threshold for admission decisions.
    #[must_use]
    pub fn threshold_controller(mut self, controller: Arc<AdaptiveThresholdController>) -> Self {
        self.admission = Admission::Adaptive(controller);
        self
    }

    /// Use a fixed admission threshold in bytes.
    #[must_use]
    pub fn static_threshold(mut self, bytes: usize) -> Self {
        self.admission = Admission::Fixed(bytes);
        self
    }

    /// Publish 0/100 progress for each decrypt episode.
    #[must_use]
    pub fn progress(mut self, registry: Arc<DecryptionProgressRegistry>) -> Self {
        self.progress = Some(registry);
        self
    }

    #[must_use]
    pub fn key_derivation(mut self, derivation: KeyDerivation) -> Self {
        self.key_derivation = derivation;
        self
    }

    pub fn build(self) -> DecryptCache {
        DecryptCache {
            inner: Arc::new(CacheInner {
                decryptor: self.decryptor,
                store: WeightedLru::new(self.capacity_bytes, media_weight),
                in_flight: Arc::new(InFlightDecrypts::new()),
                metrics: self.metrics.unwrap_or_default(),
                admission: self.admission,
                progress: self.progress,
                key_derivation: self.key_derivation,
                generation: AtomicU64::new(0),
            }),
        }
    }
}
