//! Single-flight registry for decrypt episodes.
//!
//! The first request for a key that misses the store becomes the owner and
//! starts the decrypt. Requests arriving while it runs attach as waiters and
//! receive the owner's result over a broadcast channel.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::broadcast;

use crate::crypto::{DecryptError, DecryptedMedia};
use crate::key::ContentKey;

/// Outcome shared with every participant of one episode.
pub type EpisodeResult = Result<DecryptedMedia, Arc<DecryptError>>;

/// Result of trying to attach to an in-flight decrypt.
pub enum Attach {
    /// No decrypt was running; the caller must start one.
    Owner(broadcast::Receiver<EpisodeResult>),
    /// A decrypt is already running; await its result.
    Waiter(broadcast::Receiver<EpisodeResult>),
}

struct InFlightEntry {
    sender: broadcast::Sender<EpisodeResult>,
    waiter_count: AtomicU64,
}

/// Map of keys currently being decrypted.
#[derive(Default)]
pub struct InFlightDecrypts {
    in_flight: DashMap<ContentKey, InFlightEntry>,
}

impl InFlightDecrypts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in `key`, becoming the owner if nothing is in flight.
    ///
    /// The check and the insert happen under one shard lock, so exactly one
    /// caller per episode sees [`Attach::Owner`].
    pub fn try_attach(&self, key: ContentKey) -> Attach {
        match self.in_flight.entry(key) {
            Entry::Occupied(occupied) => {
                let entry = occupied.get();
                entry.waiter_count.fetch_add(1, Ordering::Relaxed);
                Attach::Waiter(entry.sender.subscribe())
            }
            Entry::Vacant(vacant) => {
                let (sender, receiver) = broadcast::channel(1);
                vacant.insert(InFlightEntry {
                    sender,
                    waiter_count: AtomicU64::new(0),
                });
                Attach::Owner(receiver)
            }
        }
    }

    /// End the episode for `key` and publish `result` to all participants.
    ///
    /// The entry is removed before sending, so a request arriving afterwards
    /// starts a fresh episode. Returns the number of waiters that attached.
    pub fn complete(&self, key: &ContentKey, result: EpisodeResult) -> u64 {
        let Some((_, entry)) = self.in_flight.remove(key) else {
            return 0;
        };
        // Every receiver may already be gone if all callers gave up.
        let _ = entry.sender.send(result);
        entry.waiter_count.load(Ordering::Relaxed)
    }

    /// Drop the episode for `key` without a result.
    ///
    /// Receivers observe a closed channel.
    pub fn abandon(&self, key: &ContentKey) {
        self.in_flight.remove(key);
    }

    #[cfg(test)]
    fn is_in_flight(&self, key: &ContentKey) -> bool {
        self.in_flight.contains_key(key)
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }
}

/// Ends an episode on drop if the owner never completed it.
///
/// Keeps waiters from hanging forever when the decrypt task panics or is
/// never scheduled.
pub struct EpisodeGuard {
    registry: Arc<InFlightDecrypts>,
    key: ContentKey,
    done: bool,
}

impl EpisodeGuard {
    pub fn new(registry: Arc<InFlightDecrypts>, key: ContentKey) -> Self {
        Self {
            registry,
            key,
            done: false,
        }
    }

    pub fn key(&self) -> &ContentKey {
        &self.key
    }

    /// Publish the result and disarm the guard.
    pub fn complete(mut self, result: EpisodeResult) -> u64 {
        self.done = true;
        self.registry.complete(&self.key, result)
    }
}

impl Drop for EpisodeGuard {
    fn drop(&mut self) {
        if !self.done {
            tracing::warn!(key = ?self.key, "Decrypt episode ended without a result");
            self.registry.abandon(&self.key);
        }
    }
}
