//! Per-item decryption progress for UI observers.

use dashmap::DashMap;
use tokio::sync::watch;

use crate::key::ContentKey;

/// Map from content key to an observable percentage (0 to 100).
///
/// Entries are created lazily by [`progress_for`](Self::progress_for) and
/// [`update`](Self::update). Producers inside the crate use
/// [`publish`](Self::publish), which only reaches keys someone is watching
/// and drops entries whose receivers are all gone, so the map stays bounded
/// by the number of live observers. Whole-file decrypts jump straight from 0
/// to 100; block-wise streaming publishes intermediate values.
#[derive(Debug, Default)]
pub struct DecryptionProgressRegistry {
    channels: DashMap<ContentKey, watch::Sender<u8>>,
}

impl DecryptionProgressRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(
        &self,
        key: ContentKey,
    ) -> dashmap::mapref::one::Ref<'_, ContentKey, watch::Sender<u8>> {
        self.channels
            .entry(key)
            .or_insert_with(|| watch::channel(0).0)
            .downgrade()
    }

    /// Subscribe to progress for `key`.
    pub fn progress_for(&self, key: ContentKey) -> watch::Receiver<u8> {
        self.sender(key).subscribe()
    }

    /// Publish `percent` for `key`, clamped to 100.
    pub fn update(&self, key: ContentKey, percent: u8) {
        self.sender(key).send_replace(percent.min(100));
    }

    /// Publish `percent` for `key` only if an entry already exists.
    ///
    /// An entry with no remaining receivers is removed instead. Returns
    /// whether anyone was watching.
    pub fn publish(&self, key: &ContentKey, percent: u8) -> bool {
        let Some(tx) = self.channels.get(key) else {
            return false;
        };
        tx.send_replace(percent.min(100));
        let observed = tx.receiver_count() > 0;
        drop(tx);

        if !observed {
            self.channels.remove_if(key, |_, tx| tx.receiver_count() == 0);
        }
        observed
    }

    /// Set progress for `key` back to zero.
    pub fn reset(&self, key: ContentKey) {
        self.update(key, 0);
    }

    /// Latest published value, or 0 if nothing was ever published.
    pub fn current(&self, key: &ContentKey) -> u8 {
        self.channels.get(key).map_or(0, |tx| *tx.borrow())
    }

    /// Forget `key`. Existing receivers see the channel close.
    pub fn remove(&self, key: &ContentKey) {
        self.channels.remove(key);
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lazy_creation_starts_at_zero() {
        let registry = DecryptionProgressRegistry::new();
        let key = ContentKey::from_path("/video.mp4");
        assert!(registry.is_empty());
        let rx = registry.progress_for(key);
        assert_eq!(*rx.borrow(), 0);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_update_is_observed_and_clamped() {
        let registry = DecryptionProgressRegistry::new();
        let key = ContentKey::from_path("/video.mp4");
        let rx = registry.progress_for(key);

        registry.update(key, 40);
        assert_eq!(*rx.borrow(), 40);
        registry.update(key, 250);
        assert_eq!(registry.current(&key), 100);

        registry.reset(key);
        assert_eq!(*rx.borrow(), 0);
    }

    #[test]
    fn test_update_before_subscribe() {
        let registry = DecryptionProgressRegistry::new();
        let key = ContentKey::from_path("/photo.jpg");
        registry.update(key, 100);
        assert_eq!(*registry.progress_for(key).borrow(), 100);
    }

    #[tokio::test]
    async fn test_subscriber_wakes_on_change() {
        let registry = DecryptionProgressRegistry::new();
        let key = ContentKey::from_path("/video.mp4");
        let mut rx = registry.progress_for(key);

        registry.update(key, 75);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), 75);
    }

    #[test]
    fn test_publish_skips_unwatched_keys() {
        let registry = DecryptionProgressRegistry::new();
        let key = ContentKey::from_path("/photo.jpg");
        assert!(!registry.publish(&key, 100));
        assert!(registry.is_empty());
        assert_eq!(registry.current(&key), 0);
    }

    #[test]
    fn test_publish_prunes_abandoned_entries() {
        let registry = DecryptionProgressRegistry::new();
        let key = ContentKey::from_path("/video.mp4");
        let rx = registry.progress_for(key);

        assert!(registry.publish(&key, 50));
        assert_eq!(*rx.borrow(), 50);

        drop(rx);
        assert!(!registry.publish(&key, 100));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_remove_closes_receivers() {
        let registry = DecryptionProgressRegistry::new();
        let key = ContentKey::from_path("/video.mp4");
        let mut rx = registry.progress_for(key);
        registry.remove(&key);
        assert!(rx.changed().await.is_err());
        assert_eq!(registry.current(&key), 0);
    }
}
