//! Content-addressed decrypt cache.
//!
//! - [`store`]: byte-weighted LRU holding decrypted payloads
//! - [`single_flight`]: coalesces concurrent decrypts of the same item
//! - [`threshold`]: pressure-driven limit on what may be cached
//! - [`decrypt`]: [`DecryptCache`], tying the three together

pub mod decrypt;
pub mod single_flight;
pub mod store;
pub mod threshold;

pub use decrypt::{CacheError, DecryptCache, DecryptCacheBuilder};
pub use single_flight::{Attach, EpisodeResult, InFlightDecrypts};
pub use store::WeightedLru;
pub use threshold::{AdaptiveThresholdController, MemoryPressure};
