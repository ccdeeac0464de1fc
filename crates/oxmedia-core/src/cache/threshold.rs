//! Pressure-driven admission threshold for the decrypt cache.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::ThresholdConfig;

/// Memory-pressure levels delivered by the host platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryPressure {
    /// Moderate pressure while running in the background.
    Moderate,
    /// The app moved to the background and memory is relatively free.
    Backgrounded,
    /// The system is critically low on memory.
    Critical,
}

impl MemoryPressure {
    /// Apply this level's scaling to `value` (unclamped).
    fn scale(self, value: usize) -> usize {
        match self {
            Self::Moderate => value / 4 * 3 + value % 4 * 3 / 4,
            Self::Backgrounded => value.saturating_add(value / 100 * 15 + value % 100 * 15 / 100),
            Self::Critical => value / 2,
        }
    }
}

impl fmt::Display for MemoryPressure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Moderate => "moderate",
            Self::Backgrounded => "backgrounded",
            Self::Critical => "critical",
        })
    }
}

/// Tracks the largest payload size (in bytes) eligible for in-memory caching.
///
/// The value always stays within `[floor, ceiling]`. Updates are
/// compare-and-swap loops on a single atomic, so concurrent pressure
/// callbacks never lose an update.
#[derive(Debug)]
pub struct AdaptiveThresholdController {
    current: AtomicUsize,
    floor: usize,
    ceiling: usize,
}

impl AdaptiveThresholdController {
    /// Create a controller from validated bounds. `initial` is clamped.
    pub fn new(config: ThresholdConfig) -> Self {
        let floor = config.floor.min(config.ceiling);
        let ceiling = config.ceiling;
        Self {
            current: AtomicUsize::new(config.initial.clamp(floor, ceiling)),
            floor,
            ceiling,
        }
    }

    #[inline]
    pub fn current_threshold(&self) -> usize {
        self.current.load(Ordering::Acquire)
    }

    pub fn floor(&self) -> usize {
        self.floor
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    /// React to a pressure signal and return the resulting threshold.
    pub fn on_pressure(&self, level: MemoryPressure) -> usize {
        let result = self
            .current
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                let next = level.scale(current).clamp(self.floor, self.ceiling);
                // Equal values exit the loop without a store.
                (next != current).then_some(next)
            });

        match result {
            Ok(previous) => {
                let next = level.scale(previous).clamp(self.floor, self.ceiling);
                debug!(%level, previous, next, "Adjusted cache admission threshold");
                next
            }
            Err(unchanged) => unchanged,
        }
    }
}

impl Default for AdaptiveThresholdController {
    fn default() -> Self {
        Self::new(ThresholdConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::thread;

    const KIB: usize = 1024;
    const MIB: usize = 1024 * KIB;

    #[test]
    fn test_default_is_two_mib() {
        let ctl = AdaptiveThresholdController::default();
        assert_eq!(ctl.current_threshold(), 2 * MIB);
        assert_eq!(ctl.floor(), 512 * KIB);
        assert_eq!(ctl.ceiling(), 4 * MIB);
    }

    #[test]
    fn test_transitions() {
        let ctl = AdaptiveThresholdController::default();
        assert_eq!(ctl.on_pressure(MemoryPressure::Moderate), 1536 * KIB);
        assert_eq!(ctl.on_pressure(MemoryPressure::Critical), 768 * KIB);

        let ctl = AdaptiveThresholdController::default();
        let grown = ctl.on_pressure(MemoryPressure::Backgrounded);
        assert_eq!(grown, 2 * MIB + 2 * MIB * 15 / 100);
    }

    #[test]
    fn test_repeated_critical_reaches_floor_exactly() {
        let ctl = AdaptiveThresholdController::default();
        for _ in 0..20 {
            ctl.on_pressure(MemoryPressure::Critical);
        }
        assert_eq!(ctl.current_threshold(), 512 * KIB);
        // At the floor the loop exits without change.
        assert_eq!(ctl.on_pressure(MemoryPressure::Critical), 512 * KIB);
    }

    #[test]
    fn test_repeated_backgrounded_reaches_ceiling_exactly() {
        let ctl = AdaptiveThresholdController::default();
        for _ in 0..20 {
            ctl.on_pressure(MemoryPressure::Backgrounded);
        }
        assert_eq!(ctl.current_threshold(), 4 * MIB);
    }

    #[test]
    fn test_initial_is_clamped() {
        let ctl = AdaptiveThresholdController::new(ThresholdConfig {
            floor: 100,
            ceiling: 200,
            initial: 1000,
        });
        assert_eq!(ctl.current_threshold(), 200);
    }

    #[test]
    fn test_concurrent_signals_stay_in_bounds() {
        let ctl = Arc::new(AdaptiveThresholdController::default());
        let handles: Vec<_> = [
            MemoryPressure::Moderate,
            MemoryPressure::Backgrounded,
            MemoryPressure::Critical,
            MemoryPressure::Backgrounded,
        ]
        .into_iter()
        .map(|level| {
            let ctl = Arc::clone(&ctl);
            thread::spawn(move || {
                for _ in 0..500 {
                    let value = ctl.on_pressure(level);
                    assert!((512 * KIB..=4 * MIB).contains(&value));
                }
            })
        })
        .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let value = ctl.current_threshold();
        assert!((512 * KIB..=4 * MIB).contains(&value));
    }

    fn pressure() -> impl Strategy<Value = MemoryPressure> {
        prop_oneof![
            Just(MemoryPressure::Moderate),
            Just(MemoryPressure::Backgrounded),
            Just(MemoryPressure::Critical),
        ]
    }

    proptest! {
        #[test]
        fn prop_threshold_stays_within_bounds(signals in prop::collection::vec(pressure(), 0..64)) {
            let ctl = AdaptiveThresholdController::default();
            for signal in signals {
                let value = ctl.on_pressure(signal);
                prop_assert!(value >= ctl.floor());
                prop_assert!(value <= ctl.ceiling());
                prop_assert_eq!(value, ctl.current_threshold());
            }
        }
    }
}
