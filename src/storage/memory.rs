//! Memory accounting.
//!
//! Each shard owns a gauge bounded by its share of the engine's memory
//! limits and adjusts it as it inserts, replaces and removes objects. The
//! counter is atomic so the engine can read it for statistics without a
//! round trip to the shard.

use crate::config::MemoryConfig;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug)]
pub struct MemoryGauge {
    used: AtomicUsize,
    limits: MemoryConfig,
}

impl MemoryGauge {
    pub fn new(limits: MemoryConfig) -> Self {
        Self {
            used: AtomicUsize::new(0),
            limits,
        }
    }

    /// Estimated bytes in use.
    #[inline]
    pub fn used(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    pub fn limits(&self) -> MemoryConfig {
        self.limits
    }

    #[inline]
    pub fn add(&self, bytes: usize) {
        self.used.fetch_add(bytes, Ordering::Relaxed);
    }

    #[inline]
    pub fn sub(&self, bytes: usize) {
        // saturating: estimates may drift but must never wrap
        let _ = self
            .used
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                Some(current.saturating_sub(bytes))
            });
    }

    /// Replaces an old size estimate with a new one.
    pub fn adjust(&self, old: usize, new: usize) {
        if new >= old {
            self.add(new - old);
        } else {
            self.sub(old - new);
        }
    }

    /// True when admitting `incoming` bytes would cross the high water mark.
    pub fn above_high_water(&self, incoming: usize) -> bool {
        self.used().saturating_add(incoming) > self.limits.high_water
    }

    /// True while usage is still above the low water mark.
    pub fn above_low_water(&self) -> bool {
        self.used() > self.limits.low_water
    }

    /// True when admitting `incoming` bytes would exceed the hard limit.
    pub fn exceeds_limit(&self, incoming: usize) -> bool {
        self.used().saturating_add(incoming) > self.limits.max_memory
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_sub_adjust() {
        let gauge = MemoryGauge::new(MemoryConfig::unlimited());
        gauge.add(100);
        gauge.adjust(40, 90);
        assert_eq!(gauge.used(), 150);
        gauge.adjust(90, 10);
        assert_eq!(gauge.used(), 70);
        gauge.sub(1_000);
        assert_eq!(gauge.used(), 0);
    }

    #[test]
    fn test_water_marks() {
        let gauge = MemoryGauge::new(MemoryConfig {
            max_memory: 1000,
            high_water: 800,
            low_water: 500,
        });
        gauge.add(700);
        assert!(!gauge.above_high_water(100));
        assert!(gauge.above_high_water(101));
        assert!(gauge.above_low_water());
        assert!(!gauge.exceeds_limit(300));
        assert!(gauge.exceeds_limit(301));

        gauge.sub(200);
        assert!(!gauge.above_low_water());
    }

    #[test]
    fn test_unlimited_never_trips() {
        let gauge = MemoryGauge::new(MemoryConfig::unlimited());
        gauge.add(usize::MAX / 2);
        assert!(!gauge.above_high_water(usize::MAX / 4));
        assert!(!gauge.exceeds_limit(usize::MAX / 4));
    }
}
