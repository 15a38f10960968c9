//! Active Expiry
//!
//! Lazy expiry (checking on access) removes expired keys that are touched
//! again, but a key that expires and is never read would stay in memory
//! forever. Each shard worker therefore sweeps its own expiry index on a
//! timer, removing at most `keys_per_cycle` keys per sweep so a sweep never
//! stalls the shard's command queue.
//!
//! ## Adaptive Frequency
//!
//! If a sweep used its whole budget, more keys are probably waiting and the
//! next sweep comes sooner. If a sweep found nothing, the sweeper backs off
//! to save CPU.

use crate::storage::ShardStore;
use std::time::Duration;
use tracing::{debug, trace};

/// Configuration for the active expiry sweep.
#[derive(Debug, Clone)]
pub struct ExpiryConfig {
    /// Starting interval between sweeps (default: 100ms)
    pub base_interval: Duration,

    /// Minimum interval between sweeps (default: 10ms)
    pub min_interval: Duration,

    /// Maximum interval between sweeps (default: 1s)
    pub max_interval: Duration,

    /// Upper bound on keys removed by one sweep of one shard
    pub keys_per_cycle: usize,
}

impl Default for ExpiryConfig {
    fn default() -> Self {
        Self {
            base_interval: Duration::from_millis(100),
            min_interval: Duration::from_millis(10),
            max_interval: Duration::from_secs(1),
            keys_per_cycle: 20,
        }
    }
}

/// Tracks the adaptive sweep interval of one shard.
#[derive(Debug, Clone)]
pub struct SweepSchedule {
    config: ExpiryConfig,
    current: Duration,
}

impl SweepSchedule {
    pub fn new(config: ExpiryConfig) -> Self {
        let current = config
            .base_interval
            .clamp(config.min_interval, config.max_interval);
        Self { config, current }
    }

    /// Delay until the next sweep.
    pub fn interval(&self) -> Duration {
        self.current
    }

    /// Runs one sweep over `store` and adapts the interval to the outcome.
    /// Returns the number of keys removed.
    pub fn sweep(&mut self, store: &mut ShardStore) -> usize {
        let removed = store.scan_expired(self.config.keys_per_cycle);
        self.record(removed);

        if removed > 0 {
            debug!(
                shard = store.id(),
                expired = removed,
                keys_remaining = store.len(),
                next_sweep_ms = self.current.as_millis() as u64,
                "Expired keys cleaned up"
            );
        }
        removed
    }

    fn record(&mut self, removed: usize) {
        if removed >= self.config.keys_per_cycle {
            // budget exhausted, more keys are probably due
            self.current = (self.current / 2).max(self.config.min_interval);
            trace!(
                new_interval_ms = self.current.as_millis() as u64,
                "High expiry rate, speeding up sweeper"
            );
        } else if removed == 0 {
            self.current = (self.current * 2).min(self.config.max_interval);
        } else if self.current > self.config.base_interval {
            self.current = self.config.base_interval;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{Object, Value};
    use crate::time;
    use bytes::Bytes;

    fn config() -> ExpiryConfig {
        ExpiryConfig {
            base_interval: Duration::from_millis(40),
            min_interval: Duration::from_millis(10),
            max_interval: Duration::from_millis(160),
            keys_per_cycle: 5,
        }
    }

    #[test]
    fn test_backs_off_when_idle() {
        let mut schedule = SweepSchedule::new(config());
        let mut store = ShardStore::unbounded(0);

        assert_eq!(schedule.sweep(&mut store), 0);
        assert_eq!(schedule.interval(), Duration::from_millis(80));
        schedule.sweep(&mut store);
        schedule.sweep(&mut store);
        assert_eq!(schedule.interval(), Duration::from_millis(160));
    }

    #[test]
    fn test_speeds_up_when_budget_exhausted() {
        let mut schedule = SweepSchedule::new(config());
        let mut store = ShardStore::unbounded(0);
        let deadline = time::now_ms();
        for i in 0..12 {
            store.set(
                Bytes::from(format!("key{}", i)),
                Object::with_expiry(Value::Int(i), Some(deadline)),
            );
        }

        assert_eq!(schedule.sweep(&mut store), 5);
        assert_eq!(schedule.interval(), Duration::from_millis(20));
        assert_eq!(schedule.sweep(&mut store), 5);
        assert_eq!(schedule.interval(), Duration::from_millis(10));

        // a partial sweep keeps the faster pace
        assert_eq!(schedule.sweep(&mut store), 2);
        assert_eq!(schedule.interval(), Duration::from_millis(10));
        assert!(store.is_empty());
    }

    #[test]
    fn test_partial_sweep_resets_slow_interval() {
        let mut schedule = SweepSchedule::new(config());
        let mut store = ShardStore::unbounded(0);
        schedule.sweep(&mut store);
        assert_eq!(schedule.interval(), Duration::from_millis(80));

        store.set(
            Bytes::from("k"),
            Object::with_expiry(Value::Int(1), Some(time::now_ms())),
        );
        assert_eq!(schedule.sweep(&mut store), 1);
        assert_eq!(schedule.interval(), Duration::from_millis(40));
    }
}
