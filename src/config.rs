//! Engine configuration.
//!
//! The engine is configured with plain structs that have sensible defaults.
//! Loading these values (flags, files, environment) is the embedding
//! application's job; `main.rs` shows the command-line flavour.

use crate::error::ConfigError;
use crate::storage::{EvictionConfig, ExpiryConfig};

/// Default per-shard request queue depth.
pub const DEFAULT_SHARD_QUEUE_CAPACITY: usize = 1024;

/// Default per-client notification queue depth.
pub const DEFAULT_NOTIFICATION_QUEUE_CAPACITY: usize = 256;

/// Memory bounds, in estimated bytes across all shards.
///
/// The engine splits the bounds evenly between its shards
/// ([`per_shard`](Self::per_shard)). Within a shard, eviction starts when
/// usage (plus the incoming write) crosses `high_water` and stops once
/// usage falls to `low_water`. A write that would still push usage past
/// `max_memory` after an eviction cycle is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryConfig {
    pub max_memory: usize,
    pub high_water: usize,
    pub low_water: usize,
}

impl MemoryConfig {
    /// No memory bound at all.
    pub fn unlimited() -> Self {
        Self {
            max_memory: usize::MAX,
            high_water: usize::MAX,
            low_water: usize::MAX,
        }
    }

    /// A hard limit with high/low water marks at 90% and 75% of it.
    pub fn with_limit(max_memory: usize) -> Self {
        Self {
            max_memory,
            high_water: max_memory / 10 * 9,
            low_water: max_memory / 4 * 3,
        }
    }

    /// The share of these bounds owned by one of `shards` shards.
    pub fn per_shard(&self, shards: usize) -> Self {
        if self.is_unlimited() {
            return *self;
        }
        let shards = shards.max(1);
        Self {
            max_memory: self.max_memory / shards,
            high_water: self.high_water / shards,
            low_water: self.low_water / shards,
        }
    }

    /// Returns true if no limit is configured.
    pub fn is_unlimited(&self) -> bool {
        self.max_memory == usize::MAX
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self::unlimited()
    }
}

/// Everything the engine needs to start.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of shards (each gets its own single-writer task)
    pub shard_count: usize,

    /// Depth of each shard's request queue
    pub shard_queue_capacity: usize,

    /// Memory bounds
    pub memory: MemoryConfig,

    /// Eviction policy and per-cycle limits
    pub eviction: EvictionConfig,

    /// Active expiry sweep settings
    pub expiry: ExpiryConfig,

    /// Per-client notification queue depth; older notifications are
    /// dropped when a client falls behind
    pub notification_queue_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let shard_count = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);

        Self {
            shard_count,
            shard_queue_capacity: DEFAULT_SHARD_QUEUE_CAPACITY,
            memory: MemoryConfig::default(),
            eviction: EvictionConfig::default(),
            expiry: ExpiryConfig::default(),
            notification_queue_capacity: DEFAULT_NOTIFICATION_QUEUE_CAPACITY,
        }
    }
}

impl EngineConfig {
    /// Checks the configuration for values the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.shard_count == 0 {
            return Err(ConfigError::NoShards);
        }

        let MemoryConfig {
            max_memory,
            high_water,
            low_water,
        } = self.memory;
        if low_water > high_water || high_water > max_memory {
            return Err(ConfigError::InvalidMemoryMarks {
                low: low_water,
                high: high_water,
                max: max_memory,
            });
        }

        if self.notification_queue_capacity == 0 {
            return Err(ConfigError::EmptyNotificationQueue);
        }

        if self.expiry.keys_per_cycle == 0 {
            return Err(ConfigError::EmptySweepBudget);
        }

        Ok(())
    }
}
