//! Eviction Engine
//!
//! Every shard owns an equal share of the configured memory bounds (see
//! [`MemoryConfig::per_shard`](crate::config::MemoryConfig::per_shard)), so
//! the keys a shard can evict are exactly the keys charged to its budget.
//! When a shard's usage crosses its high water mark, the shard that is
//! about to admit a write evicts objects one at a time until usage drops to
//! the low water mark or the per-cycle cap is reached. If the write would
//! still exceed the hard limit afterwards, it is rejected with
//! [`EngineError::OutOfMemory`].
//!
//! Victims are chosen from a random sample of the shard's keys (the whole
//! shard when it is smaller than the sample), which approximates the policy
//! without maintaining a global ordering. The keys a command just wrote are
//! never chosen by the cycle that follows it.

use crate::error::{ConfigError, EngineError, EngineResult};
use crate::storage::{Object, ShardStore};
use bytes::Bytes;
use rand::seq::IteratorRandom;
use rand::Rng;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, warn};

/// Default number of keys examined per victim selection.
pub const DEFAULT_SAMPLE_SIZE: usize = 16;

/// Default cap on evictions per cycle.
pub const DEFAULT_MAX_EVICTIONS_PER_CYCLE: usize = 128;

/// How victims are chosen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EvictionPolicy {
    /// Never evict; writes over the limit fail.
    NoEviction,
    /// Oldest `last_access` first
    #[default]
    AllKeysLru,
    /// Lowest `access_frequency` first, ties broken by oldest `last_access`
    AllKeysLfu,
    /// Uniformly random
    AllKeysRandom,
}

impl fmt::Display for EvictionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EvictionPolicy::NoEviction => "noeviction",
            EvictionPolicy::AllKeysLru => "allkeys-lru",
            EvictionPolicy::AllKeysLfu => "allkeys-lfu",
            EvictionPolicy::AllKeysRandom => "allkeys-random",
        };
        f.write_str(name)
    }
}

impl FromStr for EvictionPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "noeviction" => Ok(EvictionPolicy::NoEviction),
            "allkeys-lru" | "lru" => Ok(EvictionPolicy::AllKeysLru),
            "allkeys-lfu" | "lfu" => Ok(EvictionPolicy::AllKeysLfu),
            "allkeys-random" | "random" => Ok(EvictionPolicy::AllKeysRandom),
            _ => Err(ConfigError::UnknownEvictionPolicy(s.to_string())),
        }
    }
}

/// Configuration for the eviction engine.
#[derive(Debug, Clone)]
pub struct EvictionConfig {
    pub policy: EvictionPolicy,

    /// Maximum number of victims per cycle; bounds the latency added to
    /// the write that triggered the cycle
    pub max_evictions_per_cycle: usize,

    /// Keys examined per victim selection
    pub sample_size: usize,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            policy: EvictionPolicy::default(),
            max_evictions_per_cycle: DEFAULT_MAX_EVICTIONS_PER_CYCLE,
            sample_size: DEFAULT_SAMPLE_SIZE,
        }
    }
}

/// Outcome of one eviction cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvictionReport {
    pub evicted: usize,
    pub freed_bytes: usize,
    /// Usage ended at or below the low water mark
    pub reached_low_water: bool,
}

/// Picks a victim among `entries` according to `policy`.
///
/// `len` is the number of entries; when it does not exceed `sample_size`
/// every entry is considered, otherwise a random sample is drawn.
pub fn select_victim<'a, R: Rng + ?Sized>(
    policy: EvictionPolicy,
    entries: impl Iterator<Item = (&'a Bytes, &'a Object)>,
    len: usize,
    sample_size: usize,
    rng: &mut R,
) -> Option<Bytes> {
    if len == 0 {
        return None;
    }

    let candidates: Vec<(&Bytes, &Object)> = match policy {
        EvictionPolicy::NoEviction => return None,
        EvictionPolicy::AllKeysRandom => {
            return entries.choose(rng).map(|(key, _)| key.clone());
        }
        _ if len <= sample_size => entries.collect(),
        _ => entries.choose_multiple(rng, sample_size.max(1)),
    };

    let victim = match policy {
        EvictionPolicy::AllKeysLru => candidates
            .into_iter()
            .min_by(|(ka, a), (kb, b)| a.last_access.cmp(&b.last_access).then(ka.cmp(kb))),
        EvictionPolicy::AllKeysLfu => candidates.into_iter().min_by(|(ka, a), (kb, b)| {
            a.access_frequency
                .cmp(&b.access_frequency)
                .then(a.last_access.cmp(&b.last_access))
                .then(ka.cmp(kb))
        }),
        EvictionPolicy::NoEviction | EvictionPolicy::AllKeysRandom => None,
    };

    victim.map(|(key, _)| key.clone())
}

impl ShardStore {
    /// Runs one eviction cycle on this shard.
    ///
    /// Evicts one victim at a time while the shard's usage is above the low
    /// water mark, stopping after `max_evictions_per_cycle` victims or
    /// when the shard has nothing left to evict.
    pub fn run_eviction_cycle(&mut self) -> EvictionReport {
        self.eviction_cycle(&[])
    }

    fn eviction_cycle(&mut self, keep: &[&Bytes]) -> EvictionReport {
        let cap = self.eviction_config().max_evictions_per_cycle;
        let mut report = EvictionReport::default();

        if self.eviction_config().policy == EvictionPolicy::NoEviction {
            report.reached_low_water = !self.memory().above_low_water();
            return report;
        }

        while self.memory().above_low_water() && report.evicted < cap {
            match self.evict_one_sparing(keep) {
                Some(freed) => {
                    report.evicted += 1;
                    report.freed_bytes += freed;
                }
                None => break,
            }
        }
        report.reached_low_water = !self.memory().above_low_water();

        if report.evicted > 0 {
            debug!(
                shard = self.id(),
                evicted = report.evicted,
                freed_bytes = report.freed_bytes,
                used = self.memory().used(),
                reached_low_water = report.reached_low_water,
                "Eviction cycle finished"
            );
        }
        report
    }

    /// Admission check for a write that is expected to add `incoming`
    /// bytes. Runs an eviction cycle if the high water mark would be
    /// crossed and rejects the write if the hard limit would still be
    /// exceeded afterwards.
    pub fn admit_write(&mut self, incoming: usize) -> EngineResult<()> {
        if !self.memory().above_high_water(incoming) {
            return Ok(());
        }

        let report = self.run_eviction_cycle();

        if self.memory().exceeds_limit(incoming) {
            warn!(
                shard = self.id(),
                used = self.memory().used(),
                incoming = incoming,
                evicted = report.evicted,
                "Rejecting write: memory limit reached"
            );
            return Err(EngineError::OutOfMemory);
        }
        Ok(())
    }

    /// Post-write check: if the write left usage above the high water
    /// mark, run a cycle now rather than on the next write. The keys in
    /// `keep` (the ones just written) are not eligible.
    pub fn relieve_pressure(&mut self, keep: &[&Bytes]) -> Option<EvictionReport> {
        self.memory()
            .above_high_water(0)
            .then(|| self.eviction_cycle(keep))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfig;
    use crate::storage::{MemoryGauge, Value};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::sync::Arc;

    fn object(last_access: u64, frequency: u32) -> Object {
        let mut obj = Object::new(Value::Int(0));
        obj.last_access = last_access;
        obj.access_frequency = frequency;
        obj
    }

    fn store_with(limits: MemoryConfig, policy: EvictionPolicy, cap: usize) -> ShardStore {
        ShardStore::new(
            0,
            Arc::new(MemoryGauge::new(limits)),
            EvictionConfig {
                policy,
                max_evictions_per_cycle: cap,
                sample_size: 64,
            },
        )
    }

    fn fill(store: &mut ShardStore, count: usize, value_len: usize) {
        for i in 0..count {
            store.set(
                Bytes::from(format!("key:{:03}", i)),
                Object::new(Value::String(Bytes::from(vec![b'x'; value_len]))),
            );
        }
    }

    #[test]
    fn test_policy_parse_and_display() {
        for policy in [
            EvictionPolicy::NoEviction,
            EvictionPolicy::AllKeysLru,
            EvictionPolicy::AllKeysLfu,
            EvictionPolicy::AllKeysRandom,
        ] {
            assert_eq!(policy.to_string().parse::<EvictionPolicy>(), Ok(policy));
        }
        assert!("volatile-ttl".parse::<EvictionPolicy>().is_err());
    }

    #[test]
    fn test_select_lru_victim() {
        let keys = [Bytes::from("a"), Bytes::from("b"), Bytes::from("c")];
        let objects = [object(30, 1), object(10, 9), object(20, 1)];
        let mut rng = StdRng::seed_from_u64(7);

        let victim = select_victim(
            EvictionPolicy::AllKeysLru,
            keys.iter().zip(objects.iter()),
            3,
            16,
            &mut rng,
        );
        assert_eq!(victim, Some(Bytes::from("b")));
    }

    #[test]
    fn test_select_lfu_victim_breaks_ties_by_age() {
        let keys = [Bytes::from("a"), Bytes::from("b"), Bytes::from("c")];
        let objects = [object(30, 1), object(10, 9), object(20, 1)];
        let mut rng = StdRng::seed_from_u64(7);

        let victim = select_victim(
            EvictionPolicy::AllKeysLfu,
            keys.iter().zip(objects.iter()),
            3,
            16,
            &mut rng,
        );
        assert_eq!(victim, Some(Bytes::from("c")));
    }

    #[test]
    fn test_select_random_and_noeviction() {
        let keys = [Bytes::from("a"), Bytes::from("b")];
        let objects = [object(1, 1), object(2, 2)];
        let mut rng = StdRng::seed_from_u64(1);

        let victim = select_victim(
            EvictionPolicy::AllKeysRandom,
            keys.iter().zip(objects.iter()),
            2,
            16,
            &mut rng,
        );
        assert!(victim.is_some());

        let victim = select_victim(
            EvictionPolicy::NoEviction,
            keys.iter().zip(objects.iter()),
            2,
            16,
            &mut rng,
        );
        assert!(victim.is_none());
    }

    #[test]
    fn test_cycle_stops_at_low_water() {
        let limits = MemoryConfig {
            max_memory: 20_000,
            high_water: 15_000,
            low_water: 10_000,
        };
        let mut store = store_with(limits, EvictionPolicy::AllKeysLru, 1_000);
        fill(&mut store, 20, 1_000);
        assert!(store.memory().used() > limits.high_water);

        let report = store.run_eviction_cycle();
        assert!(report.reached_low_water);
        let used = store.memory().used();
        assert!(used <= limits.low_water);
        // one more eviction would not have been needed
        assert!(used + 1_100 > limits.low_water);
        assert_eq!(store.stats().evicted as usize, report.evicted);
    }

    #[test]
    fn test_cycle_respects_cap() {
        let limits = MemoryConfig {
            max_memory: 20_000,
            high_water: 2_000,
            low_water: 1_000,
        };
        let mut store = store_with(limits, EvictionPolicy::AllKeysRandom, 3);
        fill(&mut store, 15, 1_000);

        let report = store.run_eviction_cycle();
        assert_eq!(report.evicted, 3);
        assert!(!report.reached_low_water);
        assert_eq!(store.len(), 12);
    }

    #[test]
    fn test_lru_evicts_least_recently_used() {
        let limits = MemoryConfig {
            max_memory: 100_000,
            high_water: 3_500,
            low_water: 3_300,
        };
        let mut store = store_with(limits, EvictionPolicy::AllKeysLru, 10);
        fill(&mut store, 4, 1_000);

        // every key but key:000 gets a later access
        std::thread::sleep(std::time::Duration::from_millis(5));
        for i in 1..4 {
            store.get(format!("key:{:03}", i).as_bytes());
        }

        let report = store.run_eviction_cycle();
        assert_eq!(report.evicted, 1);
        assert!(!store.contains(b"key:000"));
        assert!(store.contains(b"key:001"));
    }

    #[test]
    fn test_admit_write_rejects_when_cap_exhausted() {
        let limits = MemoryConfig {
            max_memory: 5_000,
            high_water: 4_000,
            low_water: 1_000,
        };
        let mut store = store_with(limits, EvictionPolicy::AllKeysLru, 1);
        fill(&mut store, 4, 1_000);

        // one eviction frees ~1.1KB, not enough for a 3KB write
        assert_eq!(store.admit_write(3_000), Err(EngineError::OutOfMemory));
        assert_eq!(store.len(), 3);

        // a small write still fits
        assert_eq!(store.admit_write(100), Ok(()));
    }

    #[test]
    fn test_noeviction_rejects() {
        let limits = MemoryConfig {
            max_memory: 3_000,
            high_water: 3_000,
            low_water: 3_000,
        };
        let mut store = store_with(limits, EvictionPolicy::NoEviction, 10);
        fill(&mut store, 2, 1_000);

        assert_eq!(store.admit_write(1_000), Err(EngineError::OutOfMemory));
        assert_eq!(store.len(), 2);
        assert_eq!(store.admit_write(100), Ok(()));
    }

    #[test]
    fn test_eviction_emits_change_events() {
        let limits = MemoryConfig {
            max_memory: 10_000,
            high_water: 1_500,
            low_water: 1_200,
        };
        let mut store = store_with(limits, EvictionPolicy::AllKeysLru, 10);
        fill(&mut store, 2, 1_000);
        store.take_events();

        assert!(store.relieve_pressure(&[]).is_some());
        let events = store.take_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, crate::storage::ChangeKind::Evict);
    }

    #[test]
    fn test_relieve_pressure_spares_written_keys() {
        let limits = MemoryConfig {
            max_memory: 5_000,
            high_water: 1_500,
            low_water: 1_000,
        };
        let mut store = store_with(limits, EvictionPolicy::AllKeysLru, 10);
        fill(&mut store, 1, 1_000);

        // the older key goes, the fresh one stays even though usage is
        // still above the low water mark afterwards
        let fresh = Bytes::from("fresh");
        store.set(
            fresh.clone(),
            Object::new(Value::String(Bytes::from(vec![b'y'; 1_000]))),
        );
        let report = store.relieve_pressure(&[&fresh]).unwrap();
        assert_eq!(report.evicted, 1);
        assert!(!report.reached_low_water);
        assert!(store.contains(&fresh));
        assert!(!store.contains(b"key:000"));

        // nothing else to evict: the cycle gives up instead of taking it
        store.set(
            fresh.clone(),
            Object::new(Value::String(Bytes::from(vec![b'y'; 2_000]))),
        );
        let report = store.relieve_pressure(&[&fresh]).unwrap();
        assert_eq!(report.evicted, 0);
        assert_eq!(store.len(), 1);
    }
}
