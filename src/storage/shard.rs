//! Shard Store
//!
//! A `ShardStore` owns one partition of the keyspace. It is not thread-safe
//! on purpose: exactly one shard worker task owns each store and applies
//! commands to it one at a time, which gives per-key linearizability without
//! any locking.
//!
//! ## Responsibilities
//!
//! - **Lazy expiry**: every lookup checks the deadline first; an expired
//!   object is removed and reported as absent.
//! - **Change events**: every creation, modification and removal is recorded
//!   as a [`ChangeEvent`] that the worker forwards to the watch subsystem
//!   once the command has committed.
//! - **Memory accounting**: the estimated size of each object is charged to
//!   the shard's [`MemoryGauge`].
//! - **Read tracking**: while tracking is on, every key looked up is
//!   recorded so watched queries know which keys they depend on.
//!
//! ## Mutation model
//!
//! Commands get `&mut Object` handles through [`ShardStore::get_mut`] and
//! [`ShardStore::get_or_insert_with`]. Keys handed out this way are marked
//! dirty; [`ShardStore::commit`] then re-measures them, drops collections
//! that became empty, re-indexes changed deadlines, records the access and
//! emits their events. [`ShardStore::abort`] does the bookkeeping after a
//! failed command without the access or the events.

use crate::storage::eviction::{self, EvictionConfig};
use crate::storage::{MemoryGauge, Object, Value};
use crate::time;
use bytes::Bytes;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

pub type ShardId = usize;

/// What happened to a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// Created or modified
    Set,
    /// Removed by a command
    Delete,
    /// Removed because its deadline passed
    Expire,
    /// Removed by the eviction engine
    Evict,
}

/// Emitted whenever a key's stored object is created, modified or removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub key: Bytes,
    pub shard_id: ShardId,
    pub kind: ChangeKind,
}

/// Counters reported by a shard.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShardStats {
    /// Keys currently stored (expired keys not yet collected included)
    pub keys: usize,
    /// Keys with a deadline
    pub keys_with_expiry: usize,
    /// Keys removed by lazy or active expiry
    pub expired: u64,
    /// Keys removed by eviction
    pub evicted: u64,
}

#[derive(Debug)]
struct Entry {
    object: Object,
    /// Bytes currently charged to the memory gauge for this entry
    charged: usize,
    /// Deadline currently present in the expiry index
    indexed_deadline: Option<u64>,
}

pub struct ShardStore {
    id: ShardId,
    entries: HashMap<Bytes, Entry>,
    /// Keys with a deadline, ordered by deadline
    expiry_index: BTreeSet<(u64, Bytes)>,
    memory: Arc<MemoryGauge>,
    eviction: EvictionConfig,

    /// Keys handed out mutably since the last commit
    dirty: HashSet<Bytes>,
    /// Keys created by `get_or_insert_with` since the last commit
    created: HashSet<Bytes>,
    events: Vec<ChangeEvent>,
    read_set: Option<HashSet<Bytes>>,

    expired_total: u64,
    evicted_total: u64,
}

impl std::fmt::Debug for ShardStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardStore")
            .field("id", &self.id)
            .field("keys", &self.entries.len())
            .field("keys_with_expiry", &self.expiry_index.len())
            .finish()
    }
}

impl ShardStore {
    /// Creates an empty shard charging memory to `memory`.
    pub fn new(id: ShardId, memory: Arc<MemoryGauge>, eviction: EvictionConfig) -> Self {
        Self {
            id,
            entries: HashMap::new(),
            expiry_index: BTreeSet::new(),
            memory,
            eviction,
            dirty: HashSet::new(),
            created: HashSet::new(),
            events: Vec::new(),
            read_set: None,
            expired_total: 0,
            evicted_total: 0,
        }
    }

    /// Creates a shard with no memory limit, for standalone use.
    pub fn unbounded(id: ShardId) -> Self {
        Self::new(
            id,
            Arc::new(MemoryGauge::new(Default::default())),
            EvictionConfig::default(),
        )
    }

    pub fn id(&self) -> ShardId {
        self.id
    }

    pub fn memory(&self) -> &MemoryGauge {
        &self.memory
    }

    pub fn eviction_config(&self) -> &EvictionConfig {
        &self.eviction
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> ShardStats {
        ShardStats {
            keys: self.entries.len(),
            keys_with_expiry: self.expiry_index.len(),
            expired: self.expired_total,
            evicted: self.evicted_total,
        }
    }

    // ------------------------------------------------------------------
    // Lookups
    // ------------------------------------------------------------------

    /// Returns the live object for `key`, recording an access.
    ///
    /// Reads made while read tracking is on (watch evaluations) are not
    /// counted as accesses.
    pub fn get(&mut self, key: &[u8]) -> Option<&Object> {
        let now = self.lookup(key)?;
        let tracking = self.read_set.is_some();
        let entry = self.entries.get_mut(key)?;
        if !tracking {
            entry.object.touch(now);
        }
        Some(&entry.object)
    }

    /// Returns the live object for `key` without recording an access.
    pub fn peek(&mut self, key: &[u8]) -> Option<&Object> {
        self.lookup(key)?;
        self.entries.get(key).map(|entry| &entry.object)
    }

    /// Remaining time to live of `key` in ms.
    ///
    /// `None` if the key does not exist, `Some(None)` if it never expires.
    pub fn ttl(&mut self, key: &[u8]) -> Option<Option<u64>> {
        let now = self.lookup(key)?;
        self.entries.get(key).map(|entry| entry.object.ttl_ms(now))
    }

    /// Returns the live object for `key` for in-place modification.
    ///
    /// The access is recorded by [`commit`](Self::commit); a command that
    /// fails and is [`abort`](Self::abort)ed leaves no trace.
    pub fn get_mut(&mut self, key: &[u8]) -> Option<&mut Object> {
        self.lookup(key)?;
        let owned_key = self.entries.get_key_value(key).map(|(k, _)| k.clone())?;
        self.dirty.insert(owned_key);
        self.entries.get_mut(key).map(|entry| &mut entry.object)
    }

    /// Returns the object for `key`, creating it from `default` if absent.
    pub fn get_or_insert_with(
        &mut self,
        key: &Bytes,
        default: impl FnOnce() -> Value,
    ) -> &mut Object {
        let now = time::now_ms();
        self.record_read(key);
        self.expire_if_needed(key, now);
        self.dirty.insert(key.clone());

        let created = &mut self.created;
        let entry = self.entries.entry(key.clone()).or_insert_with(|| {
            created.insert(key.clone());
            Entry {
                object: Object::new(default()),
                charged: 0,
                indexed_deadline: None,
            }
        });
        &mut entry.object
    }

    /// Returns true if `key` holds a live object. Does not count as an access.
    pub fn contains(&mut self, key: &[u8]) -> bool {
        self.lookup(key).is_some()
    }

    /// Shared lookup prologue: records the read, applies lazy expiry and
    /// returns the current time if the key is live.
    fn lookup(&mut self, key: &[u8]) -> Option<u64> {
        let now = time::now_ms();
        self.record_read(key);
        if self.expire_if_needed(key, now) {
            return None;
        }
        self.entries.contains_key(key).then_some(now)
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    /// Stores `object` under `key`, replacing any previous object.
    ///
    /// Returns the previous live object, if there was one.
    pub fn set(&mut self, key: Bytes, object: Object) -> Option<Object> {
        let now = time::now_ms();
        let size = object.estimated_size(&key);
        let deadline = object.expires_at;

        let previous = self.entries.insert(
            key.clone(),
            Entry {
                object,
                charged: size,
                indexed_deadline: deadline,
            },
        );
        self.memory.add(size);

        let previous = previous.and_then(|old| {
            self.memory.sub(old.charged);
            if let Some(old_deadline) = old.indexed_deadline {
                self.expiry_index.remove(&(old_deadline, key.clone()));
            }
            (!old.object.is_expired_at(now)).then_some(old.object)
        });

        if let Some(deadline) = deadline {
            self.expiry_index.insert((deadline, key.clone()));
        }
        self.dirty.remove(&key);
        self.created.remove(&key);
        self.push_event(key, ChangeKind::Set);

        previous
    }

    /// Removes `key`. Returns true if a live object was removed.
    pub fn delete(&mut self, key: &[u8]) -> bool {
        let now = time::now_ms();
        if self.expire_if_needed(key, now) {
            return false;
        }
        self.remove_entry(key, Some(ChangeKind::Delete)).is_some()
    }

    /// Sets or clears the deadline of an existing key.
    ///
    /// A deadline that is already due removes the key immediately. Returns
    /// false if the key does not exist.
    pub fn set_expiry(&mut self, key: &[u8], deadline: Option<u64>) -> bool {
        let now = time::now_ms();
        if self.expire_if_needed(key, now) {
            return false;
        }
        if deadline.is_some_and(|d| d <= now) {
            return self.remove_entry(key, Some(ChangeKind::Delete)).is_some();
        }

        let Some((owned_key, _)) = self.entries.get_key_value(key) else {
            return false;
        };
        let owned_key = owned_key.clone();

        if let Some(entry) = self.entries.get_mut(key) {
            if let Some(old) = entry.indexed_deadline {
                self.expiry_index.remove(&(old, owned_key.clone()));
            }
            if let Some(new) = deadline {
                self.expiry_index.insert((new, owned_key.clone()));
            }
            entry.indexed_deadline = deadline;
            entry.object.expires_at = deadline;
        }
        self.push_event(owned_key, ChangeKind::Set);
        true
    }

    /// Removes every key. Returns the number of keys removed.
    pub fn flush(&mut self) -> usize {
        let keys: Vec<Bytes> = self.entries.keys().cloned().collect();
        let count = keys.len();
        for key in keys {
            self.remove_entry(&key, Some(ChangeKind::Delete));
        }
        count
    }

    /// Settles the keys modified in place since the last commit.
    ///
    /// Called by the shard worker after every successful command.
    pub fn commit(&mut self) {
        self.settle(true);
    }

    /// Settles after a failed command: accounting is brought up to date but
    /// the keys it borrowed are neither touched nor reported as changed.
    ///
    /// Command implementations fail before they modify anything, so there
    /// is no change to report.
    pub fn abort(&mut self) {
        self.settle(false);
    }

    fn settle(&mut self, applied: bool) {
        let now = time::now_ms();
        let dirty = std::mem::take(&mut self.dirty);
        let created = std::mem::take(&mut self.created);

        for key in dirty {
            let Some(entry) = self.entries.get_mut(&key) else {
                continue;
            };

            if entry.object.value.is_empty_collection() {
                // a collection created and emptied within one command never existed
                let kind = (!created.contains(&key)).then_some(ChangeKind::Delete);
                self.remove_entry(&key, kind);
                continue;
            }

            let size = entry.object.estimated_size(&key);
            self.memory.adjust(entry.charged, size);
            entry.charged = size;

            if entry.indexed_deadline != entry.object.expires_at {
                if let Some(old) = entry.indexed_deadline {
                    self.expiry_index.remove(&(old, key.clone()));
                }
                if let Some(new) = entry.object.expires_at {
                    self.expiry_index.insert((new, key.clone()));
                }
                entry.indexed_deadline = entry.object.expires_at;
            }

            if applied {
                entry.object.touch(now);
                self.push_event(key, ChangeKind::Set);
            }
        }
    }

    /// Drains the change events recorded since the last call.
    pub fn take_events(&mut self) -> Vec<ChangeEvent> {
        std::mem::take(&mut self.events)
    }

    // ------------------------------------------------------------------
    // Expiry
    // ------------------------------------------------------------------

    /// Removes `key` if its deadline has passed. Returns true if removed.
    fn expire_if_needed(&mut self, key: &[u8], now: u64) -> bool {
        let expired = self
            .entries
            .get(key)
            .is_some_and(|entry| entry.object.is_expired_at(now));

        if expired {
            self.remove_entry(key, Some(ChangeKind::Expire));
            self.expired_total += 1;
        }
        expired
    }

    /// Active expiry: removes up to `budget` keys whose deadline has passed.
    ///
    /// Keys are visited in deadline order, so the sweep stops at the first
    /// key that is still live and never examines more than `budget` keys.
    pub fn scan_expired(&mut self, budget: usize) -> usize {
        self.scan_expired_at(budget, time::now_ms())
    }

    pub(crate) fn scan_expired_at(&mut self, budget: usize, now: u64) -> usize {
        let mut removed = 0;
        while removed < budget {
            let Some((deadline, key)) = self.expiry_index.first().cloned() else {
                break;
            };
            if deadline > now {
                break;
            }
            if self.remove_entry(&key, Some(ChangeKind::Expire)).is_some() {
                self.expired_total += 1;
            } else {
                // stale index entry
                self.expiry_index.remove(&(deadline, key));
            }
            removed += 1;
        }
        removed
    }

    // ------------------------------------------------------------------
    // Eviction
    // ------------------------------------------------------------------

    /// Evicts one key chosen by the configured policy.
    ///
    /// Returns the number of bytes freed, or `None` if nothing could be
    /// evicted.
    pub fn evict_one(&mut self) -> Option<usize> {
        self.evict_one_sparing(&[])
    }

    /// Like [`evict_one`](Self::evict_one), never choosing a key in `keep`.
    pub fn evict_one_sparing(&mut self, keep: &[&Bytes]) -> Option<usize> {
        let victim = eviction::select_victim(
            self.eviction.policy,
            self.entries
                .iter()
                .filter(|(key, _)| !keep.contains(key))
                .map(|(key, entry)| (key, &entry.object)),
            self.entries.len().saturating_sub(keep.len()),
            self.eviction.sample_size,
            &mut rand::thread_rng(),
        )?;

        let freed = self.remove_entry(&victim, Some(ChangeKind::Evict))?.charged;
        self.evicted_total += 1;
        Some(freed)
    }

    // ------------------------------------------------------------------
    // Dependency tracking
    // ------------------------------------------------------------------

    /// Starts recording every key looked up.
    pub fn begin_read_tracking(&mut self) {
        self.read_set = Some(HashSet::new());
    }

    /// Stops recording and returns the keys looked up since
    /// [`begin_read_tracking`](Self::begin_read_tracking).
    pub fn finish_read_tracking(&mut self) -> HashSet<Bytes> {
        self.read_set.take().unwrap_or_default()
    }

    fn record_read(&mut self, key: &[u8]) {
        if let Some(read_set) = &mut self.read_set {
            if !read_set.contains(key) {
                read_set.insert(Bytes::copy_from_slice(key));
            }
        }
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn remove_entry(&mut self, key: &[u8], kind: Option<ChangeKind>) -> Option<Entry> {
        let (owned_key, entry) = self.entries.remove_entry(key)?;
        self.memory.sub(entry.charged);
        if let Some(deadline) = entry.indexed_deadline {
            self.expiry_index.remove(&(deadline, owned_key.clone()));
        }
        self.dirty.remove(key);
        self.created.remove(key);
        if let Some(kind) = kind {
            self.push_event(owned_key, kind);
        }
        Some(entry)
    }

    fn push_event(&mut self, key: Bytes, kind: ChangeKind) {
        self.events.push(ChangeEvent {
            key,
            shard_id: self.id,
            kind,
        });
    }
}
