//! Object Model
//!
//! An [`Object`] is a typed [`Value`] plus the metadata the expiry and
//! eviction subsystems need: an optional deadline, the last access time and
//! an access frequency counter. Objects are owned by exactly one shard and
//! are never shared across shards.

use crate::error::{EngineError, EngineResult};
use crate::storage::SortedSet;
use crate::time;
use bytes::Bytes;
use std::collections::{HashMap, HashSet, VecDeque};

/// Fixed bookkeeping cost charged for every stored key (map slot,
/// metadata, allocator slack). Same ballpark as the per-key overhead
/// Redis reports.
pub const ENTRY_OVERHEAD: usize = 64;

/// Per-element overhead for collection members.
const ELEMENT_OVERHEAD: usize = 16;

/// The typed payload of a stored object.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Raw byte string
    String(Bytes),
    /// A string that holds a canonical 64-bit integer
    Int(i64),
    /// A string produced by float arithmetic
    Float(f64),
    List(VecDeque<Bytes>),
    Hash(HashMap<Bytes, Bytes>),
    Set(HashSet<Bytes>),
    /// Sorted set; geo sets are sorted sets scored by geohash
    SortedSet(SortedSet),
}

impl Value {
    /// Builds a string value, choosing the integer encoding when the bytes
    /// are a canonical i64 ("42" but not "042" or "+42").
    pub fn from_bytes(data: Bytes) -> Self {
        if data.len() <= 20 {
            if let Some(n) = std::str::from_utf8(&data)
                .ok()
                .and_then(|s| s.parse::<i64>().ok())
            {
                if n.to_string().as_bytes() == &data[..] {
                    return Value::Int(n);
                }
            }
        }
        Value::String(data)
    }

    /// The user-visible type name, as reported by `TYPE`.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::String(_) | Value::Int(_) | Value::Float(_) => "string",
            Value::List(_) => "list",
            Value::Hash(_) => "hash",
            Value::Set(_) => "set",
            Value::SortedSet(_) => "zset",
        }
    }

    /// String form of a string-typed value; `None` for collections.
    pub fn as_bytes(&self) -> Option<Bytes> {
        match self {
            Value::String(b) => Some(b.clone()),
            Value::Int(n) => Some(Bytes::from(n.to_string())),
            Value::Float(f) => Some(Bytes::from(format_float(*f))),
            _ => None,
        }
    }

    /// Estimated heap footprint of the payload in bytes.
    pub fn memory_size(&self) -> usize {
        match self {
            Value::String(b) => b.len(),
            Value::Int(_) | Value::Float(_) => 8,
            Value::List(items) => items.iter().map(|i| i.len() + ELEMENT_OVERHEAD).sum(),
            Value::Hash(fields) => fields
                .iter()
                .map(|(k, v)| k.len() + v.len() + 2 * ELEMENT_OVERHEAD)
                .sum(),
            Value::Set(members) => members.iter().map(|m| m.len() + ELEMENT_OVERHEAD).sum(),
            Value::SortedSet(set) => set.memory_size(),
        }
    }

    /// Returns true for collections with no elements left.
    pub fn is_empty_collection(&self) -> bool {
        match self {
            Value::List(items) => items.is_empty(),
            Value::Hash(fields) => fields.is_empty(),
            Value::Set(members) => members.is_empty(),
            Value::SortedSet(set) => set.is_empty(),
            _ => false,
        }
    }
}

/// Formats a float the way it is returned to clients.
pub fn format_float(f: f64) -> String {
    if f.is_infinite() {
        if f > 0.0 { "inf" } else { "-inf" }.to_string()
    } else {
        format!("{}", f)
    }
}

/// A stored value with its expiry and access metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Object {
    pub value: Value,
    /// Monotonic deadline in ms (`None` = never expires)
    pub expires_at: Option<u64>,
    /// Monotonic time of the last read or write, in ms
    pub last_access: u64,
    /// Number of accesses, saturating
    pub access_frequency: u32,
}

impl Object {
    /// Creates an object without expiry.
    pub fn new(value: Value) -> Self {
        Self::with_expiry(value, None)
    }

    /// Creates an object with an optional monotonic deadline.
    pub fn with_expiry(value: Value, expires_at: Option<u64>) -> Self {
        Self {
            value,
            expires_at,
            last_access: time::now_ms(),
            access_frequency: 1,
        }
    }

    /// Checks expiry against `now`. A deadline equal to `now` is expired.
    #[inline]
    pub fn is_expired_at(&self, now: u64) -> bool {
        time::is_expired(self.expires_at, now)
    }

    /// Records an access.
    #[inline]
    pub fn touch(&mut self, now: u64) {
        self.last_access = now;
        self.access_frequency = self.access_frequency.saturating_add(1);
    }

    /// Remaining time to live in ms, or `None` if the object never expires.
    pub fn ttl_ms(&self, now: u64) -> Option<u64> {
        self.expires_at.map(|deadline| deadline.saturating_sub(now))
    }

    /// Estimated memory cost of storing this object under `key`.
    pub fn estimated_size(&self, key: &[u8]) -> usize {
        ENTRY_OVERHEAD + key.len() + self.value.memory_size()
    }

    /// String form of the value; `TypeMismatch` for collections.
    pub fn string_bytes(&self) -> EngineResult<Bytes> {
        self.value.as_bytes().ok_or(EngineError::TypeMismatch)
    }

    pub fn as_list(&self) -> EngineResult<&VecDeque<Bytes>> {
        match &self.value {
            Value::List(items) => Ok(items),
            _ => Err(EngineError::TypeMismatch),
        }
    }

    pub fn as_hash(&self) -> EngineResult<&HashMap<Bytes, Bytes>> {
        match &self.value {
            Value::Hash(fields) => Ok(fields),
            _ => Err(EngineError::TypeMismatch),
        }
    }

    pub fn as_set(&self) -> EngineResult<&HashSet<Bytes>> {
        match &self.value {
            Value::Set(members) => Ok(members),
            _ => Err(EngineError::TypeMismatch),
        }
    }

    pub fn as_sorted_set(&self) -> EngineResult<&SortedSet> {
        match &self.value {
            Value::SortedSet(set) => Ok(set),
            _ => Err(EngineError::TypeMismatch),
        }
    }

    pub fn as_list_mut(&mut self) -> EngineResult<&mut VecDeque<Bytes>> {
        match &mut self.value {
            Value::List(items) => Ok(items),
            _ => Err(EngineError::TypeMismatch),
        }
    }

    pub fn as_hash_mut(&mut self) -> EngineResult<&mut HashMap<Bytes, Bytes>> {
        match &mut self.value {
            Value::Hash(fields) => Ok(fields),
            _ => Err(EngineError::TypeMismatch),
        }
    }

    pub fn as_set_mut(&mut self) -> EngineResult<&mut HashSet<Bytes>> {
        match &mut self.value {
            Value::Set(members) => Ok(members),
            _ => Err(EngineError::TypeMismatch),
        }
    }

    pub fn as_sorted_set_mut(&mut self) -> EngineResult<&mut SortedSet> {
        match &mut self.value {
            Value::SortedSet(set) => Ok(set),
            _ => Err(EngineError::TypeMismatch),
        }
    }
}

/// Resolves Redis-style inclusive `start..=stop` indices (negative values
/// count from the end) against a collection of `len` elements. Returns
/// `None` when the range is empty.
pub fn normalize_range(start: i64, stop: i64, len: usize) -> Option<(usize, usize)> {
    if len == 0 {
        return None;
    }
    let len = len as i64;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };

    if start > stop || start >= len {
        None
    } else {
        Some((start as usize, stop as usize))
    }
}
