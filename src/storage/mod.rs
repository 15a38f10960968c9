//! Storage Module
//!
//! Everything a single shard owns: the object model, the shard store with
//! its expiry index, its [`MemoryGauge`] and the eviction engine.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                         ShardStore                            │
//! │  ┌──────────────────┐  ┌───────────────────┐  ┌─────────────┐ │
//! │  │ entries          │  │ expiry_index      │  │ events      │ │
//! │  │ Bytes -> Object  │  │ (deadline, key)   │  │ ChangeEvent │ │
//! │  └──────────────────┘  └───────────────────┘  └─────────────┘ │
//! └───────────────┬───────────────────────────────────────────────┘
//!                 │ charges estimated bytes
//!                 ▼
//!          ┌──────────────┐   above high water   ┌────────────────┐
//!          │ MemoryGauge  │ ───────────────────▶ │ eviction cycle │
//!          └──────────────┘                      └────────────────┘
//! ```
//!
//! ## Example
//!
//! ```
//! use tidekv::storage::{Object, ShardStore, Value};
//! use bytes::Bytes;
//!
//! let mut store = ShardStore::unbounded(0);
//! store.set(Bytes::from("name"), Object::new(Value::from_bytes(Bytes::from("Ariz"))));
//!
//! let value = store.get(b"name").and_then(|o| o.value.as_bytes());
//! assert_eq!(value, Some(Bytes::from("Ariz")));
//! ```

pub mod eviction;
pub mod expiry;
pub mod geo;
pub mod memory;
pub mod object;
pub mod shard;
pub mod sorted_set;

pub use eviction::{EvictionConfig, EvictionPolicy, EvictionReport};
pub use expiry::{ExpiryConfig, SweepSchedule};
pub use memory::MemoryGauge;
pub use object::{Object, Value, ENTRY_OVERHEAD};
pub use shard::{ChangeEvent, ChangeKind, ShardId, ShardStats, ShardStore};
pub use sorted_set::SortedSet;
