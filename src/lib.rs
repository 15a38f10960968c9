//! # tidekv - A Sharded In-Memory Key-Value Engine with Live Queries
//!
//! tidekv keeps typed values (strings, lists, hashes, sets, sorted sets and
//! geo sets) in memory, partitioned across shards that each have exactly
//! one writer. On top of ordinary request/reply commands, clients can
//! *watch* any read-only query and receive its new result every time the
//! data it read changes.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                                 tidekv                                   │
//! │                                                                          │
//! │  ┌────────────┐   ┌────────────┐   ┌──────────────────────────────────┐  │
//! │  │ TCP Server │──>│ Connection │──>│              Engine              │  │
//! │  │ (Listener) │   │  Session   │   │  validate ─> route ─> gather     │  │
//! │  └────────────┘   └─────▲──────┘   └───────┬──────────────────────────┘  │
//! │                         │                  │ mpsc + oneshot              │
//! │                         │                  ▼                             │
//! │                         │     ┌────────┐ ┌────────┐ ┌────────┐           │
//! │                         │     │Shard 0 │ │Shard 1 │ │Shard N │  workers  │
//! │                         │     │ store  │ │ store  │ │ store  │  (expiry, │
//! │                         │     └───┬────┘ └───┬────┘ └───┬────┘  eviction)│
//! │                         │         └─────ChangeEvent─────┘                │
//! │                         │                    ▼                           │
//! │                   ┌─────┴─────┐      ┌──────────────┐                    │
//! │                   │  Outbox   │◀─────│ WatchManager │  re-evaluate,      │
//! │                   │(per client│      │  dispatcher  │  suppress unchanged│
//! │                   └───────────┘      └──────────────┘                    │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! use tidekv::config::EngineConfig;
//! use tidekv::engine::{Command, Engine, Reply};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let engine = Engine::with_builtins(EngineConfig::default())?;
//!
//! // Watch a query, then change what it reads
//! let get = Command::from_parts(["GET", "greeting"]).unwrap();
//! let subscription = engine.subscribe(1, get).await?;
//! assert_eq!(subscription.result, Reply::Nil);
//!
//! let set = Command::from_parts(["SET", "greeting", "hello"]).unwrap();
//! engine.evaluate(set).await?;
//!
//! let mut notifications = engine.notifications(1);
//! let update = notifications.next().await.unwrap();
//! assert_eq!(update.result, Reply::bulk("hello"));
//! assert_eq!(update.sequence, 1);
//!
//! engine.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Module Overview
//!
//! - [`storage`]: object model, shard store, expiry and eviction
//! - [`engine`]: command registry, routing and shard workers
//! - [`watch`]: fingerprints, subscriptions and notification delivery
//! - [`commands`]: the built-in command catalog
//! - [`protocol`]: RESP2 request parsing and reply encoding
//! - [`connection`]: per-client TCP sessions
//! - [`config`], [`error`], [`time`]: configuration, error types and the
//!   engine clock
//!
//! ## Design Highlights
//!
//! ### Single Writer per Shard
//!
//! Every key belongs to exactly one shard (`hash(key) % shard_count`) and
//! every shard store is owned by one tokio task. Commands are messages to
//! that task, so a command observes and produces a consistent shard state
//! without any locks around the data.
//!
//! ### Lazy + Active Expiry
//!
//! An expired key is removed the moment anything looks it up, and each
//! shard also sweeps a bounded number of due keys on an adaptive interval.
//! A deadline equal to the current time counts as expired.
//!
//! ### Exact Dependency Tracking
//!
//! Watched queries record every key they read. Only changes to those keys
//! trigger a re-evaluation, and only a result that differs from the last
//! one delivered produces a notification.

pub mod commands;
pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod protocol;
pub mod storage;
pub mod time;
pub mod watch;

pub use config::{EngineConfig, MemoryConfig};
pub use engine::{Command, CommandResult, Engine, Reply};
pub use error::{ConfigError, EngineError, ValidationError};
pub use watch::{ClientId, Fingerprint, Notification, NotificationStream};

/// The default port tidekv listens on (same as Redis)
pub const DEFAULT_PORT: u16 = 6379;

/// The default host tidekv binds to
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Version of tidekv
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
