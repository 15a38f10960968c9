//! Watch Subscriptions
//!
//! A client can watch any read-only, single-shard command. The command is
//! identified by a [`Fingerprint`] of its canonical form, so every client
//! watching the same query shares one evaluation.
//!
//! ```text
//!   shard worker ──ChangeEvent──> dispatcher ──Reevaluate──> shard worker
//!                                     │
//!                                     └── result changed? ──> Outbox (per client)
//!                                                              │
//!                                                  NotificationStream::next()
//! ```
//!
//! - [`fingerprint`]: canonical command identity
//! - [`manager`]: fingerprint registry, key → fingerprint reverse index and
//!   the re-evaluation dispatcher
//! - [`delivery`]: bounded per-client notification queues

pub mod delivery;
pub mod fingerprint;
pub mod manager;

pub use delivery::{Notification, NotificationStream, Outbox};
pub use fingerprint::{ArgOrder, Fingerprint};
pub use manager::{ClientId, Subscription, WatchManager, WatchStats};
