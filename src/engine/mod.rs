//! Command Evaluation Engine
//!
//! The [`Engine`] is an explicitly constructed instance that owns every
//! shard worker and the watch dispatcher. Transports hold it (usually in an
//! `Arc`) and call [`Engine::evaluate`], [`Engine::subscribe`] and friends;
//! [`Engine::shutdown`] tears everything down.
//!
//! ## Command lifecycle
//!
//! ```text
//!  Received ──▶ Validated ──▶ Routed ──▶ Evaluated ──▶ Completed
//!     │            │            │            │
//!     │      name, arity,   hash(key) %   eval fn on the
//!     │      arg syntax     shard_count   owning shard
//!     │            │
//!     │            └─▶ ValidationError (never reaches a store)
//! ```
//!
//! Multi-key commands whose keys live on different shards are split into
//! one sub-command per shard and their replies folded back together
//! according to the command's [`Gather`] rule. Each sub-command is atomic
//! on its shard; the command as a whole is not.
//!
//! ## Example
//!
//! ```no_run
//! use tidekv::engine::{Command, Engine, Reply};
//! use tidekv::config::EngineConfig;
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let engine = Engine::with_builtins(EngineConfig::default())?;
//!
//! let set = Command::from_parts(["SET", "greeting", "hello"]).unwrap();
//! engine.evaluate(set).await?;
//!
//! let get = Command::from_parts(["GET", "greeting"]).unwrap();
//! assert_eq!(engine.evaluate(get).await?, Reply::bulk("hello"));
//!
//! engine.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod command;
pub mod registry;
pub(crate) mod worker;

pub use command::{Command, CommandResult, Reply};
pub use registry::{
    ArgKind, ArgRule, Arity, CommandFlags, CommandRegistry, CommandSpec, EvalFn, Gather, KeySpec,
};
pub use worker::ShardReport;

use crate::config::EngineConfig;
use crate::error::{ConfigError, EngineError, EngineResult, ValidationError};
use crate::storage::{MemoryGauge, ShardId, ShardStore, SweepSchedule};
use crate::watch::manager::{run_dispatcher, ClientId, Subscription, WatchManager, WatchStats};
use crate::watch::{Fingerprint, NotificationStream};
use bytes::Bytes;
use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use worker::{ShardHandles, ShardRequest, ShardWorker};

/// Engine-wide statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub keys: usize,
    pub used_memory: usize,
    pub max_memory: usize,
    pub expired: u64,
    pub evicted: u64,
    pub commands: u64,
    pub rejected: u64,
    pub shards: Vec<ShardReport>,
    pub watch: WatchStats,
}

/// Where a validated command goes.
enum Route {
    Shard(ShardId),
    /// Sub-commands per shard, each with the indices of the key groups it
    /// carries
    Split(Vec<(ShardId, Command, Vec<usize>)>, usize),
    Broadcast,
}

pub struct Engine {
    config: EngineConfig,
    registry: Arc<CommandRegistry>,
    shards: ShardHandles,
    watch: Arc<WatchManager>,
    /// One gauge per shard, each bounded by that shard's share
    memory: Vec<Arc<MemoryGauge>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    commands: AtomicU64,
    rejected: AtomicU64,
}

impl Engine {
    /// Starts the shard workers and the watch dispatcher.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: EngineConfig, registry: CommandRegistry) -> Result<Self, ConfigError> {
        config.validate()?;

        let share = config.memory.per_shard(config.shard_count);
        let watch = Arc::new(WatchManager::new(config.notification_queue_capacity));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let mut senders = Vec::with_capacity(config.shard_count);
        let mut memory = Vec::with_capacity(config.shard_count);
        let mut tasks = Vec::with_capacity(config.shard_count + 1);
        for id in 0..config.shard_count {
            let (tx, rx) = mpsc::channel(config.shard_queue_capacity.max(1));
            let gauge = Arc::new(MemoryGauge::new(share));
            let store = ShardStore::new(id, Arc::clone(&gauge), config.eviction.clone());
            memory.push(gauge);
            let worker = ShardWorker::new(
                store,
                rx,
                events_tx.clone(),
                Arc::clone(&watch),
                SweepSchedule::new(config.expiry.clone()),
                shutdown_rx.clone(),
            );
            senders.push(tx);
            tasks.push(tokio::spawn(worker.run()));
        }
        drop(events_tx);

        let shards = ShardHandles::new(senders);
        tasks.push(tokio::spawn(run_dispatcher(
            Arc::clone(&watch),
            shards.clone(),
            events_rx,
            shutdown_rx,
        )));

        info!(
            shards = config.shard_count,
            commands = registry.len(),
            max_memory = config.memory.max_memory,
            eviction_policy = %config.eviction.policy,
            "Engine started"
        );

        Ok(Self {
            config,
            registry: Arc::new(registry),
            shards,
            watch,
            memory,
            shutdown_tx,
            tasks: Mutex::new(tasks),
            commands: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        })
    }

    /// Starts an engine with the built-in command catalog.
    pub fn with_builtins(config: EngineConfig) -> Result<Self, ConfigError> {
        let mut registry = CommandRegistry::new();
        crate::commands::register_builtins(&mut registry)?;
        Self::start(config, registry)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &CommandRegistry {
        &self.registry
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// The shard owning `key`.
    pub fn shard_for(&self, key: &[u8]) -> ShardId {
        shard_for(key, self.shards.len())
    }

    /// Validates, routes and evaluates one command.
    pub async fn evaluate(&self, command: Command) -> CommandResult {
        self.commands.fetch_add(1, Ordering::Relaxed);
        trace!(command = %command.name, stage = "received");

        let spec = match self.registry.validate(&command) {
            Ok(spec) => spec,
            Err(e) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                debug!(command = %command.name, error = %e, "Command rejected");
                return Err(e.into());
            }
        };
        trace!(command = %command.name, stage = "validated");

        let result = match self.route(&spec, &command)? {
            Route::Shard(shard) => self.execute_on(shard, command, spec).await,
            Route::Split(parts, groups) => self.execute_split(parts, groups, &spec).await,
            Route::Broadcast => self.execute_broadcast(command, &spec).await,
        };

        if let Err(EngineError::Internal(reason)) = &result {
            warn!(reason = %reason, "Command failed with an internal error");
        }
        trace!(stage = "completed", ok = result.is_ok());
        result
    }

    fn route(&self, spec: &CommandSpec, command: &Command) -> Result<Route, ValidationError> {
        if spec.flags.broadcast {
            return Ok(Route::Broadcast);
        }

        let keys = spec.keys_of(command);
        let shard_count = self.shards.len();
        let Some(first_key) = keys.first() else {
            return Ok(Route::Shard(0));
        };

        let home = shard_for(first_key, shard_count);
        if keys.iter().all(|key| shard_for(key, shard_count) == home) {
            return Ok(Route::Shard(home));
        }

        let (KeySpec::Multi { first, step }, Some(_)) = (spec.keys, spec.gather) else {
            return Err(ValidationError::CrossShard);
        };

        // group the key groups by shard, keeping argument order within each
        let prefix = &command.args[..first.min(command.args.len())];
        let mut per_shard: BTreeMap<ShardId, (Vec<Bytes>, Vec<usize>)> = BTreeMap::new();
        for (index, group) in command.args[prefix.len()..].chunks(step).enumerate() {
            let shard = shard_for(&group[0], shard_count);
            let (args, indices) = per_shard
                .entry(shard)
                .or_insert_with(|| (prefix.to_vec(), Vec::new()));
            args.extend(group.iter().cloned());
            indices.push(index);
        }

        let groups = keys.len();
        let parts = per_shard
            .into_iter()
            .map(|(shard, (args, indices))| {
                (
                    shard,
                    Command {
                        name: command.name.clone(),
                        args,
                    },
                    indices,
                )
            })
            .collect();
        Ok(Route::Split(parts, groups))
    }

    async fn execute_on(&self, shard: ShardId, command: Command, spec: Arc<CommandSpec>) -> CommandResult {
        self.shards
            .request(shard, |reply| ShardRequest::Execute {
                command,
                spec,
                reply,
            })
            .await?
    }

    async fn execute_split(
        &self,
        parts: Vec<(ShardId, Command, Vec<usize>)>,
        groups: usize,
        spec: &Arc<CommandSpec>,
    ) -> CommandResult {
        let gather = spec.gather.ok_or(ValidationError::CrossShard)?;

        let mut replies = Vec::with_capacity(parts.len());
        for (shard, command, indices) in parts {
            let reply = self.execute_on(shard, command, Arc::clone(spec)).await?;
            replies.push((indices, reply));
        }
        Ok(gather.combine(replies, groups))
    }

    async fn execute_broadcast(&self, command: Command, spec: &Arc<CommandSpec>) -> CommandResult {
        let gather = spec.gather.unwrap_or(Gather::AllOk);

        let mut replies = Vec::with_capacity(self.shards.len());
        for shard in 0..self.shards.len() {
            let reply = self
                .execute_on(shard, command.clone(), Arc::clone(spec))
                .await?;
            replies.push((Vec::new(), reply));
        }
        Ok(gather.combine(replies, 0))
    }

    /// Evaluates a read-only command and keeps `client` subscribed to its
    /// result. The initial result is returned; later changes arrive on the
    /// client's [`NotificationStream`].
    pub async fn subscribe(&self, client: ClientId, command: Command) -> EngineResult<Subscription> {
        let spec = self.registry.validate(&command)?;
        if !spec.flags.readonly || spec.flags.broadcast {
            return Err(ValidationError::NotWatchable(command.name.to_ascii_lowercase()).into());
        }

        let shard = match self.route(&spec, &command)? {
            Route::Shard(shard) => shard,
            Route::Split(..) | Route::Broadcast => return Err(ValidationError::CrossShard.into()),
        };

        let fingerprint = Fingerprint::of(&command, spec.order);
        let subscription = self
            .shards
            .request(shard, |reply| ShardRequest::Subscribe {
                client,
                command,
                spec,
                fingerprint,
                reply,
            })
            .await??;

        debug!(client = client, fingerprint = %fingerprint, shard = shard, "Client subscribed");
        Ok(subscription)
    }

    /// Removes one subscription. Returns false if it did not exist.
    pub fn unsubscribe(&self, client: ClientId, fingerprint: Fingerprint) -> bool {
        self.watch.unsubscribe(client, fingerprint)
    }

    /// Removes every subscription of `client` and ends its notification
    /// stream.
    pub fn disconnect(&self, client: ClientId) -> usize {
        self.watch.disconnect(client)
    }

    /// The notification stream of `client`. Calling this again for the
    /// same client returns a stream over the same pending notifications.
    pub fn notifications(&self, client: ClientId) -> NotificationStream {
        self.watch.notifications(client)
    }

    pub fn watch_manager(&self) -> &WatchManager {
        &self.watch
    }

    /// Collects statistics from every shard.
    pub async fn stats(&self) -> EngineResult<EngineStats> {
        let mut stats = EngineStats {
            used_memory: self.memory.iter().map(|gauge| gauge.used()).sum(),
            max_memory: self.config.memory.max_memory,
            commands: self.commands.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            watch: self.watch.stats(),
            ..Default::default()
        };

        for shard in 0..self.shards.len() {
            let report = self
                .shards
                .request(shard, |reply| ShardRequest::Stats { reply })
                .await?;
            stats.keys += report.store.keys;
            stats.expired += report.store.expired;
            stats.evicted += report.store.evicted;
            stats.shards.push(report);
        }
        Ok(stats)
    }

    /// Stops every task and waits for them to finish.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            let _ = task.await;
        }
        info!("Engine stopped");
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// Deterministic key-to-shard mapping.
pub fn shard_for(key: &[u8], shard_count: usize) -> ShardId {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % shard_count.max(1) as u64) as ShardId
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfig;

    fn cmd(parts: &[&str]) -> Command {
        Command::from_parts(parts).unwrap()
    }

    fn config(shards: usize) -> EngineConfig {
        EngineConfig {
            shard_count: shards,
            ..Default::default()
        }
    }

    /// Two keys that hash to different shards.
    fn split_keys(shards: usize) -> (String, String) {
        let first = "key:0".to_string();
        let home = shard_for(first.as_bytes(), shards);
        let other = (1..)
            .map(|i| format!("key:{}", i))
            .find(|k| shard_for(k.as_bytes(), shards) != home)
            .unwrap();
        (first, other)
    }

    #[test]
    fn test_shard_for_is_stable() {
        assert_eq!(shard_for(b"user:1", 8), shard_for(b"user:1", 8));
        assert!(shard_for(b"user:1", 8) < 8);
        assert_eq!(shard_for(b"anything", 1), 0);
    }

    #[tokio::test]
    async fn test_set_get_round_trip() {
        let engine = Engine::with_builtins(config(4)).unwrap();
        assert_eq!(engine.evaluate(cmd(&["SET", "greeting", "hello"])).await, Ok(Reply::Ok));
        assert_eq!(
            engine.evaluate(cmd(&["GET", "greeting"])).await,
            Ok(Reply::bulk("hello"))
        );
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_command_is_validation_error() {
        let engine = Engine::with_builtins(config(2)).unwrap();
        let err = engine.evaluate(cmd(&["FROBNICATE", "x"])).await.unwrap_err();
        assert!(err.is_validation());
        assert_eq!(engine.stats().await.unwrap().rejected, 1);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_split_commands_across_shards() {
        let engine = Engine::with_builtins(config(4)).unwrap();
        let (a, b) = split_keys(4);

        assert_eq!(
            engine.evaluate(cmd(&["MSET", a.as_str(), "1", b.as_str(), "2"])).await,
            Ok(Reply::Ok)
        );
        assert_eq!(
            engine.evaluate(cmd(&["MGET", b.as_str(), "missing", a.as_str()])).await,
            Ok(Reply::Array(vec![Reply::bulk("2"), Reply::Nil, Reply::bulk("1")]))
        );
        assert_eq!(
            engine.evaluate(cmd(&["EXISTS", a.as_str(), b.as_str(), "missing"])).await,
            Ok(Reply::Int(2))
        );
        assert_eq!(engine.evaluate(cmd(&["DEL", a.as_str(), b.as_str()])).await, Ok(Reply::Int(2)));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_broadcast_dbsize() {
        let engine = Engine::with_builtins(config(4)).unwrap();
        for i in 0..20 {
            engine
                .evaluate(cmd(&["SET", format!("k{}", i).as_str(), "v"]))
                .await
                .unwrap();
        }
        assert_eq!(engine.evaluate(cmd(&["DBSIZE"])).await, Ok(Reply::Int(20)));
        assert_eq!(engine.evaluate(cmd(&["FLUSHDB"])).await, Ok(Reply::Ok));
        assert_eq!(engine.evaluate(cmd(&["DBSIZE"])).await, Ok(Reply::Int(0)));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_only_readonly_commands_are_watchable() {
        let engine = Engine::with_builtins(config(2)).unwrap();
        let err = engine.subscribe(1, cmd(&["SET", "k", "v"])).await.unwrap_err();
        assert_eq!(
            err,
            EngineError::Validation(ValidationError::NotWatchable("set".to_string()))
        );

        let (a, b) = split_keys(2);
        let err = engine.subscribe(1, cmd(&["MGET", a.as_str(), b.as_str()])).await.unwrap_err();
        assert_eq!(err, EngineError::Validation(ValidationError::CrossShard));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_stats() {
        let engine = Engine::with_builtins(EngineConfig {
            shard_count: 2,
            memory: MemoryConfig::with_limit(1 << 20),
            ..Default::default()
        })
        .unwrap();
        engine.evaluate(cmd(&["SET", "a", "1"])).await.unwrap();
        engine.evaluate(cmd(&["SET", "b", "2"])).await.unwrap();

        let stats = engine.stats().await.unwrap();
        assert_eq!(stats.keys, 2);
        assert_eq!(stats.shards.len(), 2);
        assert_eq!(stats.commands, 2);
        assert!(stats.used_memory > 0);
        assert_eq!(stats.max_memory, 1 << 20);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let result = Engine::with_builtins(config(0));
        assert!(matches!(result, Err(ConfigError::NoShards)));
    }
}
