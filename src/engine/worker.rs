//! Shard Worker
//!
//! One tokio task per shard. The task owns its [`ShardStore`] outright and
//! is the only code that ever mutates it; everything else talks to it
//! through a bounded request queue. Requests are handled strictly one at a
//! time, interleaved with the shard's active expiry sweep.
//!
//! After each request the worker commits the store (or aborts it when the
//! command failed), runs the post-write eviction check and forwards the change events of watched keys to the
//! watch dispatcher in the order the store emitted them.

use crate::engine::command::{Command, CommandResult};
use crate::engine::registry::CommandSpec;
use crate::error::{EngineError, EngineResult};
use crate::storage::{ChangeEvent, ShardId, ShardStats, ShardStore, SweepSchedule, ENTRY_OVERHEAD};
use crate::watch::manager::{ClientId, Registration, Subscription, WatchManager};
use crate::watch::Fingerprint;
use bytes::Bytes;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, trace};

/// Shutdown signal shared by all engine tasks.
pub(crate) type Shutdown = tokio::sync::watch::Receiver<bool>;

pub(crate) enum ShardRequest {
    Execute {
        command: Command,
        spec: Arc<CommandSpec>,
        reply: oneshot::Sender<CommandResult>,
    },
    Subscribe {
        client: ClientId,
        command: Command,
        spec: Arc<CommandSpec>,
        fingerprint: Fingerprint,
        reply: oneshot::Sender<EngineResult<Subscription>>,
    },
    Reevaluate {
        fingerprint: Fingerprint,
        reply: oneshot::Sender<Option<Evaluation>>,
    },
    Stats {
        reply: oneshot::Sender<ShardReport>,
    },
}

/// Result of a watch re-evaluation, tagged with the shard's evaluation
/// counter so older results can be told apart from newer ones.
#[derive(Debug)]
pub(crate) struct Evaluation {
    pub result: CommandResult,
    pub as_of: u64,
}

/// Per-shard counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShardReport {
    pub shard: ShardId,
    pub store: ShardStats,
    /// Commands executed (subscribes and re-evaluations not included)
    pub commands: u64,
}

/// Senders of every shard's request queue.
#[derive(Debug, Clone)]
pub(crate) struct ShardHandles {
    senders: Arc<[mpsc::Sender<ShardRequest>]>,
}

impl ShardHandles {
    pub fn new(senders: Vec<mpsc::Sender<ShardRequest>>) -> Self {
        Self {
            senders: senders.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.senders.len()
    }

    /// Sends a request to `shard` and waits for its answer.
    pub async fn request<T>(
        &self,
        shard: ShardId,
        build: impl FnOnce(oneshot::Sender<T>) -> ShardRequest,
    ) -> EngineResult<T> {
        let sender = self
            .senders
            .get(shard)
            .ok_or_else(|| EngineError::Internal(format!("no shard {}", shard)))?;

        let (tx, rx) = oneshot::channel();
        sender
            .send(build(tx))
            .await
            .map_err(|_| EngineError::Internal(format!("shard {} is not running", shard)))?;
        rx.await
            .map_err(|_| EngineError::Internal(format!("shard {} dropped the request", shard)))
    }
}

impl std::fmt::Debug for ShardRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShardRequest::Execute { command, .. } => write!(f, "Execute({})", command),
            ShardRequest::Subscribe {
                client, command, ..
            } => write!(f, "Subscribe({}, {})", client, command),
            ShardRequest::Reevaluate { fingerprint, .. } => write!(f, "Reevaluate({})", fingerprint),
            ShardRequest::Stats { .. } => f.write_str("Stats"),
        }
    }
}

pub(crate) struct ShardWorker {
    store: ShardStore,
    requests: mpsc::Receiver<ShardRequest>,
    events: mpsc::UnboundedSender<ChangeEvent>,
    watch: Arc<WatchManager>,
    schedule: SweepSchedule,
    shutdown: Shutdown,
    commands: u64,
    evaluations: u64,
}

impl ShardWorker {
    pub fn new(
        store: ShardStore,
        requests: mpsc::Receiver<ShardRequest>,
        events: mpsc::UnboundedSender<ChangeEvent>,
        watch: Arc<WatchManager>,
        schedule: SweepSchedule,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            store,
            requests,
            events,
            watch,
            schedule,
            shutdown,
            commands: 0,
            evaluations: 0,
        }
    }

    pub async fn run(mut self) {
        let shard = self.store.id();
        info!(shard = shard, "Shard worker started");

        let mut next_sweep = Instant::now() + self.schedule.interval();
        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.changed() => break,

                request = self.requests.recv() => match request {
                    Some(request) => self.handle(request),
                    None => break,
                },

                _ = tokio::time::sleep_until(next_sweep) => {
                    self.schedule.sweep(&mut self.store);
                    self.forward_events();
                    next_sweep = Instant::now() + self.schedule.interval();
                }
            }
        }

        info!(shard = shard, keys = self.store.len(), commands = self.commands, "Shard worker stopped");
    }

    fn handle(&mut self, request: ShardRequest) {
        match request {
            ShardRequest::Execute {
                command,
                spec,
                reply,
            } => {
                let result = self.execute(&command, &spec);
                let _ = reply.send(result);
            }
            ShardRequest::Subscribe {
                client,
                command,
                spec,
                fingerprint,
                reply,
            } => {
                let result = self.subscribe(client, command, spec, fingerprint);
                let _ = reply.send(result);
            }
            ShardRequest::Reevaluate { fingerprint, reply } => {
                let evaluation = self.reevaluate(fingerprint);
                let _ = reply.send(evaluation);
            }
            ShardRequest::Stats { reply } => {
                let _ = reply.send(ShardReport {
                    shard: self.store.id(),
                    store: self.store.stats(),
                    commands: self.commands,
                });
            }
        }
    }

    /// Runs one command: admission, evaluation, commit, post-write
    /// eviction and event forwarding.
    pub(crate) fn execute(&mut self, command: &Command, spec: &CommandSpec) -> CommandResult {
        self.commands += 1;
        self.evaluations += 1;
        trace!(shard = self.store.id(), command = %command.name, stage = "routed");

        if spec.flags.write {
            if let Err(e) = self.store.admit_write(command.payload_size() + ENTRY_OVERHEAD) {
                // evictions made before the rejection still count
                self.forward_events();
                return Err(e);
            }
        }

        let result = (spec.eval)(command, &mut self.store);
        match result {
            Ok(_) => self.store.commit(),
            Err(_) => self.store.abort(),
        }

        if spec.flags.write && result.is_ok() {
            self.store.relieve_pressure(&spec.keys_of(command));
        }
        self.forward_events();

        trace!(shard = self.store.id(), command = %command.name, stage = "evaluated", ok = result.is_ok());
        result
    }

    fn subscribe(
        &mut self,
        client: ClientId,
        command: Command,
        spec: Arc<CommandSpec>,
        fingerprint: Fingerprint,
    ) -> EngineResult<Subscription> {
        self.evaluations += 1;
        let (result, dependencies) = self.tracked_eval(&command, &spec);
        let result = result?;

        self.watch.register(Registration {
            client,
            fingerprint,
            command,
            spec,
            shard: self.store.id(),
            dependencies,
            result: result.clone(),
            as_of: self.evaluations,
        });
        self.forward_events();

        Ok(Subscription {
            fingerprint,
            result,
        })
    }

    fn reevaluate(&mut self, fingerprint: Fingerprint) -> Option<Evaluation> {
        let (command, spec) = self.watch.query(fingerprint)?;
        self.evaluations += 1;

        let (result, dependencies) = self.tracked_eval(&command, &spec);
        if result.is_ok() {
            self.watch.refresh_dependencies(fingerprint, dependencies);
        }
        self.forward_events();

        Some(Evaluation {
            result,
            as_of: self.evaluations,
        })
    }

    /// Evaluates a read-only command, recording every key it reads.
    fn tracked_eval(
        &mut self,
        command: &Command,
        spec: &CommandSpec,
    ) -> (CommandResult, HashSet<Bytes>) {
        self.store.begin_read_tracking();
        let result = (spec.eval)(command, &mut self.store);
        let dependencies = self.store.finish_read_tracking();
        match result {
            Ok(_) => self.store.commit(),
            Err(_) => self.store.abort(),
        }
        (result, dependencies)
    }

    /// Sends the events of watched keys to the dispatcher, dropping the
    /// rest.
    fn forward_events(&mut self) {
        for event in self.store.take_events() {
            if self.watch.is_watched(&event.key) && self.events.send(event).is_err() {
                debug!(shard = self.store.id(), "Watch dispatcher is gone, dropping change events");
                break;
            }
        }
    }
}
