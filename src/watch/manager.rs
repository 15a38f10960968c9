//! Watch Manager
//!
//! Keeps three concurrent indexes:
//!
//! - fingerprint → the watched query, the keys it read on its last
//!   evaluation and its subscribers with their last seen result
//! - key → fingerprints that depend on it (the reverse index shard workers
//!   consult to decide which change events to forward)
//! - client → its outbox and the fingerprints it watches
//!
//! Registration and dependency refreshes happen inside the owning shard's
//! context, so no mutation of a newly read key can slip between an
//! evaluation and the moment its dependencies become visible.
//!
//! Lock order is queries, then dependents, then clients. No path holds a
//! guard of a later map while taking one of an earlier map.

use crate::engine::worker::{ShardHandles, ShardRequest, Shutdown};
use crate::engine::{Command, CommandSpec, Reply};
use crate::storage::{ChangeEvent, ShardId};
use crate::watch::{Fingerprint, Notification, NotificationStream, Outbox};
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub type ClientId = u64;

/// Returned by a successful subscribe.
#[derive(Debug, Clone, PartialEq)]
pub struct Subscription {
    pub fingerprint: Fingerprint,
    /// Result of the initial evaluation (sequence 0)
    pub result: Reply,
}

#[derive(Debug, Clone)]
struct SubscriberState {
    last_result: Reply,
    sequence: u64,
    /// Shard evaluation counter of `last_result`
    as_of: u64,
}

#[derive(Debug)]
struct WatchedQuery {
    command: Command,
    spec: Arc<CommandSpec>,
    shard: ShardId,
    dependencies: HashSet<Bytes>,
    subscribers: HashMap<ClientId, SubscriberState>,
}

#[derive(Debug)]
struct ClientEntry {
    outbox: Arc<Outbox>,
    fingerprints: HashSet<Fingerprint>,
}

/// Everything a shard worker hands over when a subscribe succeeds.
#[derive(Debug)]
pub(crate) struct Registration {
    pub client: ClientId,
    pub fingerprint: Fingerprint,
    pub command: Command,
    pub spec: Arc<CommandSpec>,
    pub shard: ShardId,
    pub dependencies: HashSet<Bytes>,
    pub result: Reply,
    pub as_of: u64,
}

/// Watch counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WatchStats {
    pub fingerprints: usize,
    pub subscriptions: usize,
    pub clients: usize,
    pub watched_keys: usize,
    pub dropped_notifications: u64,
}

#[derive(Debug)]
pub struct WatchManager {
    queries: DashMap<Fingerprint, WatchedQuery>,
    dependents: DashMap<Bytes, HashSet<Fingerprint>>,
    clients: DashMap<ClientId, ClientEntry>,
    queue_capacity: usize,
}

impl WatchManager {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            queries: DashMap::new(),
            dependents: DashMap::new(),
            clients: DashMap::new(),
            queue_capacity,
        }
    }

    fn new_client(&self) -> ClientEntry {
        ClientEntry {
            outbox: Arc::new(Outbox::new(self.queue_capacity)),
            fingerprints: HashSet::new(),
        }
    }

    /// The notification stream of `client`, creating its outbox if needed.
    pub fn notifications(&self, client: ClientId) -> NotificationStream {
        let outbox = Arc::clone(
            &self
                .clients
                .entry(client)
                .or_insert_with(|| self.new_client())
                .outbox,
        );
        NotificationStream::new(outbox)
    }

    /// Records a subscription. Called from the owning shard's context.
    pub(crate) fn register(&self, registration: Registration) {
        let Registration {
            client,
            fingerprint,
            command,
            spec,
            shard,
            dependencies,
            result,
            as_of,
        } = registration;

        self.clients
            .entry(client)
            .or_insert_with(|| self.new_client())
            .fingerprints
            .insert(fingerprint);

        {
            let mut query = self
                .queries
                .entry(fingerprint)
                .or_insert_with(|| WatchedQuery {
                    command,
                    spec,
                    shard,
                    dependencies: HashSet::new(),
                    subscribers: HashMap::new(),
                });
            self.relink(fingerprint, &mut query.dependencies, dependencies);

            match query.subscribers.get_mut(&client) {
                Some(existing) => {
                    if as_of > existing.as_of {
                        existing.last_result = result;
                        existing.as_of = as_of;
                    }
                }
                None => {
                    query.subscribers.insert(
                        client,
                        SubscriberState {
                            last_result: result,
                            sequence: 0,
                            as_of,
                        },
                    );
                }
            }
        }

        // the client may have disconnected while we were registering
        let connected = self
            .clients
            .get(&client)
            .is_some_and(|entry| entry.fingerprints.contains(&fingerprint));
        if !connected {
            self.remove_subscriber(client, fingerprint);
        }

        debug!(client = client, fingerprint = %fingerprint, shard = shard, "Watch registered");
    }

    /// The command behind `fingerprint`, for re-evaluation.
    pub(crate) fn query(&self, fingerprint: Fingerprint) -> Option<(Command, Arc<CommandSpec>)> {
        self.queries
            .get(&fingerprint)
            .map(|query| (query.command.clone(), Arc::clone(&query.spec)))
    }

    /// Owning shard of a watched query.
    pub fn shard_of(&self, fingerprint: Fingerprint) -> Option<ShardId> {
        self.queries.get(&fingerprint).map(|query| query.shard)
    }

    /// Replaces the dependency set of a query after a re-evaluation.
    /// Called from the owning shard's context.
    pub(crate) fn refresh_dependencies(&self, fingerprint: Fingerprint, dependencies: HashSet<Bytes>) {
        if let Some(mut query) = self.queries.get_mut(&fingerprint) {
            self.relink(fingerprint, &mut query.dependencies, dependencies);
        }
    }

    fn relink(&self, fingerprint: Fingerprint, current: &mut HashSet<Bytes>, next: HashSet<Bytes>) {
        for stale in current.difference(&next) {
            self.unlink(fingerprint, stale);
        }
        for fresh in next.difference(current) {
            self.dependents
                .entry(fresh.clone())
                .or_default()
                .insert(fingerprint);
        }
        *current = next;
    }

    fn unlink(&self, fingerprint: Fingerprint, key: &Bytes) {
        if let Some(mut fingerprints) = self.dependents.get_mut(key) {
            fingerprints.remove(&fingerprint);
        }
        self.dependents
            .remove_if(key, |_, fingerprints| fingerprints.is_empty());
    }

    /// Returns true if any watched query read `key` on its last evaluation.
    pub fn is_watched(&self, key: &[u8]) -> bool {
        self.dependents.contains_key(key)
    }

    /// Fingerprints depending on `key`.
    pub fn dependents(&self, key: &[u8]) -> Vec<Fingerprint> {
        self.dependents
            .get(key)
            .map(|fingerprints| fingerprints.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Compares a fresh result against every subscriber's last result and
    /// notifies those for which it changed. Results older than what a
    /// subscriber has already seen are ignored. Returns the number of
    /// notifications queued.
    pub(crate) fn publish(&self, fingerprint: Fingerprint, result: Reply, as_of: u64) -> usize {
        let Some(mut query) = self.queries.get_mut(&fingerprint) else {
            return 0;
        };

        let mut sent = 0;
        for (client, subscriber) in query.subscribers.iter_mut() {
            if as_of <= subscriber.as_of {
                continue;
            }
            subscriber.as_of = as_of;
            if subscriber.last_result == result {
                continue;
            }
            subscriber.sequence += 1;
            subscriber.last_result = result.clone();

            let Some(entry) = self.clients.get(client) else {
                continue;
            };
            let notification = Notification {
                fingerprint,
                result: result.clone(),
                sequence: subscriber.sequence,
            };
            if !entry.outbox.push(notification) {
                warn!(
                    client = *client,
                    fingerprint = %fingerprint,
                    dropped = entry.outbox.dropped(),
                    "Notification queue full, dropped oldest notification"
                );
            }
            sent += 1;
        }
        sent
    }

    /// Removes one subscription. Idempotent; returns true if something was
    /// removed.
    pub fn unsubscribe(&self, client: ClientId, fingerprint: Fingerprint) -> bool {
        let listed = self
            .clients
            .get_mut(&client)
            .map(|mut entry| entry.fingerprints.remove(&fingerprint))
            .unwrap_or(false);
        let removed = self.remove_subscriber(client, fingerprint);
        listed || removed
    }

    /// Removes every subscription of `client` and closes its outbox.
    /// Returns the number of subscriptions removed.
    pub fn disconnect(&self, client: ClientId) -> usize {
        let Some((_, entry)) = self.clients.remove(&client) else {
            return 0;
        };
        entry.outbox.close();
        for fingerprint in &entry.fingerprints {
            self.remove_subscriber(client, *fingerprint);
        }
        debug!(client = client, watches = entry.fingerprints.len(), "Watch client disconnected");
        entry.fingerprints.len()
    }

    fn remove_subscriber(&self, client: ClientId, fingerprint: Fingerprint) -> bool {
        match self.queries.entry(fingerprint) {
            Entry::Occupied(mut occupied) => {
                let removed = occupied.get_mut().subscribers.remove(&client).is_some();
                if occupied.get().subscribers.is_empty() {
                    for key in &occupied.get().dependencies {
                        self.unlink(fingerprint, key);
                    }
                    occupied.remove();
                }
                removed
            }
            Entry::Vacant(_) => false,
        }
    }

    pub fn stats(&self) -> WatchStats {
        WatchStats {
            fingerprints: self.queries.len(),
            subscriptions: self
                .queries
                .iter()
                .map(|query| query.subscribers.len())
                .sum(),
            clients: self.clients.len(),
            watched_keys: self.dependents.len(),
            dropped_notifications: self
                .clients
                .iter()
                .map(|entry| entry.outbox.dropped())
                .sum(),
        }
    }
}

/// Watch dispatcher task.
///
/// Receives the change events shard workers forward, coalesces whatever is
/// queued into one set of affected fingerprints and re-evaluates each on
/// its owning shard. Re-evaluation requests queue behind the mutation that
/// caused them, so they always observe the committed state.
pub(crate) async fn run_dispatcher(
    manager: Arc<WatchManager>,
    shards: ShardHandles,
    mut events: mpsc::UnboundedReceiver<ChangeEvent>,
    mut shutdown: Shutdown,
) {
    info!("Watch dispatcher started");

    loop {
        let first = tokio::select! {
            _ = shutdown.changed() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        let mut affected = BTreeSet::new();
        affected.extend(manager.dependents(&first.key));
        while let Ok(event) = events.try_recv() {
            affected.extend(manager.dependents(&event.key));
        }

        for fingerprint in affected {
            refresh(&manager, &shards, fingerprint).await;
        }
    }

    info!("Watch dispatcher stopped");
}

async fn refresh(manager: &WatchManager, shards: &ShardHandles, fingerprint: Fingerprint) {
    let Some(shard) = manager.shard_of(fingerprint) else {
        return;
    };

    let evaluation = match shards
        .request(shard, |reply| ShardRequest::Reevaluate { fingerprint, reply })
        .await
    {
        Ok(Some(evaluation)) => evaluation,
        Ok(None) => return,
        Err(e) => {
            warn!(fingerprint = %fingerprint, shard = shard, error = %e, "Watch re-evaluation not delivered");
            return;
        }
    };

    match evaluation.result {
        Ok(result) => {
            let sent = manager.publish(fingerprint, result, evaluation.as_of);
            if sent > 0 {
                debug!(fingerprint = %fingerprint, notified = sent, "Watch result changed");
            }
        }
        Err(e) => {
            warn!(
                fingerprint = %fingerprint,
                error = %e,
                "Watch re-evaluation failed, skipping this cycle"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Arity, CommandResult};
    use crate::storage::ShardStore;
    use crate::watch::ArgOrder;

    fn noop(_: &Command, _: &mut ShardStore) -> CommandResult {
        Ok(Reply::Nil)
    }

    fn registration(client: ClientId, key: &str, result: Reply, as_of: u64) -> Registration {
        let command = Command::from_parts(["GET", key]).unwrap();
        Registration {
            client,
            fingerprint: Fingerprint::of(&command, ArgOrder::Ordered),
            command,
            spec: Arc::new(CommandSpec::new("GET", Arity::Exact(1), noop).key(0)),
            shard: 0,
            dependencies: HashSet::from([Bytes::from(key.to_string())]),
            result,
            as_of,
        }
    }

    #[test]
    fn test_register_links_dependencies() {
        let manager = WatchManager::new(8);
        let reg = registration(1, "k", Reply::Nil, 1);
        let fingerprint = reg.fingerprint;
        manager.register(reg);

        assert!(manager.is_watched(b"k"));
        assert_eq!(manager.dependents(b"k"), vec![fingerprint]);
        assert_eq!(manager.shard_of(fingerprint), Some(0));

        let stats = manager.stats();
        assert_eq!(stats.fingerprints, 1);
        assert_eq!(stats.subscriptions, 1);
        assert_eq!(stats.clients, 1);
    }

    #[test]
    fn test_pair_registered_once() {
        let manager = WatchManager::new(8);
        manager.register(registration(1, "k", Reply::Nil, 1));
        manager.register(registration(1, "k", Reply::Nil, 2));
        manager.register(registration(2, "k", Reply::Nil, 3));

        let stats = manager.stats();
        assert_eq!(stats.fingerprints, 1);
        assert_eq!(stats.subscriptions, 2);
    }

    #[test]
    fn test_publish_only_on_change() {
        let manager = WatchManager::new(8);
        let reg = registration(1, "k", Reply::bulk("v1"), 1);
        let fingerprint = reg.fingerprint;
        manager.register(reg);
        let mut stream = manager.notifications(1);

        assert_eq!(manager.publish(fingerprint, Reply::bulk("v1"), 2), 0);
        assert_eq!(manager.publish(fingerprint, Reply::bulk("v2"), 3), 1);
        assert_eq!(manager.publish(fingerprint, Reply::bulk("v3"), 4), 1);

        let first = stream.try_next().unwrap();
        assert_eq!(first.result, Reply::bulk("v2"));
        assert_eq!(first.sequence, 1);
        assert_eq!(stream.try_next().unwrap().sequence, 2);
        assert!(stream.try_next().is_none());
    }

    #[test]
    fn test_stale_results_are_ignored() {
        let manager = WatchManager::new(8);
        let reg = registration(1, "k", Reply::bulk("new"), 10);
        let fingerprint = reg.fingerprint;
        manager.register(reg);

        assert_eq!(manager.publish(fingerprint, Reply::bulk("old"), 9), 0);
        assert!(manager.notifications(1).try_next().is_none());
    }

    #[test]
    fn test_unsubscribe_is_idempotent() {
        let manager = WatchManager::new(8);
        let reg = registration(1, "k", Reply::Nil, 1);
        let fingerprint = reg.fingerprint;
        manager.register(reg);

        assert!(manager.unsubscribe(1, fingerprint));
        assert!(!manager.unsubscribe(1, fingerprint));
        assert!(!manager.is_watched(b"k"));
        assert_eq!(manager.stats().fingerprints, 0);
        assert_eq!(manager.publish(fingerprint, Reply::bulk("x"), 5), 0);
    }

    #[test]
    fn test_disconnect_removes_everything() {
        let manager = WatchManager::new(8);
        manager.register(registration(1, "a", Reply::Nil, 1));
        manager.register(registration(1, "b", Reply::Nil, 1));
        manager.register(registration(2, "b", Reply::Nil, 1));
        let stream = manager.notifications(1);

        assert_eq!(manager.disconnect(1), 2);
        assert_eq!(manager.disconnect(1), 0);
        assert!(stream.outbox().is_closed());
        assert!(!manager.is_watched(b"a"));
        // client 2 still depends on b
        assert!(manager.is_watched(b"b"));
        assert_eq!(manager.stats().subscriptions, 1);
    }

    #[test]
    fn test_refresh_dependencies() {
        let manager = WatchManager::new(8);
        let reg = registration(1, "a", Reply::Nil, 1);
        let fingerprint = reg.fingerprint;
        manager.register(reg);

        manager.refresh_dependencies(fingerprint, HashSet::from([Bytes::from("b")]));
        assert!(!manager.is_watched(b"a"));
        assert_eq!(manager.dependents(b"b"), vec![fingerprint]);
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let manager = WatchManager::new(2);
        let reg = registration(1, "k", Reply::Int(0), 0);
        let fingerprint = reg.fingerprint;
        manager.register(reg);

        for i in 1..=5 {
            manager.publish(fingerprint, Reply::Int(i), i as u64);
        }

        let mut stream = manager.notifications(1);
        assert_eq!(stream.try_next().unwrap().sequence, 4);
        assert_eq!(stream.try_next().unwrap().sequence, 5);
        assert_eq!(manager.stats().dropped_notifications, 3);
        assert!(stream.outbox().take_overflow());
    }
}
