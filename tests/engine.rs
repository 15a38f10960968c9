//! End-to-end tests against a running engine.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::time::Duration;
use tidekv::config::{EngineConfig, MemoryConfig};
use tidekv::engine::{Command, Engine, Reply};
use tidekv::error::{EngineError, ValidationError};
use tidekv::storage::{EvictionConfig, EvictionPolicy};
use tidekv::watch::NotificationStream;
use tokio::time::timeout;

fn cmd(parts: &[&str]) -> Command {
    Command::from_parts(parts).unwrap()
}

fn engine(shards: usize) -> Engine {
    Engine::with_builtins(EngineConfig {
        shard_count: shards,
        ..Default::default()
    })
    .unwrap()
}

/// Asserts that nothing arrives on `stream` for a while.
async fn assert_quiet(stream: &mut NotificationStream) {
    let next = timeout(Duration::from_millis(200), stream.next()).await;
    assert!(next.is_err(), "unexpected notification: {:?}", next);
}

/// Polls `condition` until it holds or two seconds pass.
async fn eventually(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "condition never held");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn test_set_get_expire() {
    let engine = engine(4);

    assert_eq!(engine.evaluate(cmd(&["SET", "k", "v"])).await, Ok(Reply::Ok));
    assert_eq!(engine.evaluate(cmd(&["GET", "k"])).await, Ok(Reply::bulk("v")));

    assert_eq!(engine.evaluate(cmd(&["EXPIRE", "k", "0"])).await, Ok(Reply::Int(1)));
    assert_eq!(engine.evaluate(cmd(&["GET", "k"])).await, Ok(Reply::Nil));

    engine.shutdown().await;
}

#[tokio::test]
async fn test_validation_errors_never_reach_a_shard() {
    let engine = engine(2);

    let err = engine.evaluate(cmd(&["FROB", "k"])).await.unwrap_err();
    assert_eq!(
        err,
        EngineError::Validation(ValidationError::UnknownCommand("frob".into()))
    );

    let err = engine.evaluate(cmd(&["GET"])).await.unwrap_err();
    assert!(err.is_validation());

    let stats = engine.stats().await.unwrap();
    assert_eq!(stats.rejected, 2);
    assert_eq!(stats.shards.iter().map(|s| s.commands).sum::<u64>(), 0);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_watch_notifies_exactly_once_per_change() {
    let engine = engine(4);
    engine.evaluate(cmd(&["SET", "k", "v1"])).await.unwrap();

    let subscription = engine.subscribe(7, cmd(&["GET", "k"])).await.unwrap();
    assert_eq!(subscription.result, Reply::bulk("v1"));
    let mut stream = engine.notifications(7);

    engine.evaluate(cmd(&["SET", "k", "v2"])).await.unwrap();
    let notification = timeout(Duration::from_secs(2), stream.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(notification.fingerprint, subscription.fingerprint);
    assert_eq!(notification.result, Reply::bulk("v2"));
    assert_eq!(notification.sequence, 1);
    assert_quiet(&mut stream).await;

    // same value again: the result does not change
    engine.evaluate(cmd(&["SET", "k", "v2"])).await.unwrap();
    assert_quiet(&mut stream).await;

    // unrelated keys never trigger a re-evaluation
    engine.evaluate(cmd(&["SET", "other", "x"])).await.unwrap();
    assert_quiet(&mut stream).await;

    engine.evaluate(cmd(&["DEL", "k"])).await.unwrap();
    let notification = timeout(Duration::from_secs(2), stream.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(notification.result, Reply::Nil);
    assert_eq!(notification.sequence, 2);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_watch_sees_active_expiry() {
    let engine = engine(1);
    engine
        .evaluate(cmd(&["SET", "session", "alive", "PX", "50"]))
        .await
        .unwrap();

    let subscription = engine.subscribe(1, cmd(&["GET", "session"])).await.unwrap();
    assert_eq!(subscription.result, Reply::bulk("alive"));

    // nobody reads the key again; the sweep has to find it
    let mut stream = engine.notifications(1);
    let notification = timeout(Duration::from_secs(2), stream.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(notification.result, Reply::Nil);
    assert!(engine.stats().await.unwrap().expired >= 1);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_shared_fingerprint_and_disconnect() {
    let engine = engine(2);

    let a = engine.subscribe(1, cmd(&["HGETALL", "h"])).await.unwrap();
    let b = engine.subscribe(2, cmd(&["hgetall", "h"])).await.unwrap();
    assert_eq!(a.fingerprint, b.fingerprint);

    let stats = engine.watch_manager().stats();
    assert_eq!(stats.fingerprints, 1);
    assert_eq!(stats.subscriptions, 2);

    assert_eq!(engine.disconnect(1), 1);
    assert_eq!(engine.disconnect(1), 0);
    assert_eq!(engine.watch_manager().stats().subscriptions, 1);

    let mut stream = engine.notifications(2);
    engine.evaluate(cmd(&["HSET", "h", "f", "v"])).await.unwrap();
    let notification = timeout(Duration::from_secs(2), stream.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        notification.result,
        Reply::Array(vec![Reply::bulk("f"), Reply::bulk("v")])
    );

    assert!(engine.unsubscribe(2, b.fingerprint));
    let stats = engine.watch_manager().stats();
    assert_eq!(stats.fingerprints, 0);
    assert_eq!(stats.watched_keys, 0);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_slow_client_loses_oldest_notifications() {
    let engine = Engine::with_builtins(EngineConfig {
        shard_count: 2,
        notification_queue_capacity: 2,
        ..Default::default()
    })
    .unwrap();

    engine.subscribe(1, cmd(&["GET", "k"])).await.unwrap();
    let mut stream = engine.notifications(1);

    for i in 1..=5u64 {
        let value = format!("v{}", i);
        engine.evaluate(cmd(&["SET", "k", value.as_str()])).await.unwrap();
        let outbox = stream.outbox().clone();
        eventually(|| outbox.len() as u64 + outbox.dropped() == i).await;
    }

    assert_eq!(stream.outbox().dropped(), 3);
    assert!(stream.outbox().take_overflow());

    let fourth = stream.next().await.unwrap();
    let fifth = stream.next().await.unwrap();
    assert_eq!((fourth.sequence, fourth.result), (4, Reply::bulk("v4")));
    assert_eq!((fifth.sequence, fifth.result), (5, Reply::bulk("v5")));

    engine.shutdown().await;
}

#[tokio::test]
async fn test_noeviction_rejects_writes_at_the_limit() {
    let engine = Engine::with_builtins(EngineConfig {
        shard_count: 1,
        memory: MemoryConfig::with_limit(4096),
        eviction: EvictionConfig {
            policy: EvictionPolicy::NoEviction,
            ..Default::default()
        },
        ..Default::default()
    })
    .unwrap();

    let value = "x".repeat(100);
    let mut rejected_at = None;
    for i in 0..100 {
        let key = format!("key:{}", i);
        match engine.evaluate(cmd(&["SET", key.as_str(), value.as_str()])).await {
            Ok(_) => {}
            Err(EngineError::OutOfMemory) => {
                rejected_at = Some(i);
                break;
            }
            Err(e) => panic!("unexpected error: {}", e),
        }
    }
    let rejected_at = rejected_at.expect("writes were never rejected");
    assert!(rejected_at > 0);

    let stats = engine.stats().await.unwrap();
    assert!(stats.used_memory <= 4096);
    assert_eq!(stats.evicted, 0);

    // reads and deletes still work
    assert_eq!(
        engine.evaluate(cmd(&["GET", "key:0"])).await,
        Ok(Reply::bulk(value.clone()))
    );
    assert_eq!(engine.evaluate(cmd(&["DEL", "key:0"])).await, Ok(Reply::Int(1)));
    assert_eq!(
        engine.evaluate(cmd(&["SET", "key:0", value.as_str()])).await,
        Ok(Reply::Ok)
    );

    engine.shutdown().await;
}

#[tokio::test]
async fn test_lru_eviction_keeps_memory_bounded() {
    let engine = Engine::with_builtins(EngineConfig {
        shard_count: 1,
        memory: MemoryConfig::with_limit(8192),
        ..Default::default()
    })
    .unwrap();

    let value = "x".repeat(100);
    for i in 0..200 {
        let key = format!("key:{}", i);
        assert_eq!(
            engine.evaluate(cmd(&["SET", key.as_str(), value.as_str()])).await,
            Ok(Reply::Ok)
        );
    }

    let stats = engine.stats().await.unwrap();
    assert!(stats.used_memory <= 8192);
    assert!(stats.evicted > 0);
    assert!(stats.keys < 200);

    engine.shutdown().await;
}

/// A key name with `prefix` that the engine routes to `shard`.
fn key_on(engine: &Engine, shard: usize, prefix: &str) -> String {
    (0..)
        .map(|i| format!("{}:{}", prefix, i))
        .find(|key| engine.shard_for(key.as_bytes()) == shard)
        .unwrap()
}

#[tokio::test]
async fn test_eviction_stays_within_the_writing_shard() {
    let engine = Engine::with_builtins(EngineConfig {
        shard_count: 2,
        memory: MemoryConfig::with_limit(10_000),
        ..Default::default()
    })
    .unwrap();

    // a busy shard 0 keeps itself within its half of the budget
    let small = "x".repeat(100);
    let mut written = 0;
    for i in 0.. {
        let key = format!("a:{}", i);
        if engine.shard_for(key.as_bytes()) != 0 {
            continue;
        }
        engine
            .evaluate(cmd(&["SET", key.as_str(), small.as_str()]))
            .await
            .unwrap();
        written += 1;
        if written == 60 {
            break;
        }
    }

    // shard 1 has its own room regardless
    let first = key_on(&engine, 1, "b");
    let second = key_on(&engine, 1, "c");
    let large = "y".repeat(1_000);
    let larger = "z".repeat(1_300);
    assert_eq!(
        engine.evaluate(cmd(&["SET", first.as_str(), large.as_str()])).await,
        Ok(Reply::Ok)
    );
    assert_eq!(
        engine.evaluate(cmd(&["GET", first.as_str()])).await,
        Ok(Reply::bulk(large.clone()))
    );
    assert_eq!(
        engine.evaluate(cmd(&["SET", second.as_str(), larger.as_str()])).await,
        Ok(Reply::Ok)
    );

    let stats = engine.stats().await.unwrap();
    assert!(stats.used_memory <= 10_000);
    assert!(stats.shards[0].store.evicted > 0);
    assert_eq!(stats.shards[1].store.evicted, 0);
    assert_eq!(stats.shards[1].store.keys, 2);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_write_over_high_water_is_not_evicted_by_itself() {
    let engine = Engine::with_builtins(EngineConfig {
        shard_count: 1,
        memory: MemoryConfig::with_limit(2_000),
        ..Default::default()
    })
    .unwrap();

    // above the high water mark once stored, but within the hard limit
    let value = "x".repeat(1_900);
    assert_eq!(
        engine.evaluate(cmd(&["SET", "big", value.as_str()])).await,
        Ok(Reply::Ok)
    );
    assert_eq!(
        engine.evaluate(cmd(&["GET", "big"])).await,
        Ok(Reply::bulk(value))
    );
    assert_eq!(engine.stats().await.unwrap().evicted, 0);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_split_mset_keeps_parts_applied_before_a_rejection() {
    let engine = Engine::with_builtins(EngineConfig {
        shard_count: 2,
        memory: MemoryConfig::with_limit(4_000),
        eviction: EvictionConfig {
            policy: EvictionPolicy::NoEviction,
            ..Default::default()
        },
        ..Default::default()
    })
    .unwrap();

    // fill most of shard 1's half of the budget
    let filler = key_on(&engine, 1, "fill");
    let value = "x".repeat(1_500);
    engine
        .evaluate(cmd(&["SET", filler.as_str(), value.as_str()]))
        .await
        .unwrap();

    let on_zero = key_on(&engine, 0, "a");
    let on_one = key_on(&engine, 1, "b");
    let big = "y".repeat(1_000);
    assert_eq!(
        engine
            .evaluate(cmd(&["MSET", on_zero.as_str(), "small", on_one.as_str(), big.as_str()]))
            .await,
        Err(EngineError::OutOfMemory)
    );

    assert_eq!(
        engine.evaluate(cmd(&["GET", on_zero.as_str()])).await,
        Ok(Reply::bulk("small"))
    );
    assert_eq!(engine.evaluate(cmd(&["GET", on_one.as_str()])).await, Ok(Reply::Nil));

    engine.shutdown().await;
}

/// Random single-client workload checked against a plain map.
#[tokio::test]
async fn test_matches_sequential_model() {
    let engine = engine(4);
    let mut model: HashMap<String, i64> = HashMap::new();
    let mut rng = StdRng::seed_from_u64(0x71de);

    for _ in 0..2_000 {
        let key = format!("k{}", rng.gen_range(0..16));
        match rng.gen_range(0..5) {
            0 => {
                let n: i64 = rng.gen_range(-1000..1000);
                let value = n.to_string();
                let reply = engine.evaluate(cmd(&["SET", key.as_str(), value.as_str()])).await;
                assert_eq!(reply, Ok(Reply::Ok));
                model.insert(key, n);
            }
            1 => {
                let reply = engine.evaluate(cmd(&["INCR", key.as_str()])).await;
                let expected = model.get(&key).copied().unwrap_or(0) + 1;
                assert_eq!(reply, Ok(Reply::Int(expected)));
                model.insert(key, expected);
            }
            2 => {
                let reply = engine.evaluate(cmd(&["DEL", key.as_str()])).await;
                let expected = model.remove(&key).is_some();
                assert_eq!(reply, Ok(Reply::from(expected)));
            }
            3 => {
                let reply = engine.evaluate(cmd(&["GET", key.as_str()])).await;
                let expected = model.get(&key).map(|n| Reply::bulk(n.to_string()));
                assert_eq!(reply, Ok(expected.unwrap_or(Reply::Nil)));
            }
            _ => {
                let other = format!("k{}", rng.gen_range(0..16));
                let reply = engine
                    .evaluate(cmd(&["EXISTS", key.as_str(), other.as_str()]))
                    .await;
                let expected = [&key, &other]
                    .iter()
                    .filter(|k| model.contains_key(**k))
                    .count();
                assert_eq!(reply, Ok(Reply::from(expected)));
            }
        }
    }

    let dbsize = engine.evaluate(cmd(&["DBSIZE"])).await;
    assert_eq!(dbsize, Ok(Reply::from(model.len())));

    engine.shutdown().await;
}
