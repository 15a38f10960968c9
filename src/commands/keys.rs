//! Key space commands: deletion, existence, type and expiry.

use crate::engine::{ArgRule, Arity, Command, CommandRegistry, CommandResult, CommandSpec, Gather, Reply};
use crate::error::{ConfigError, EngineError, EngineResult};
use crate::storage::ShardStore;
use crate::time;
use crate::watch::ArgOrder;
use std::time::Duration;

pub fn register(registry: &mut CommandRegistry) -> Result<(), ConfigError> {
    registry.register(
        CommandSpec::new("DEL", Arity::AtLeast(1), cmd_del).multi_key(0, 1, Gather::Sum),
    )?;
    registry.register(
        CommandSpec::new("EXISTS", Arity::AtLeast(1), cmd_exists)
            .multi_key(0, 1, Gather::Sum)
            .order(ArgOrder::UnorderedFrom(0))
            .readonly(),
    )?;
    registry.register(
        CommandSpec::new("EXPIRE", Arity::Exact(2), cmd_expire)
            .key(0)
            .rule(ArgRule::integer(1)),
    )?;
    registry.register(
        CommandSpec::new("PEXPIRE", Arity::Exact(2), cmd_pexpire)
            .key(0)
            .rule(ArgRule::integer(1)),
    )?;
    registry.register(
        CommandSpec::new("EXPIREAT", Arity::Exact(2), cmd_expireat)
            .key(0)
            .rule(ArgRule::integer(1)),
    )?;
    registry.register(CommandSpec::new("TTL", Arity::Exact(1), cmd_ttl).key(0).readonly())?;
    registry.register(CommandSpec::new("PTTL", Arity::Exact(1), cmd_pttl).key(0).readonly())?;
    registry.register(CommandSpec::new("PERSIST", Arity::Exact(1), cmd_persist).key(0))?;
    registry.register(CommandSpec::new("TYPE", Arity::Exact(1), cmd_type).key(0).readonly())?;
    Ok(())
}

/// DEL key [key ...]
fn cmd_del(cmd: &Command, store: &mut ShardStore) -> CommandResult {
    let deleted = cmd.args.iter().filter(|key| store.delete(key)).count();
    Ok(Reply::from(deleted))
}

/// EXISTS key [key ...]
///
/// A key named twice is counted twice.
fn cmd_exists(cmd: &Command, store: &mut ShardStore) -> CommandResult {
    let found = cmd.args.iter().filter(|key| store.contains(key)).count();
    Ok(Reply::from(found))
}

/// Monotonic deadline `amount * unit_ms` from now. Non-positive amounts
/// give a deadline that is already due.
fn relative_deadline(amount: i64, unit_ms: i64, command: &str) -> EngineResult<u64> {
    if amount <= 0 {
        return Ok(time::now_ms());
    }
    let ms = amount.checked_mul(unit_ms).ok_or_else(|| {
        EngineError::invalid(format!("invalid expire time in '{}' command", command))
    })?;
    Ok(time::deadline_after(Duration::from_millis(ms as u64)))
}

fn expire_with(store: &mut ShardStore, cmd: &Command, deadline: u64) -> CommandResult {
    Ok(Reply::from(store.set_expiry(&cmd.args[0], Some(deadline))))
}

/// EXPIRE key seconds
fn cmd_expire(cmd: &Command, store: &mut ShardStore) -> CommandResult {
    let deadline = relative_deadline(cmd.int_arg(1)?, 1000, "expire")?;
    expire_with(store, cmd, deadline)
}

/// PEXPIRE key milliseconds
fn cmd_pexpire(cmd: &Command, store: &mut ShardStore) -> CommandResult {
    let deadline = relative_deadline(cmd.int_arg(1)?, 1, "pexpire")?;
    expire_with(store, cmd, deadline)
}

/// EXPIREAT key unix-time-seconds
fn cmd_expireat(cmd: &Command, store: &mut ShardStore) -> CommandResult {
    let seconds = cmd.int_arg(1)?.max(0);
    let unix_ms = seconds.checked_mul(1000).ok_or_else(|| {
        EngineError::invalid("invalid expire time in 'expireat' command")
    })?;
    expire_with(store, cmd, time::deadline_from_unix_ms(unix_ms as u64))
}

/// TTL key
///
/// -2 if the key does not exist, -1 if it has no deadline.
fn cmd_ttl(cmd: &Command, store: &mut ShardStore) -> CommandResult {
    Ok(Reply::Int(match store.ttl(&cmd.args[0]) {
        None => -2,
        Some(None) => -1,
        Some(Some(ms)) => ((ms + 500) / 1000) as i64,
    }))
}

/// PTTL key
fn cmd_pttl(cmd: &Command, store: &mut ShardStore) -> CommandResult {
    Ok(Reply::Int(match store.ttl(&cmd.args[0]) {
        None => -2,
        Some(None) => -1,
        Some(Some(ms)) => ms as i64,
    }))
}

/// PERSIST key
fn cmd_persist(cmd: &Command, store: &mut ShardStore) -> CommandResult {
    let key = &cmd.args[0];
    let removed = matches!(store.ttl(key), Some(Some(_))) && store.set_expiry(key, None);
    Ok(Reply::from(removed))
}

/// TYPE key
fn cmd_type(cmd: &Command, store: &mut ShardStore) -> CommandResult {
    let name = store
        .peek(&cmd.args[0])
        .map_or("none", |object| object.value.type_name());
    Ok(Reply::Simple(name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::test_support::run;

    #[test]
    fn test_del_exists() {
        let mut store = ShardStore::unbounded(0);
        run(&mut store, &["MSET", "a", "1", "b", "2"]).unwrap();

        assert_eq!(run(&mut store, &["EXISTS", "a", "a", "c"]), Ok(Reply::Int(2)));
        assert_eq!(run(&mut store, &["DEL", "a", "b", "c"]), Ok(Reply::Int(2)));
        assert_eq!(run(&mut store, &["EXISTS", "a", "b"]), Ok(Reply::Int(0)));
        assert!(store.is_empty());
    }

    #[test]
    fn test_expire_ttl() {
        let mut store = ShardStore::unbounded(0);
        assert_eq!(run(&mut store, &["TTL", "k"]), Ok(Reply::Int(-2)));
        assert_eq!(run(&mut store, &["EXPIRE", "k", "10"]), Ok(Reply::Int(0)));

        run(&mut store, &["SET", "k", "v"]).unwrap();
        assert_eq!(run(&mut store, &["TTL", "k"]), Ok(Reply::Int(-1)));

        assert_eq!(run(&mut store, &["EXPIRE", "k", "100"]), Ok(Reply::Int(1)));
        assert_eq!(run(&mut store, &["TTL", "k"]), Ok(Reply::Int(100)));
        match run(&mut store, &["PTTL", "k"]) {
            Ok(Reply::Int(ms)) => assert!((99_000..=100_000).contains(&ms)),
            other => panic!("unexpected PTTL reply: {:?}", other),
        }

        assert_eq!(
            run(&mut store, &["EXPIRE", "k", "soon"]),
            Err(EngineError::not_an_integer())
        );
    }

    #[test]
    fn test_expire_in_the_past_deletes() {
        let mut store = ShardStore::unbounded(0);
        run(&mut store, &["SET", "a", "1"]).unwrap();
        run(&mut store, &["SET", "b", "1"]).unwrap();
        run(&mut store, &["SET", "c", "1"]).unwrap();

        assert_eq!(run(&mut store, &["EXPIRE", "a", "0"]), Ok(Reply::Int(1)));
        assert_eq!(run(&mut store, &["PEXPIRE", "b", "-5"]), Ok(Reply::Int(1)));
        assert_eq!(run(&mut store, &["EXPIREAT", "c", "1"]), Ok(Reply::Int(1)));

        assert_eq!(run(&mut store, &["GET", "a"]), Ok(Reply::Nil));
        assert_eq!(run(&mut store, &["GET", "b"]), Ok(Reply::Nil));
        assert_eq!(run(&mut store, &["GET", "c"]), Ok(Reply::Nil));
    }

    #[test]
    fn test_persist() {
        let mut store = ShardStore::unbounded(0);
        run(&mut store, &["SET", "k", "v", "EX", "100"]).unwrap();
        assert_eq!(run(&mut store, &["PERSIST", "k"]), Ok(Reply::Int(1)));
        assert_eq!(run(&mut store, &["PERSIST", "k"]), Ok(Reply::Int(0)));
        assert_eq!(run(&mut store, &["TTL", "k"]), Ok(Reply::Int(-1)));
        assert_eq!(run(&mut store, &["PERSIST", "missing"]), Ok(Reply::Int(0)));
    }

    #[test]
    fn test_type() {
        let mut store = ShardStore::unbounded(0);
        run(&mut store, &["SET", "s", "v"]).unwrap();
        run(&mut store, &["INCR", "n"]).unwrap();
        run(&mut store, &["RPUSH", "l", "x"]).unwrap();
        run(&mut store, &["HSET", "h", "f", "v"]).unwrap();
        run(&mut store, &["SADD", "set", "m"]).unwrap();
        run(&mut store, &["ZADD", "z", "1", "m"]).unwrap();

        for (key, expected) in [
            ("s", "string"),
            ("n", "string"),
            ("l", "list"),
            ("h", "hash"),
            ("set", "set"),
            ("z", "zset"),
            ("missing", "none"),
        ] {
            assert_eq!(
                run(&mut store, &["TYPE", key]),
                Ok(Reply::Simple(expected.to_string()))
            );
        }
    }
}
