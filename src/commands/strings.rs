//! String commands.

use crate::engine::command::{parse_float, parse_int};
use crate::engine::{ArgRule, Arity, Command, CommandRegistry, CommandResult, CommandSpec, Gather, Reply};
use crate::error::{ConfigError, EngineError, EngineResult};
use crate::storage::{Object, ShardStore, Value};
use crate::time;
use bytes::{Bytes, BytesMut};
use std::time::Duration;

pub fn register(registry: &mut CommandRegistry) -> Result<(), ConfigError> {
    registry.register(CommandSpec::new("SET", Arity::AtLeast(2), cmd_set).key(0).write())?;
    registry.register(CommandSpec::new("GET", Arity::Exact(1), cmd_get).key(0).readonly())?;
    registry.register(CommandSpec::new("GETDEL", Arity::Exact(1), cmd_getdel).key(0))?;
    registry.register(
        CommandSpec::new("MGET", Arity::AtLeast(1), cmd_mget)
            .multi_key(0, 1, Gather::Concat)
            .readonly(),
    )?;
    registry.register(
        CommandSpec::new("MSET", Arity::Pairs { fixed: 0 }, cmd_mset)
            .multi_key(0, 2, Gather::AllOk)
            .write(),
    )?;
    registry.register(CommandSpec::new("INCR", Arity::Exact(1), cmd_incr).key(0).write())?;
    registry.register(CommandSpec::new("DECR", Arity::Exact(1), cmd_decr).key(0).write())?;
    registry.register(
        CommandSpec::new("INCRBY", Arity::Exact(2), cmd_incrby)
            .key(0)
            .rule(ArgRule::integer(1))
            .write(),
    )?;
    registry.register(
        CommandSpec::new("DECRBY", Arity::Exact(2), cmd_decrby)
            .key(0)
            .rule(ArgRule::integer(1))
            .write(),
    )?;
    registry.register(
        CommandSpec::new("INCRBYFLOAT", Arity::Exact(2), cmd_incrbyfloat)
            .key(0)
            .rule(ArgRule::float(1))
            .write(),
    )?;
    registry.register(CommandSpec::new("APPEND", Arity::Exact(2), cmd_append).key(0).write())?;
    registry.register(CommandSpec::new("STRLEN", Arity::Exact(1), cmd_strlen).key(0).readonly())?;
    Ok(())
}

/// String value of `key`, `None` if absent.
fn read_string(store: &mut ShardStore, key: &[u8]) -> EngineResult<Option<Bytes>> {
    store.get(key).map(Object::string_bytes).transpose()
}

/// SET key value [EX seconds | PX milliseconds | KEEPTTL] [NX | XX] [GET]
fn cmd_set(cmd: &Command, store: &mut ShardStore) -> CommandResult {
    let key = &cmd.args[0];
    let value = cmd.args[1].clone();

    let mut ttl: Option<Duration> = None;
    let mut keep_ttl = false;
    let mut nx = false;
    let mut xx = false;
    let mut get = false;

    let mut i = 2;
    while i < cmd.args.len() {
        match cmd.keyword(i).as_deref() {
            Some(unit @ ("EX" | "PX")) => {
                i += 1;
                if i >= cmd.args.len() || ttl.is_some() || keep_ttl {
                    return Err(EngineError::syntax());
                }
                let amount = cmd.int_arg(i)?;
                let unit_ms = if unit == "EX" { 1000 } else { 1 };
                let ms = amount
                    .checked_mul(unit_ms)
                    .filter(|ms| *ms > 0)
                    .ok_or_else(|| EngineError::invalid("invalid expire time in 'set' command"))?;
                ttl = Some(Duration::from_millis(ms as u64));
            }
            Some("KEEPTTL") if ttl.is_none() => keep_ttl = true,
            Some("NX") if !xx => nx = true,
            Some("XX") if !nx => xx = true,
            Some("GET") => get = true,
            _ => return Err(EngineError::syntax()),
        }
        i += 1;
    }

    // GET fails on a non-string before anything is written
    let previous = if get { read_string(store, key)? } else { None };
    let existing = store.peek(key).map(|object| object.expires_at);

    if (nx && existing.is_some()) || (xx && existing.is_none()) {
        return Ok(if get { Reply::from_option(previous) } else { Reply::Nil });
    }

    let expires_at = match ttl {
        Some(ttl) => Some(time::deadline_after(ttl)),
        None if keep_ttl => existing.flatten(),
        None => None,
    };
    store.set(key.clone(), Object::with_expiry(Value::from_bytes(value), expires_at));

    Ok(if get { Reply::from_option(previous) } else { Reply::Ok })
}

/// GET key
fn cmd_get(cmd: &Command, store: &mut ShardStore) -> CommandResult {
    Ok(Reply::from_option(read_string(store, &cmd.args[0])?))
}

/// GETDEL key
fn cmd_getdel(cmd: &Command, store: &mut ShardStore) -> CommandResult {
    let key = &cmd.args[0];
    let value = read_string(store, key)?;
    if value.is_some() {
        store.delete(key);
    }
    Ok(Reply::from_option(value))
}

/// MGET key [key ...]
///
/// Keys holding a non-string are reported as nil.
fn cmd_mget(cmd: &Command, store: &mut ShardStore) -> CommandResult {
    let values = cmd
        .args
        .iter()
        .map(|key| Reply::from_option(store.get(key).and_then(|object| object.value.as_bytes())))
        .collect();
    Ok(Reply::Array(values))
}

/// MSET key value [key value ...]
///
/// Keys on different shards are set shard by shard. If one shard rejects
/// its part (out of memory), the parts other shards already applied stay
/// and the caller sees only the error.
fn cmd_mset(cmd: &Command, store: &mut ShardStore) -> CommandResult {
    for pair in cmd.args.chunks(2) {
        store.set(pair[0].clone(), Object::new(Value::from_bytes(pair[1].clone())));
    }
    Ok(Reply::Ok)
}

/// Adds `delta` to the integer at `key`, creating it at 0 if absent.
/// The key keeps its expiry.
fn incr_by(store: &mut ShardStore, key: &Bytes, delta: i64) -> EngineResult<i64> {
    let Some(object) = store.get_mut(key) else {
        store.set(key.clone(), Object::new(Value::Int(delta)));
        return Ok(delta);
    };

    let current = match &object.value {
        Value::Int(n) => *n,
        _ => parse_int(&object.string_bytes()?).ok_or_else(EngineError::not_an_integer)?,
    };
    let next = current
        .checked_add(delta)
        .ok_or_else(|| EngineError::invalid("increment or decrement would overflow"))?;
    object.value = Value::Int(next);
    Ok(next)
}

/// INCR key
fn cmd_incr(cmd: &Command, store: &mut ShardStore) -> CommandResult {
    incr_by(store, &cmd.args[0], 1).map(Reply::Int)
}

/// DECR key
fn cmd_decr(cmd: &Command, store: &mut ShardStore) -> CommandResult {
    incr_by(store, &cmd.args[0], -1).map(Reply::Int)
}

/// INCRBY key increment
fn cmd_incrby(cmd: &Command, store: &mut ShardStore) -> CommandResult {
    incr_by(store, &cmd.args[0], cmd.int_arg(1)?).map(Reply::Int)
}

/// DECRBY key decrement
fn cmd_decrby(cmd: &Command, store: &mut ShardStore) -> CommandResult {
    let delta = cmd
        .int_arg(1)?
        .checked_neg()
        .ok_or_else(|| EngineError::invalid("decrement would overflow"))?;
    incr_by(store, &cmd.args[0], delta).map(Reply::Int)
}

/// INCRBYFLOAT key increment
fn cmd_incrbyfloat(cmd: &Command, store: &mut ShardStore) -> CommandResult {
    let key = &cmd.args[0];
    let delta = cmd.float_arg(1)?;

    let current = match store.peek(key) {
        Some(object) => match &object.value {
            Value::Int(n) => *n as f64,
            Value::Float(f) => *f,
            _ => {
                let text = object.string_bytes()?;
                parse_float(&text).ok_or_else(EngineError::not_a_float)?
            }
        },
        None => 0.0,
    };

    let next = current + delta;
    if !next.is_finite() {
        return Err(EngineError::invalid("increment would produce NaN or Infinity"));
    }

    match store.get_mut(key) {
        Some(object) => object.value = Value::Float(next),
        None => {
            store.set(key.clone(), Object::new(Value::Float(next)));
        }
    }
    Ok(Reply::float(next))
}

/// APPEND key value
fn cmd_append(cmd: &Command, store: &mut ShardStore) -> CommandResult {
    let key = &cmd.args[0];
    let suffix = &cmd.args[1];

    let Some(object) = store.get_mut(key) else {
        store.set(key.clone(), Object::new(Value::from_bytes(suffix.clone())));
        return Ok(Reply::from(suffix.len()));
    };

    let current = object.string_bytes()?;
    let mut joined = BytesMut::with_capacity(current.len() + suffix.len());
    joined.extend_from_slice(&current);
    joined.extend_from_slice(suffix);
    let len = joined.len();
    object.value = Value::String(joined.freeze());
    Ok(Reply::from(len))
}

/// STRLEN key
fn cmd_strlen(cmd: &Command, store: &mut ShardStore) -> CommandResult {
    let len = read_string(store, &cmd.args[0])?.map_or(0, |value| value.len());
    Ok(Reply::from(len))
}
