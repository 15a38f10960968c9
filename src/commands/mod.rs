//! Built-in Command Catalog
//!
//! Every command is a plain function `fn(&Command, &mut ShardStore) ->
//! CommandResult` registered with its arity contract, key positions and
//! flags. The engine validates arity and numeric syntax before a command
//! reaches its function, so the functions index their arguments directly.
//!
//! ## Supported Commands
//!
//! ### String Commands
//! - `SET`, `GET`, `GETDEL`, `MGET`, `MSET`
//! - `INCR`, `INCRBY`, `DECR`, `DECRBY`, `INCRBYFLOAT`
//! - `APPEND`, `STRLEN`
//!
//! ### Key Commands
//! - `DEL`, `EXISTS`, `TYPE`
//! - `EXPIRE`, `PEXPIRE`, `EXPIREAT`, `TTL`, `PTTL`, `PERSIST`
//!
//! ### Collections
//! - Hashes: `HSET`, `HGET`, `HDEL`, `HGETALL`, `HLEN`, `HEXISTS`
//! - Sets: `SADD`, `SREM`, `SMEMBERS`, `SISMEMBER`, `SCARD`
//! - Sorted sets: `ZADD`, `ZREM`, `ZSCORE`, `ZRANGE`, `ZCARD`
//! - Lists: `LPUSH`, `RPUSH`, `LPOP`, `RPOP`, `LRANGE`, `LLEN`
//! - Geo: `GEOADD`, `GEOPOS`, `GEODIST`, `GEOHASH`
//!
//! ### Server Commands
//! - `PING`, `ECHO`, `DBSIZE`, `FLUSHDB`

pub mod geo;
pub mod hashes;
pub mod keys;
pub mod lists;
pub mod server;
pub mod sets;
pub mod strings;
pub mod zsets;

use crate::engine::CommandRegistry;
use crate::error::{ConfigError, EngineError, EngineResult};
use crate::storage::{Object, ShardStore, Value};
use bytes::Bytes;

/// Registers every built-in command.
pub fn register_builtins(registry: &mut CommandRegistry) -> Result<(), ConfigError> {
    strings::register(registry)?;
    keys::register(registry)?;
    hashes::register(registry)?;
    sets::register(registry)?;
    zsets::register(registry)?;
    lists::register(registry)?;
    geo::register(registry)?;
    server::register(registry)?;
    Ok(())
}

/// A registry holding every built-in command.
pub fn builtin_registry() -> Result<CommandRegistry, ConfigError> {
    let mut registry = CommandRegistry::new();
    register_builtins(&mut registry)?;
    Ok(registry)
}

/// Fails with `TypeMismatch` if `key` holds something other than `kind`.
fn check_type(store: &mut ShardStore, key: &[u8], kind: &str) -> EngineResult<()> {
    match store.peek(key) {
        Some(object) if object.value.type_name() != kind => Err(EngineError::TypeMismatch),
        _ => Ok(()),
    }
}

/// The object at `key` for modification, created with `create` if absent.
fn write_collection<'a>(
    store: &'a mut ShardStore,
    key: &Bytes,
    kind: &str,
    create: impl FnOnce() -> Value,
) -> EngineResult<&'a mut Object> {
    check_type(store, key, kind)?;
    Ok(store.get_or_insert_with(key, create))
}

/// The existing object at `key` for modification.
fn existing_collection<'a>(
    store: &'a mut ShardStore,
    key: &[u8],
    kind: &str,
) -> EngineResult<Option<&'a mut Object>> {
    check_type(store, key, kind)?;
    Ok(store.get_mut(key))
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::engine::{Command, CommandResult};
    use crate::storage::ShardStore;

    /// Validates and evaluates `parts` against `store` the way a shard
    /// worker would, without the engine around it.
    pub fn run(store: &mut ShardStore, parts: &[&str]) -> CommandResult {
        let registry = super::builtin_registry().unwrap();
        let command = Command::from_parts(parts).unwrap();
        let spec = registry.validate(&command)?;
        let result = (spec.eval)(&command, store);
        match result {
            Ok(_) => store.commit(),
            Err(_) => store.abort(),
        }
        result
    }
}
