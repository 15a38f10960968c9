//! Set commands.

use super::{existing_collection, write_collection};
use crate::engine::{Arity, Command, CommandRegistry, CommandResult, CommandSpec, Reply};
use crate::error::ConfigError;
use crate::storage::{ShardStore, Value};

pub fn register(registry: &mut CommandRegistry) -> Result<(), ConfigError> {
    registry.register(CommandSpec::new("SADD", Arity::AtLeast(2), cmd_sadd).key(0).write())?;
    registry.register(CommandSpec::new("SREM", Arity::AtLeast(2), cmd_srem).key(0))?;
    registry.register(
        CommandSpec::new("SMEMBERS", Arity::Exact(1), cmd_smembers)
            .key(0)
            .readonly(),
    )?;
    registry.register(
        CommandSpec::new("SISMEMBER", Arity::Exact(2), cmd_sismember)
            .key(0)
            .readonly(),
    )?;
    registry.register(CommandSpec::new("SCARD", Arity::Exact(1), cmd_scard).key(0).readonly())?;
    Ok(())
}

/// SADD key member [member ...]
fn cmd_sadd(cmd: &Command, store: &mut ShardStore) -> CommandResult {
    let object = write_collection(store, &cmd.args[0], "set", || Value::Set(Default::default()))?;
    let members = object.as_set_mut()?;
    let added = cmd.args[1..]
        .iter()
        .filter(|member| members.insert((*member).clone()))
        .count();
    Ok(Reply::from(added))
}

/// SREM key member [member ...]
fn cmd_srem(cmd: &Command, store: &mut ShardStore) -> CommandResult {
    let Some(object) = existing_collection(store, &cmd.args[0], "set")? else {
        return Ok(Reply::Int(0));
    };
    let members = object.as_set_mut()?;
    let removed = cmd.args[1..]
        .iter()
        .filter(|member| members.remove(*member))
        .count();
    Ok(Reply::from(removed))
}

/// SMEMBERS key
///
/// Members are returned in byte order.
fn cmd_smembers(cmd: &Command, store: &mut ShardStore) -> CommandResult {
    let Some(object) = store.get(&cmd.args[0]) else {
        return Ok(Reply::Array(Vec::new()));
    };
    let mut members: Vec<_> = object.as_set()?.iter().cloned().collect();
    members.sort_unstable();
    Ok(Reply::Array(members.into_iter().map(Reply::Bulk).collect()))
}

/// SISMEMBER key member
fn cmd_sismember(cmd: &Command, store: &mut ShardStore) -> CommandResult {
    let found = match store.get(&cmd.args[0]) {
        Some(object) => object.as_set()?.contains(&cmd.args[1]),
        None => false,
    };
    Ok(Reply::from(found))
}

/// SCARD key
fn cmd_scard(cmd: &Command, store: &mut ShardStore) -> CommandResult {
    let len = match store.get(&cmd.args[0]) {
        Some(object) => object.as_set()?.len(),
        None => 0,
    };
    Ok(Reply::from(len))
}
