//! Hash commands.

use super::{existing_collection, write_collection};
use crate::engine::{Arity, Command, CommandRegistry, CommandResult, CommandSpec, Reply};
use crate::error::ConfigError;
use crate::storage::{ShardStore, Value};

pub fn register(registry: &mut CommandRegistry) -> Result<(), ConfigError> {
    registry.register(
        CommandSpec::new("HSET", Arity::Pairs { fixed: 1 }, cmd_hset)
            .key(0)
            .write(),
    )?;
    registry.register(CommandSpec::new("HGET", Arity::Exact(2), cmd_hget).key(0).readonly())?;
    registry.register(CommandSpec::new("HDEL", Arity::AtLeast(2), cmd_hdel).key(0))?;
    registry.register(
        CommandSpec::new("HGETALL", Arity::Exact(1), cmd_hgetall)
            .key(0)
            .readonly(),
    )?;
    registry.register(CommandSpec::new("HLEN", Arity::Exact(1), cmd_hlen).key(0).readonly())?;
    registry.register(
        CommandSpec::new("HEXISTS", Arity::Exact(2), cmd_hexists)
            .key(0)
            .readonly(),
    )?;
    Ok(())
}

/// HSET key field value [field value ...]
fn cmd_hset(cmd: &Command, store: &mut ShardStore) -> CommandResult {
    let object = write_collection(store, &cmd.args[0], "hash", || Value::Hash(Default::default()))?;
    let fields = object.as_hash_mut()?;

    let added = cmd.args[1..]
        .chunks(2)
        .filter(|pair| fields.insert(pair[0].clone(), pair[1].clone()).is_none())
        .count();
    Ok(Reply::from(added))
}

/// HGET key field
fn cmd_hget(cmd: &Command, store: &mut ShardStore) -> CommandResult {
    let Some(object) = store.get(&cmd.args[0]) else {
        return Ok(Reply::Nil);
    };
    Ok(Reply::from_option(object.as_hash()?.get(&cmd.args[1]).cloned()))
}

/// HDEL key field [field ...]
fn cmd_hdel(cmd: &Command, store: &mut ShardStore) -> CommandResult {
    let Some(object) = existing_collection(store, &cmd.args[0], "hash")? else {
        return Ok(Reply::Int(0));
    };
    let fields = object.as_hash_mut()?;
    let removed = cmd.args[1..]
        .iter()
        .filter(|field| fields.remove(*field).is_some())
        .count();
    Ok(Reply::from(removed))
}

/// HGETALL key
///
/// Fields are returned sorted so that equal hashes always produce equal
/// replies.
fn cmd_hgetall(cmd: &Command, store: &mut ShardStore) -> CommandResult {
    let Some(object) = store.get(&cmd.args[0]) else {
        return Ok(Reply::Array(Vec::new()));
    };
    let mut fields: Vec<_> = object.as_hash()?.iter().collect();
    fields.sort_unstable_by(|a, b| a.0.cmp(b.0));

    let flat = fields
        .into_iter()
        .flat_map(|(field, value)| [Reply::Bulk(field.clone()), Reply::Bulk(value.clone())])
        .collect();
    Ok(Reply::Array(flat))
}

/// HLEN key
fn cmd_hlen(cmd: &Command, store: &mut ShardStore) -> CommandResult {
    let len = match store.get(&cmd.args[0]) {
        Some(object) => object.as_hash()?.len(),
        None => 0,
    };
    Ok(Reply::from(len))
}

/// HEXISTS key field
fn cmd_hexists(cmd: &Command, store: &mut ShardStore) -> CommandResult {
    let exists = match store.get(&cmd.args[0]) {
        Some(object) => object.as_hash()?.contains_key(&cmd.args[1]),
        None => false,
    };
    Ok(Reply::from(exists))
}
