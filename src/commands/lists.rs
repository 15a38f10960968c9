//! List commands.

use super::{existing_collection, write_collection};
use crate::engine::{ArgRule, Arity, Command, CommandRegistry, CommandResult, CommandSpec, Reply};
use crate::error::{ConfigError, EngineError};
use crate::storage::object::normalize_range;
use crate::storage::{ShardStore, Value};

pub fn register(registry: &mut CommandRegistry) -> Result<(), ConfigError> {
    registry.register(CommandSpec::new("LPUSH", Arity::AtLeast(2), cmd_lpush).key(0).write())?;
    registry.register(CommandSpec::new("RPUSH", Arity::AtLeast(2), cmd_rpush).key(0).write())?;
    registry.register(CommandSpec::new("LPOP", Arity::Between(1, 2), cmd_lpop).key(0))?;
    registry.register(CommandSpec::new("RPOP", Arity::Between(1, 2), cmd_rpop).key(0))?;
    registry.register(
        CommandSpec::new("LRANGE", Arity::Exact(3), cmd_lrange)
            .key(0)
            .rule(ArgRule::integer(1))
            .rule(ArgRule::integer(2))
            .readonly(),
    )?;
    registry.register(CommandSpec::new("LLEN", Arity::Exact(1), cmd_llen).key(0).readonly())?;
    Ok(())
}

#[derive(Clone, Copy)]
enum End {
    Left,
    Right,
}

fn push(cmd: &Command, store: &mut ShardStore, end: End) -> CommandResult {
    let object = write_collection(store, &cmd.args[0], "list", || Value::List(Default::default()))?;
    let items = object.as_list_mut()?;
    for value in &cmd.args[1..] {
        match end {
            End::Left => items.push_front(value.clone()),
            End::Right => items.push_back(value.clone()),
        }
    }
    Ok(Reply::from(items.len()))
}

/// Pops one element, or up to `count` elements when a count is given.
fn pop(cmd: &Command, store: &mut ShardStore, end: End) -> CommandResult {
    let count = match cmd.args.get(1) {
        Some(_) => {
            let count = cmd.int_arg(1)?;
            if count < 0 {
                return Err(EngineError::invalid("value is out of range, must be positive"));
            }
            Some(count as usize)
        }
        None => None,
    };

    let Some(object) = existing_collection(store, &cmd.args[0], "list")? else {
        return Ok(Reply::Nil);
    };
    let items = object.as_list_mut()?;
    let mut next = || match end {
        End::Left => items.pop_front(),
        End::Right => items.pop_back(),
    };

    Ok(match count {
        None => Reply::from_option(next()),
        Some(count) => Reply::Array(
            std::iter::from_fn(next)
                .take(count)
                .map(Reply::Bulk)
                .collect(),
        ),
    })
}

/// LPUSH key element [element ...]
fn cmd_lpush(cmd: &Command, store: &mut ShardStore) -> CommandResult {
    push(cmd, store, End::Left)
}

/// RPUSH key element [element ...]
fn cmd_rpush(cmd: &Command, store: &mut ShardStore) -> CommandResult {
    push(cmd, store, End::Right)
}

/// LPOP key [count]
fn cmd_lpop(cmd: &Command, store: &mut ShardStore) -> CommandResult {
    pop(cmd, store, End::Left)
}

/// RPOP key [count]
fn cmd_rpop(cmd: &Command, store: &mut ShardStore) -> CommandResult {
    pop(cmd, store, End::Right)
}

/// LRANGE key start stop
fn cmd_lrange(cmd: &Command, store: &mut ShardStore) -> CommandResult {
    let start = cmd.int_arg(1)?;
    let stop = cmd.int_arg(2)?;

    let Some(object) = store.get(&cmd.args[0]) else {
        return Ok(Reply::Array(Vec::new()));
    };
    let items = object.as_list()?;
    let Some((from, to)) = normalize_range(start, stop, items.len()) else {
        return Ok(Reply::Array(Vec::new()));
    };

    Ok(Reply::Array(
        items
            .range(from..=to)
            .cloned()
            .map(Reply::Bulk)
            .collect(),
    ))
}

/// LLEN key
fn cmd_llen(cmd: &Command, store: &mut ShardStore) -> CommandResult {
    let len = match store.get(&cmd.args[0]) {
        Some(object) => object.as_list()?.len(),
        None => 0,
    };
    Ok(Reply::from(len))
}
