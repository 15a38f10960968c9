//! Sorted set commands.

use super::{existing_collection, write_collection};
use crate::engine::{ArgKind, ArgRule, Arity, Command, CommandRegistry, CommandResult, CommandSpec, Reply};
use crate::error::{ConfigError, EngineError};
use crate::storage::{ShardStore, SortedSet, Value};

pub fn register(registry: &mut CommandRegistry) -> Result<(), ConfigError> {
    registry.register(
        CommandSpec::new("ZADD", Arity::Pairs { fixed: 1 }, cmd_zadd)
            .key(0)
            .rule(ArgRule::every(1, 2, ArgKind::Float))
            .write(),
    )?;
    registry.register(CommandSpec::new("ZREM", Arity::AtLeast(2), cmd_zrem).key(0))?;
    registry.register(
        CommandSpec::new("ZSCORE", Arity::Exact(2), cmd_zscore)
            .key(0)
            .readonly(),
    )?;
    registry.register(
        CommandSpec::new("ZRANGE", Arity::Between(3, 4), cmd_zrange)
            .key(0)
            .rule(ArgRule::integer(1))
            .rule(ArgRule::integer(2))
            .readonly(),
    )?;
    registry.register(CommandSpec::new("ZCARD", Arity::Exact(1), cmd_zcard).key(0).readonly())?;
    Ok(())
}

/// ZADD key score member [score member ...]
fn cmd_zadd(cmd: &Command, store: &mut ShardStore) -> CommandResult {
    let object = write_collection(store, &cmd.args[0], "zset", || {
        Value::SortedSet(SortedSet::new())
    })?;
    let set = object.as_sorted_set_mut()?;

    let mut added = 0;
    for i in (1..cmd.args.len()).step_by(2) {
        let score = cmd.float_arg(i)?;
        if set.insert(cmd.args[i + 1].clone(), score) {
            added += 1;
        }
    }
    Ok(Reply::from(added as usize))
}

/// ZREM key member [member ...]
fn cmd_zrem(cmd: &Command, store: &mut ShardStore) -> CommandResult {
    let Some(object) = existing_collection(store, &cmd.args[0], "zset")? else {
        return Ok(Reply::Int(0));
    };
    let set = object.as_sorted_set_mut()?;
    let removed = cmd.args[1..].iter().filter(|member| set.remove(member)).count();
    Ok(Reply::from(removed))
}

/// ZSCORE key member
fn cmd_zscore(cmd: &Command, store: &mut ShardStore) -> CommandResult {
    let score = match store.get(&cmd.args[0]) {
        Some(object) => object.as_sorted_set()?.score(&cmd.args[1]),
        None => None,
    };
    Ok(score.map_or(Reply::Nil, Reply::float))
}

/// ZRANGE key start stop [WITHSCORES]
fn cmd_zrange(cmd: &Command, store: &mut ShardStore) -> CommandResult {
    let with_scores = match cmd.keyword(3).as_deref() {
        None => false,
        Some("WITHSCORES") => true,
        Some(_) => return Err(EngineError::syntax()),
    };
    let start = cmd.int_arg(1)?;
    let stop = cmd.int_arg(2)?;

    let Some(object) = store.get(&cmd.args[0]) else {
        return Ok(Reply::Array(Vec::new()));
    };
    let range = object.as_sorted_set()?.range_by_rank(start, stop);

    let mut replies = Vec::with_capacity(range.len() * if with_scores { 2 } else { 1 });
    for (member, score) in range {
        replies.push(Reply::Bulk(member));
        if with_scores {
            replies.push(Reply::float(score));
        }
    }
    Ok(Reply::Array(replies))
}

/// ZCARD key
fn cmd_zcard(cmd: &Command, store: &mut ShardStore) -> CommandResult {
    let len = match store.get(&cmd.args[0]) {
        Some(object) => object.as_sorted_set()?.len(),
        None => 0,
    };
    Ok(Reply::from(len))
}
