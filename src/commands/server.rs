//! Server commands.

use crate::engine::{Arity, Command, CommandRegistry, CommandResult, CommandSpec, Gather, Reply};
use crate::error::ConfigError;
use crate::storage::ShardStore;

pub fn register(registry: &mut CommandRegistry) -> Result<(), ConfigError> {
    registry.register(CommandSpec::new("PING", Arity::Between(0, 1), cmd_ping).readonly())?;
    registry.register(CommandSpec::new("ECHO", Arity::Exact(1), cmd_echo).readonly())?;
    registry.register(
        CommandSpec::new("DBSIZE", Arity::Exact(0), cmd_dbsize)
            .readonly()
            .broadcast(Gather::Sum),
    )?;
    registry.register(
        CommandSpec::new("FLUSHDB", Arity::Exact(0), cmd_flushdb).broadcast(Gather::AllOk),
    )?;
    Ok(())
}

/// PING [message]
fn cmd_ping(cmd: &Command, _store: &mut ShardStore) -> CommandResult {
    Ok(match cmd.args.first() {
        Some(message) => Reply::Bulk(message.clone()),
        None => Reply::Simple("PONG".to_string()),
    })
}

/// ECHO message
fn cmd_echo(cmd: &Command, _store: &mut ShardStore) -> CommandResult {
    Ok(Reply::Bulk(cmd.args[0].clone()))
}

/// DBSIZE
///
/// Includes keys whose deadline passed but that no sweep has removed yet.
fn cmd_dbsize(_cmd: &Command, store: &mut ShardStore) -> CommandResult {
    Ok(Reply::from(store.len()))
}

/// FLUSHDB
fn cmd_flushdb(_cmd: &Command, store: &mut ShardStore) -> CommandResult {
    store.flush();
    Ok(Reply::Ok)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::test_support::run;
    use crate::error::{EngineError, ValidationError};

    #[test]
    fn test_ping_echo() {
        let mut store = ShardStore::unbounded(0);
        assert_eq!(run(&mut store, &["PING"]), Ok(Reply::Simple("PONG".into())));
        assert_eq!(run(&mut store, &["ping", "hi"]), Ok(Reply::bulk("hi")));
        assert_eq!(
            run(&mut store, &["PING", "a", "b"]),
            Err(EngineError::Validation(ValidationError::WrongArity("ping".into())))
        );
        assert_eq!(run(&mut store, &["ECHO", "hello"]), Ok(Reply::bulk("hello")));
    }

    #[test]
    fn test_dbsize_flushdb() {
        let mut store = ShardStore::unbounded(0);
        run(&mut store, &["MSET", "a", "1", "b", "2"]).unwrap();
        run(&mut store, &["SADD", "s", "x"]).unwrap();
        assert_eq!(run(&mut store, &["DBSIZE"]), Ok(Reply::Int(3)));

        assert_eq!(run(&mut store, &["FLUSHDB"]), Ok(Reply::Ok));
        assert_eq!(run(&mut store, &["DBSIZE"]), Ok(Reply::Int(0)));
        assert_eq!(store.memory().used(), 0);
    }
}
