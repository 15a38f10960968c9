//! Command Registry
//!
//! Maps command names to a closed [`CommandSpec`]: the arity contract,
//! syntactic argument rules, which arguments are keys, behaviour flags and
//! the evaluation function. Commands are registered once at startup;
//! after the engine starts the registry is shared read-only.

use crate::engine::command::{parse_float, parse_int, Command, CommandResult, Reply};
use crate::error::{ConfigError, ValidationError};
use crate::storage::ShardStore;
use crate::watch::ArgOrder;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;

/// Evaluation function of a command.
///
/// Runs inside the owning shard's context with exclusive access to its
/// store. Must not block and must not touch other shards.
pub type EvalFn = fn(&Command, &mut ShardStore) -> CommandResult;

/// Accepted argument counts (the name is not counted).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Exact(usize),
    AtLeast(usize),
    /// Inclusive range
    Between(usize, usize),
    /// `fixed` leading arguments followed by one or more pairs
    Pairs { fixed: usize },
}

impl Arity {
    pub fn accepts(self, count: usize) -> bool {
        match self {
            Arity::Exact(n) => count == n,
            Arity::AtLeast(n) => count >= n,
            Arity::Between(min, max) => (min..=max).contains(&count),
            Arity::Pairs { fixed } => count > fixed && (count - fixed) % 2 == 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    Integer,
    Float,
}

/// A syntactic check on one or more argument positions, applied before
/// the command is routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArgRule {
    pub first: usize,
    /// Repeat every `step` positions after `first`; `None` for one position
    pub step: Option<usize>,
    pub kind: ArgKind,
}

impl ArgRule {
    pub fn integer(position: usize) -> Self {
        Self {
            first: position,
            step: None,
            kind: ArgKind::Integer,
        }
    }

    pub fn float(position: usize) -> Self {
        Self {
            first: position,
            step: None,
            kind: ArgKind::Float,
        }
    }

    pub fn every(first: usize, step: usize, kind: ArgKind) -> Self {
        Self {
            first,
            step: Some(step.max(1)),
            kind,
        }
    }

    fn check(&self, args: &[Bytes]) -> Result<(), ValidationError> {
        let positions: Box<dyn Iterator<Item = usize>> = match self.step {
            Some(step) => Box::new((self.first..args.len()).step_by(step)),
            None => Box::new(std::iter::once(self.first).filter(|&i| i < args.len())),
        };

        for position in positions {
            let arg = &args[position];
            match self.kind {
                ArgKind::Integer if parse_int(arg).is_none() => {
                    return Err(ValidationError::NotAnInteger)
                }
                ArgKind::Float if parse_float(arg).is_none() => {
                    return Err(ValidationError::NotAFloat)
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// Which arguments are keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySpec {
    /// Keyless; runs on the first shard unless broadcast
    None,
    Single(usize),
    /// Every `step`-th argument from `first` to the end is a key, and the
    /// `step` arguments starting at each key belong to it
    Multi { first: usize, step: usize },
}

/// How replies from several shards are folded into one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gather {
    /// Sum of integer replies
    Sum,
    /// Per-key array replies reassembled in argument order
    Concat,
    /// `OK` once every shard replied `OK`
    AllOk,
}

impl Gather {
    /// Folds per-shard replies. `parts` pairs each reply with the indices
    /// of the key groups that shard received; `groups` is the total.
    pub(crate) fn combine(self, parts: Vec<(Vec<usize>, Reply)>, groups: usize) -> Reply {
        match self {
            Gather::Sum => Reply::Int(
                parts
                    .iter()
                    .map(|(_, reply)| match reply {
                        Reply::Int(n) => *n,
                        _ => 0,
                    })
                    .sum(),
            ),
            Gather::AllOk => parts
                .into_iter()
                .map(|(_, reply)| reply)
                .find(|reply| *reply != Reply::Ok)
                .unwrap_or(Reply::Ok),
            Gather::Concat => {
                let mut items = vec![Reply::Nil; groups];
                for (indices, reply) in parts {
                    if let Reply::Array(values) = reply {
                        for (index, value) in indices.into_iter().zip(values) {
                            if let Some(slot) = items.get_mut(index) {
                                *slot = value;
                            }
                        }
                    }
                }
                Reply::Array(items)
            }
        }
    }
}

/// Behaviour flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommandFlags {
    /// May grow the store; goes through memory admission
    pub write: bool,
    /// Never mutates; may be watched
    pub readonly: bool,
    /// Runs on every shard and folds the replies
    pub broadcast: bool,
}

/// Everything the engine knows about one command.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub name: &'static str,
    pub arity: Arity,
    pub keys: KeySpec,
    pub arg_rules: Vec<ArgRule>,
    pub flags: CommandFlags,
    /// Argument canonicalization for watch fingerprints
    pub order: ArgOrder,
    /// Set for commands that may be split across shards
    pub gather: Option<Gather>,
    pub eval: EvalFn,
}

impl CommandSpec {
    pub fn new(name: &'static str, arity: Arity, eval: EvalFn) -> Self {
        Self {
            name,
            arity,
            keys: KeySpec::None,
            arg_rules: Vec::new(),
            flags: CommandFlags::default(),
            order: ArgOrder::Ordered,
            gather: None,
            eval,
        }
    }

    pub fn key(mut self, position: usize) -> Self {
        self.keys = KeySpec::Single(position);
        self
    }

    /// Keys at every `step`-th argument, split across shards and folded
    /// back with `gather`.
    pub fn multi_key(mut self, first: usize, step: usize, gather: Gather) -> Self {
        self.keys = KeySpec::Multi {
            first,
            step: step.max(1),
        };
        self.gather = Some(gather);
        self
    }

    pub fn rule(mut self, rule: ArgRule) -> Self {
        self.arg_rules.push(rule);
        self
    }

    pub fn write(mut self) -> Self {
        self.flags.write = true;
        self
    }

    pub fn readonly(mut self) -> Self {
        self.flags.readonly = true;
        self
    }

    pub fn broadcast(mut self, gather: Gather) -> Self {
        self.flags.broadcast = true;
        self.gather = Some(gather);
        self
    }

    pub fn order(mut self, order: ArgOrder) -> Self {
        self.order = order;
        self
    }

    /// Checks arity and argument syntax.
    pub fn validate(&self, command: &Command) -> Result<(), ValidationError> {
        if !self.arity.accepts(command.arity()) {
            return Err(ValidationError::WrongArity(self.name.to_ascii_lowercase()));
        }
        for rule in &self.arg_rules {
            rule.check(&command.args)?;
        }
        Ok(())
    }

    /// The key arguments of `command`, in argument order.
    pub fn keys_of<'a>(&self, command: &'a Command) -> Vec<&'a Bytes> {
        match self.keys {
            KeySpec::None => Vec::new(),
            KeySpec::Single(position) => command.args.get(position).into_iter().collect(),
            KeySpec::Multi { first, step } => command
                .args
                .iter()
                .skip(first)
                .step_by(step)
                .collect(),
        }
    }
}

/// The command catalog.
#[derive(Debug, Default, Clone)]
pub struct CommandRegistry {
    commands: HashMap<String, Arc<CommandSpec>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a command. Fails if the name is already registered.
    pub fn register(&mut self, spec: CommandSpec) -> Result<(), ConfigError> {
        let name = spec.name.to_ascii_uppercase();
        if self.commands.contains_key(&name) {
            return Err(ConfigError::DuplicateCommand(name));
        }
        self.commands.insert(name, Arc::new(spec));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<CommandSpec>> {
        self.commands.get(name)
    }

    /// Looks up `command` and validates it against its spec.
    pub fn validate(&self, command: &Command) -> Result<Arc<CommandSpec>, ValidationError> {
        let spec = self
            .commands
            .get(&command.name)
            .ok_or_else(|| ValidationError::UnknownCommand(command.name.to_ascii_lowercase()))?;
        spec.validate(command)?;
        Ok(Arc::clone(spec))
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.commands.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
