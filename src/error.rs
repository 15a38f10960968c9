//! Error types for the tidekv engine.
//!
//! Every failure a command can produce surfaces as an [`EngineError`] inside
//! the command's result. The `Display` strings follow the Redis conventions
//! (`ERR ...`, `WRONGTYPE ...`, `OOM ...`) so a transport can forward them to
//! clients unchanged.

use thiserror::Error;

/// Errors produced while evaluating a command.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// Bad arity or syntax. Raised before the command touches any store.
    #[error("ERR {0}")]
    Validation(#[from] ValidationError),

    /// The key or member does not exist. Most commands answer with a nil
    /// reply instead; this is for the few that treat absence as an error.
    #[error("ERR no such key")]
    NotFound,

    /// Eviction could not free enough memory to admit the write.
    #[error("OOM command not allowed when used memory > 'maxmemory'")]
    OutOfMemory,

    /// The key holds a value of a different type than the command expects.
    #[error("WRONGTYPE Operation against a key holding the wrong kind of value")]
    TypeMismatch,

    /// An engine invariant was violated (e.g. a shard stopped responding).
    #[error("ERR internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Shorthand for a [`ValidationError::InvalidArgument`].
    pub fn invalid(msg: impl Into<String>) -> Self {
        EngineError::Validation(ValidationError::InvalidArgument(msg.into()))
    }

    /// Shorthand for a [`ValidationError::Syntax`].
    pub fn syntax() -> Self {
        EngineError::Validation(ValidationError::Syntax)
    }

    /// Shorthand for a [`ValidationError::NotAnInteger`].
    pub fn not_an_integer() -> Self {
        EngineError::Validation(ValidationError::NotAnInteger)
    }

    /// Shorthand for a [`ValidationError::NotAFloat`].
    pub fn not_a_float() -> Self {
        EngineError::Validation(ValidationError::NotAFloat)
    }

    /// Returns true for errors raised during validation.
    pub fn is_validation(&self) -> bool {
        matches!(self, EngineError::Validation(_))
    }
}

/// Reasons a command is rejected before it reaches a shard.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    #[error("wrong number of arguments for '{0}' command")]
    WrongArity(String),

    #[error("value is not an integer or out of range")]
    NotAnInteger,

    #[error("value is not a valid float")]
    NotAFloat,

    #[error("syntax error")]
    Syntax,

    #[error("{0}")]
    InvalidArgument(String),

    /// A multi-key command whose keys live on different shards.
    #[error("keys in request don't hash to the same shard")]
    CrossShard,

    /// Only read-only commands can be watched.
    #[error("command '{0}' cannot be watched")]
    NotWatchable(String),
}

/// Errors raised while building an engine or its command catalog.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("shard count must be at least 1")]
    NoShards,

    #[error("memory marks must satisfy low_water <= high_water <= max_memory (got {low} / {high} / {max})")]
    InvalidMemoryMarks { low: usize, high: usize, max: usize },

    #[error("notification queue capacity must be at least 1")]
    EmptyNotificationQueue,

    #[error("expiry sweep budget must be at least 1 key per cycle")]
    EmptySweepBudget,

    #[error("command '{0}' is already registered")]
    DuplicateCommand(String),

    #[error("unknown eviction policy '{0}'")]
    UnknownEvictionPolicy(String),
}

/// Result alias used by command evaluation.
pub type EngineResult<T> = Result<T, EngineError>;
