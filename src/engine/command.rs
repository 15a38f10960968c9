//! Commands and their replies.

use crate::error::{EngineError, EngineResult};
use crate::storage::object::format_float;
use bytes::Bytes;
use std::fmt;

/// A parsed command: an uppercase name and its arguments.
///
/// Commands are immutable once built and consumed by exactly one
/// evaluation (or kept by the watch manager for re-evaluation).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Command {
    pub name: String,
    pub args: Vec<Bytes>,
}

impl Command {
    pub fn new(name: impl AsRef<str>, args: Vec<Bytes>) -> Self {
        Self {
            name: name.as_ref().to_ascii_uppercase(),
            args,
        }
    }

    /// Builds a command from a sequence of string-like parts where the
    /// first part is the name.
    ///
    /// # Example
    ///
    /// ```
    /// use tidekv::engine::Command;
    ///
    /// let cmd = Command::from_parts(["set", "greeting", "hello"]).unwrap();
    /// assert_eq!(cmd.name, "SET");
    /// assert_eq!(cmd.args.len(), 2);
    /// ```
    pub fn from_parts<I, P>(parts: I) -> Option<Self>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<[u8]>,
    {
        let mut parts = parts.into_iter();
        let name = parts.next()?;
        let name = String::from_utf8_lossy(name.as_ref()).into_owned();
        let args = parts
            .map(|part| Bytes::copy_from_slice(part.as_ref()))
            .collect();
        Some(Self::new(name, args))
    }

    /// Number of arguments, not counting the name.
    #[inline]
    pub fn arity(&self) -> usize {
        self.args.len()
    }

    /// Parses argument `index` as a signed 64-bit integer.
    pub fn int_arg(&self, index: usize) -> EngineResult<i64> {
        self.args
            .get(index)
            .and_then(|arg| parse_int(arg))
            .ok_or_else(EngineError::not_an_integer)
    }

    /// Parses argument `index` as a float.
    pub fn float_arg(&self, index: usize) -> EngineResult<f64> {
        self.args
            .get(index)
            .and_then(|arg| parse_float(arg))
            .ok_or_else(EngineError::not_a_float)
    }

    /// Argument `index` uppercased, for option keywords.
    pub fn keyword(&self, index: usize) -> Option<String> {
        self.args
            .get(index)
            .map(|arg| String::from_utf8_lossy(arg).to_ascii_uppercase())
    }

    /// Approximate bytes a write of this command may add to the store.
    pub fn payload_size(&self) -> usize {
        self.args.iter().map(Bytes::len).sum()
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        for arg in &self.args {
            write!(f, " {}", String::from_utf8_lossy(arg))?;
        }
        Ok(())
    }
}

pub(crate) fn parse_int(data: &[u8]) -> Option<i64> {
    std::str::from_utf8(data).ok()?.parse().ok()
}

pub(crate) fn parse_float(data: &[u8]) -> Option<f64> {
    let text = std::str::from_utf8(data).ok()?;
    let value = match text.to_ascii_lowercase().as_str() {
        "inf" | "+inf" => f64::INFINITY,
        "-inf" => f64::NEG_INFINITY,
        other => other.parse().ok()?,
    };
    (!value.is_nan()).then_some(value)
}

/// The value half of a [`CommandResult`].
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Absent value
    Nil,
    /// Plain acknowledgement
    Ok,
    /// Short status text (e.g. `PONG`)
    Simple(String),
    Int(i64),
    Bulk(Bytes),
    Array(Vec<Reply>),
}

impl Reply {
    pub fn bulk(data: impl Into<Bytes>) -> Self {
        Reply::Bulk(data.into())
    }

    pub fn float(value: f64) -> Self {
        Reply::Bulk(Bytes::from(format_float(value)))
    }

    /// `Bulk` for `Some`, `Nil` for `None`.
    pub fn from_option(value: Option<Bytes>) -> Self {
        value.map_or(Reply::Nil, Reply::Bulk)
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Reply::Nil)
    }
}

impl From<bool> for Reply {
    fn from(value: bool) -> Self {
        Reply::Int(value as i64)
    }
}

impl From<usize> for Reply {
    fn from(value: usize) -> Self {
        Reply::Int(value as i64)
    }
}

/// Outcome of evaluating one command.
pub type CommandResult = Result<Reply, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_is_uppercased() {
        let cmd = Command::new("get", vec![Bytes::from("k")]);
        assert_eq!(cmd.name, "GET");
        assert_eq!(cmd.to_string(), "GET k");
    }

    #[test]
    fn test_from_parts_empty() {
        assert!(Command::from_parts(Vec::<&str>::new()).is_none());
    }

    #[test]
    fn test_numeric_args() {
        let cmd = Command::from_parts(["INCRBY", "k", "-5", "1.5", "abc", "+inf"]).unwrap();
        assert_eq!(cmd.int_arg(1), Ok(-5));
        assert_eq!(cmd.float_arg(2), Ok(1.5));
        assert_eq!(cmd.int_arg(3), Err(EngineError::not_an_integer()));
        assert_eq!(cmd.float_arg(3), Err(EngineError::not_a_float()));
        assert_eq!(cmd.float_arg(4), Ok(f64::INFINITY));
        assert_eq!(cmd.int_arg(10), Err(EngineError::not_an_integer()));
    }

    #[test]
    fn test_nan_is_rejected() {
        assert_eq!(parse_float(b"nan"), None);
    }

    #[test]
    fn test_reply_helpers() {
        assert_eq!(Reply::from_option(None), Reply::Nil);
        assert_eq!(Reply::from(true), Reply::Int(1));
        assert_eq!(Reply::float(2.5), Reply::bulk("2.5"));
    }
}
