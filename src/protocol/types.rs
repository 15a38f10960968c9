//! RESP2 reply encoding.
//!
//! Every reply the engine produces maps onto one of five RESP2 types:
//!
//! | Reply              | Wire                          |
//! |--------------------|-------------------------------|
//! | `Reply::Ok`        | `+OK\r\n`                     |
//! | `Reply::Simple`    | `+PONG\r\n`                   |
//! | `Reply::Int`       | `:42\r\n`                     |
//! | `Reply::Bulk`      | `$5\r\nhello\r\n`             |
//! | `Reply::Nil`       | `$-1\r\n`                     |
//! | `Reply::Array`     | `*2\r\n...`                   |
//! | `Err(EngineError)` | `-WRONGTYPE Operation...\r\n` |

use crate::engine::{CommandResult, Reply};
use crate::error::EngineError;
use crate::watch::Notification;
use bytes::{BufMut, Bytes, BytesMut};

pub const CRLF: &[u8] = b"\r\n";

/// RESP type prefixes.
pub mod prefix {
    pub const SIMPLE_STRING: u8 = b'+';
    pub const ERROR: u8 = b'-';
    pub const INTEGER: u8 = b':';
    pub const BULK_STRING: u8 = b'$';
    pub const ARRAY: u8 = b'*';
}

/// A value on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    /// `+<string>\r\n`; must not contain CR or LF
    SimpleString(String),
    /// `-<message>\r\n`
    Error(String),
    Integer(i64),
    BulkString(Bytes),
    /// Null bulk string, `$-1\r\n`
    Null,
    Array(Vec<RespValue>),
}

impl RespValue {
    pub fn simple_string(s: impl Into<String>) -> Self {
        RespValue::SimpleString(s.into())
    }

    pub fn error(s: impl Into<String>) -> Self {
        RespValue::Error(s.into())
    }

    pub fn bulk_string(data: impl Into<Bytes>) -> Self {
        RespValue::BulkString(data.into())
    }

    pub fn ok() -> Self {
        RespValue::SimpleString("OK".to_string())
    }

    /// Encodes the outcome of a command.
    pub fn from_result(result: CommandResult) -> Self {
        match result {
            Ok(reply) => reply.into(),
            Err(e) => e.into(),
        }
    }

    /// Push frame for a watch notification:
    /// `["watch", <fingerprint>, <sequence>, <result>]`.
    pub fn notification(notification: Notification) -> Self {
        RespValue::Array(vec![
            RespValue::bulk_string("watch"),
            RespValue::bulk_string(notification.fingerprint.to_string()),
            RespValue::Integer(notification.sequence as i64),
            notification.result.into(),
        ])
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        self.write_to(&mut buf);
        buf.to_vec()
    }

    /// Appends the wire form to `buf`.
    pub fn write_to(&self, buf: &mut BytesMut) {
        match self {
            RespValue::SimpleString(s) => write_line(buf, prefix::SIMPLE_STRING, s.as_bytes()),
            RespValue::Error(s) => write_line(buf, prefix::ERROR, s.as_bytes()),
            RespValue::Integer(n) => write_line(buf, prefix::INTEGER, n.to_string().as_bytes()),
            RespValue::BulkString(data) => {
                write_line(buf, prefix::BULK_STRING, data.len().to_string().as_bytes());
                buf.put_slice(data);
                buf.put_slice(CRLF);
            }
            RespValue::Null => write_line(buf, prefix::BULK_STRING, b"-1"),
            RespValue::Array(values) => {
                write_line(buf, prefix::ARRAY, values.len().to_string().as_bytes());
                for value in values {
                    value.write_to(buf);
                }
            }
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, RespValue::Error(_))
    }
}

fn write_line(buf: &mut BytesMut, prefix: u8, body: &[u8]) {
    buf.reserve(body.len() + 3);
    buf.put_u8(prefix);
    buf.put_slice(body);
    buf.put_slice(CRLF);
}

impl From<Reply> for RespValue {
    fn from(reply: Reply) -> Self {
        match reply {
            Reply::Nil => RespValue::Null,
            Reply::Ok => RespValue::ok(),
            Reply::Simple(s) => RespValue::SimpleString(s),
            Reply::Int(n) => RespValue::Integer(n),
            Reply::Bulk(data) => RespValue::BulkString(data),
            Reply::Array(items) => RespValue::Array(items.into_iter().map(Into::into).collect()),
        }
    }
}

impl From<EngineError> for RespValue {
    fn from(e: EngineError) -> Self {
        // error strings end up on a single line
        RespValue::Error(e.to_string().replace(['\r', '\n'], " "))
    }
}
