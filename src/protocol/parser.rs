//! RESP2 request parser.
//!
//! Clients send commands either as an array of bulk strings
//! (`*2\r\n$3\r\nGET\r\n$1\r\nk\r\n`) or as an inline line (`GET k\r\n`).
//! The parser is incremental: given whatever has arrived so far it returns
//!
//! - `Ok(Some((parts, consumed)))` when a whole request is buffered
//! - `Ok(None)` when more bytes are needed
//! - `Err(ParseError)` when the input can never become a valid request
//!
//! Bulk payloads are sliced out of the frozen input buffer, so arguments
//! share the connection's allocation instead of being copied.

use crate::protocol::types::{prefix, CRLF};
use bytes::Bytes;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("invalid length: {0}")]
    InvalidLength(String),

    #[error("expected '{expected}', got {got:#04x}")]
    UnexpectedByte { expected: char, got: u8 },

    #[error("bulk string missing trailing CRLF")]
    MissingCrlf,

    #[error("request too large: {size} bytes (max: {max})")]
    TooLarge { size: usize, max: usize },

    #[error("empty request")]
    Empty,
}

pub type ParseResult<T> = Result<T, ParseError>;

/// Largest accepted bulk argument.
pub const MAX_BULK_SIZE: usize = 512 * 1024 * 1024;

/// Largest accepted argument count.
pub const MAX_ARGS: usize = 1024 * 1024;

/// Largest accepted inline request line.
pub const MAX_INLINE_SIZE: usize = 64 * 1024;

/// Parses one request from the front of `buf`.
pub fn parse_request(buf: &Bytes) -> ParseResult<Option<(Vec<Bytes>, usize)>> {
    match buf.first() {
        None => Ok(None),
        Some(&prefix::ARRAY) => parse_multibulk(buf),
        Some(_) => parse_inline(buf),
    }
}

fn parse_multibulk(buf: &Bytes) -> ParseResult<Option<(Vec<Bytes>, usize)>> {
    let Some((count, mut pos)) = read_length(buf, 0, MAX_ARGS)? else {
        return Ok(None);
    };

    let mut parts = Vec::with_capacity(count);
    for _ in 0..count {
        let Some(&byte) = buf.get(pos) else {
            return Ok(None);
        };
        if byte != prefix::BULK_STRING {
            return Err(ParseError::UnexpectedByte {
                expected: prefix::BULK_STRING as char,
                got: byte,
            });
        }

        let Some((len, start)) = read_length(buf, pos, MAX_BULK_SIZE)? else {
            return Ok(None);
        };
        let end = start + len;
        if buf.len() < end + CRLF.len() {
            return Ok(None);
        }
        if &buf[end..end + CRLF.len()] != CRLF {
            return Err(ParseError::MissingCrlf);
        }

        parts.push(buf.slice(start..end));
        pos = end + CRLF.len();
    }

    if parts.is_empty() {
        return Err(ParseError::Empty);
    }
    Ok(Some((parts, pos)))
}

/// Reads `<prefix><n>\r\n` at `at`. Returns the length and the position
/// right after the CRLF.
fn read_length(buf: &[u8], at: usize, max: usize) -> ParseResult<Option<(usize, usize)>> {
    let Some(line_len) = find_crlf(&buf[at + 1..]) else {
        return Ok(None);
    };
    let line = &buf[at + 1..at + 1 + line_len];
    let n = std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .ok_or_else(|| ParseError::InvalidLength(String::from_utf8_lossy(line).into_owned()))?;
    if n > max {
        return Err(ParseError::TooLarge { size: n, max });
    }
    Ok(Some((n, at + 1 + line_len + CRLF.len())))
}

fn parse_inline(buf: &Bytes) -> ParseResult<Option<(Vec<Bytes>, usize)>> {
    let Some(end) = find_crlf(buf) else {
        if buf.len() > MAX_INLINE_SIZE {
            return Err(ParseError::TooLarge {
                size: buf.len(),
                max: MAX_INLINE_SIZE,
            });
        }
        return Ok(None);
    };

    let mut parts = Vec::new();
    let mut start = None;
    for (i, byte) in buf[..end].iter().enumerate() {
        match (byte.is_ascii_whitespace(), start) {
            (false, None) => start = Some(i),
            (true, Some(s)) => {
                parts.push(buf.slice(s..i));
                start = None;
            }
            _ => {}
        }
    }
    if let Some(s) = start {
        parts.push(buf.slice(s..end));
    }

    if parts.is_empty() {
        return Err(ParseError::Empty);
    }
    Ok(Some((parts, end + CRLF.len())))
}

#[inline]
fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|window| window == CRLF)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(input: &'static [u8]) -> ParseResult<Option<(Vec<Bytes>, usize)>> {
        parse_request(&Bytes::from_static(input))
    }

    fn parts(items: &[&'static str]) -> Vec<Bytes> {
        items.iter().map(|s| Bytes::from_static(s.as_bytes())).collect()
    }

    #[test]
    fn test_parse_multibulk() {
        let input = b"*3\r\n$3\r\nSET\r\n$3\r\nkey\r\n$5\r\nvalue\r\n";
        let (request, consumed) = parse(input).unwrap().unwrap();
        assert_eq!(request, parts(&["SET", "key", "value"]));
        assert_eq!(consumed, input.len());
    }

    #[test]
    fn test_parse_binary_argument() {
        let (request, _) = parse(b"*2\r\n$3\r\nGET\r\n$4\r\na\r\nb\r\n").unwrap().unwrap();
        assert_eq!(request[1], Bytes::from_static(b"a\r\nb"));
    }

    #[test]
    fn test_parse_incomplete() {
        assert_eq!(parse(b""), Ok(None));
        assert_eq!(parse(b"*2\r\n$3\r\nGET\r\n"), Ok(None));
        assert_eq!(parse(b"*2\r\n$3\r\nGET\r\n$4\r\nna"), Ok(None));
        assert_eq!(parse(b"*1\r"), Ok(None));
        assert_eq!(parse(b"PING"), Ok(None));
    }

    #[test]
    fn test_parse_pipelined() {
        let input = b"*1\r\n$4\r\nPING\r\n*1\r\n$4\r\nPING\r\n";
        let (_, consumed) = parse(input).unwrap().unwrap();
        assert_eq!(consumed, input.len() / 2);
    }

    #[test]
    fn test_parse_inline() {
        let (request, consumed) = parse(b"GET.WATCH  key\r\n").unwrap().unwrap();
        assert_eq!(request, parts(&["GET.WATCH", "key"]));
        assert_eq!(consumed, 16);
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(
            parse(b"*1\r\n:5\r\n"),
            Err(ParseError::UnexpectedByte {
                expected: '$',
                got: b':'
            })
        );
        assert_eq!(parse(b"*1\r\n$3\r\nGETX\r\n"), Err(ParseError::MissingCrlf));
        assert!(matches!(parse(b"*x\r\n"), Err(ParseError::InvalidLength(_))));
        assert!(matches!(parse(b"*-1\r\n"), Err(ParseError::InvalidLength(_))));
        assert_eq!(parse(b"*0\r\n"), Err(ParseError::Empty));
        assert_eq!(parse(b"   \r\n"), Err(ParseError::Empty));
    }
}
