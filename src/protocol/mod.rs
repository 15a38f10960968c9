//! RESP2 wire format.
//!
//! - `parser`: incremental request parser (multibulk and inline)
//! - `types`: [`RespValue`] and the mapping from engine replies and errors
//!
//! ```
//! use bytes::Bytes;
//! use tidekv::engine::Reply;
//! use tidekv::protocol::{parse_request, RespValue};
//!
//! let buf = Bytes::from_static(b"*2\r\n$3\r\nGET\r\n$4\r\nname\r\n");
//! let (parts, consumed) = parse_request(&buf).unwrap().unwrap();
//! assert_eq!(parts.len(), 2);
//! assert_eq!(consumed, buf.len());
//!
//! let wire = RespValue::from(Reply::bulk("ada")).serialize();
//! assert_eq!(wire, b"$3\r\nada\r\n");
//! ```

pub mod parser;
pub mod types;

pub use parser::{parse_request, ParseError, ParseResult};
pub use types::RespValue;
