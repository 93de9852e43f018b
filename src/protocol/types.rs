//! RESP Reply Types
//!
//! Replies leave the server as RESP values. Requests only ever arrive as
//! multi-bulk arrays (see [`crate::protocol::decoder`]), so this module is
//! concerned with the outbound direction: building a reply and encoding it
//! into the session's outbound buffer.
//!
//! ## Wire Format
//!
//! - `+` Simple String: `+OK\r\n`
//! - `-` Error: `-ERR unknown command\r\n`
//! - `:` Integer: `:1000\r\n`
//! - `$` Bulk String: `$5\r\nhello\r\n` (null: `$-1\r\n`)
//! - `*` Array: `*2\r\n$3\r\nfoo\r\n$3\r\nbar\r\n`

use bytes::{BufMut, Bytes, BytesMut};

/// The line terminator used throughout the protocol.
pub const CRLF: &[u8] = b"\r\n";

/// RESP type prefixes.
pub mod prefix {
    pub const SIMPLE_STRING: u8 = b'+';
    pub const ERROR: u8 = b'-';
    pub const INTEGER: u8 = b':';
    pub const BULK_STRING: u8 = b'$';
    pub const ARRAY: u8 = b'*';
}

/// A reply value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    /// Non binary-safe status line. Must not contain CR or LF.
    SimpleString(String),

    /// Error line. The text is written after the `-` sentinel verbatim.
    Error(String),

    /// 64-bit signed integer.
    Integer(i64),

    /// Binary-safe string.
    BulkString(Bytes),

    /// Null bulk string.
    Null,

    /// Array of nested replies.
    Array(Vec<RespValue>),
}

impl RespValue {
    /// Creates an error reply.
    ///
    /// # Example
    /// ```
    /// use sparkkv::protocol::RespValue;
    /// let err = RespValue::error("ERR unknown command");
    /// assert_eq!(err.encode(), &b"-ERR unknown command\r\n"[..]);
    /// ```
    pub fn error(s: impl Into<String>) -> Self {
        RespValue::Error(s.into())
    }

    pub fn integer(n: i64) -> Self {
        RespValue::Integer(n)
    }

    /// Creates a bulk string reply.
    ///
    /// # Example
    /// ```
    /// use sparkkv::protocol::RespValue;
    /// use bytes::Bytes;
    /// let bulk = RespValue::bulk_string(Bytes::from("hello"));
    /// assert_eq!(bulk.encode(), &b"$5\r\nhello\r\n"[..]);
    /// ```
    pub fn bulk_string(data: impl Into<Bytes>) -> Self {
        RespValue::BulkString(data.into())
    }

    pub fn null() -> Self {
        RespValue::Null
    }

    pub fn array(values: Vec<RespValue>) -> Self {
        RespValue::Array(values)
    }

    /// `+OK`
    pub fn ok() -> Self {
        RespValue::SimpleString("OK".to_string())
    }

    /// `+PONG`
    pub fn pong() -> Self {
        RespValue::SimpleString("PONG".to_string())
    }

    /// Wraps an optional value as a bulk string or null.
    pub fn from_optional(value: Option<Bytes>) -> Self {
        match value {
            Some(v) => RespValue::BulkString(v),
            None => RespValue::Null,
        }
    }

    /// Builds an array of bulk strings.
    pub fn bulk_array<I>(items: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<Bytes>,
    {
        RespValue::Array(items.into_iter().map(|b| RespValue::BulkString(b.into())).collect())
    }

    /// Encodes the value into a freshly allocated buffer.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len_hint());
        self.encode_into(&mut buf);
        buf.freeze()
    }

    /// Encodes the value at the end of `buf`.
    pub fn encode_into(&self, buf: &mut BytesMut) {
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
                    value.encode_into(buf);
                }
            }
        }
    }

    fn encoded_len_hint(&self) -> usize {
        match self {
            RespValue::SimpleString(s) | RespValue::Error(s) => s.len() + 3,
            RespValue::BulkString(data) => data.len() + 16,
            RespValue::Array(values) => 16 + values.len() * 16,
            _ => 24,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, RespValue::Error(_))
    }
}

/// Encodes the header of a bulk string of `len` bytes, without the payload.
///
/// Used when the payload is streamed separately (for example a file sent
/// through the raw passthrough path).
pub fn bulk_header(len: u64) -> Bytes {
    let mut buf = BytesMut::with_capacity(24);
    write_line(&mut buf, prefix::BULK_STRING, len.to_string().as_bytes());
    buf.freeze()
}

#[inline]
fn write_line(buf: &mut BytesMut, prefix: u8, body: &[u8]) {
    buf.reserve(body.len() + 3);
    buf.put_u8(prefix);
    buf.put_slice(body);
    buf.put_slice(CRLF);
}
