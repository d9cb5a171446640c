//! Protocol Data Types
//!
//! The wire format (from the memcached protocol description):
//!
//! ```text
//! client -> proxy:   get <key1> [<key2> ...]\r\n
//!                    set <key> <flags> <exptime> <bytes>\r\n<data>\r\n
//!
//! backend -> proxy:  VALUE <key> <flags> <bytes>\r\n<data>\r\n   (0..k times)
//!                    followed by one of:
//!                    END\r\n | STORED\r\n | ERROR\r\n
//!                    | CLIENT_ERROR <text>\r\n | SERVER_ERROR <text>\r\n
//! ```
//!
//! Payload lengths on the wire exclude the trailing CRLF; everywhere in this
//! crate `data_len` *includes* those two bytes, so that a data block can be
//! consumed and forwarded verbatim.

use bytes::Bytes;
use std::fmt;

/// The CRLF line terminator.
pub const CRLF: &[u8] = b"\r\n";

/// Field index of `<bytes>` in a client `set` line.
const SET_BYTES_FIELD: usize = 4;

/// Field index of `<bytes>` in a backend `VALUE` line.
const VALUE_BYTES_FIELD: usize = 3;

/// The verb of a client request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Get,
    Set,
    /// Anything that is not `get` or `set`. Enqueued like every other
    /// request; the worker logs it and deliberately sends no reply.
    Unknown,
}

impl Verb {
    /// Classifies a complete request line by its prefix.
    pub fn classify(line: &[u8]) -> Self {
        if line.starts_with(b"get") {
            Verb::Get
        } else if line.starts_with(b"set") {
            Verb::Set
        } else {
            Verb::Unknown
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verb::Get => write!(f, "get"),
            Verb::Set => write!(f, "set"),
            Verb::Unknown => write!(f, "unknown"),
        }
    }
}

/// One complete, framed client request.
///
/// `line` is the full request line including its CRLF; `data` is the `set`
/// payload including its CRLF (empty for `get`/unknown). Both are zero-copy
/// slices out of the connection's read buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub line: Bytes,
    pub verb: Verb,
    pub data: Bytes,
    /// Payload length including CRLF. Zero for `get`/unknown requests and
    /// for `set` lines whose bytes field could not be parsed.
    pub data_len: usize,
}

impl Request {
    /// Number of keys on the request line (fields after the verb).
    pub fn key_count(&self) -> usize {
        split_fields(&self.line).count().saturating_sub(1)
    }

    /// The key fields of the request line, in order.
    pub fn keys(&self) -> impl Iterator<Item = &[u8]> {
        split_fields(&self.line).skip(1)
    }

    /// The request line as text, for logging.
    pub fn line_text(&self) -> String {
        String::from_utf8_lossy(&self.line).trim_end().to_string()
    }

    /// Total bytes this request occupied on the wire.
    pub fn wire_len(&self) -> usize {
        self.line.len() + self.data.len()
    }
}

/// Classification of one backend reply line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    Stored,
    Value,
    End,
    Error,
    ClientError,
    ServerError,
    Other,
}

impl ReplyKind {
    /// Classifies a complete reply line by its prefix.
    pub fn classify(line: &[u8]) -> Self {
        if line.starts_with(b"STORED") {
            ReplyKind::Stored
        } else if line.starts_with(b"VALUE") {
            ReplyKind::Value
        } else if line.starts_with(b"END") {
            ReplyKind::End
        } else if line.starts_with(b"ERROR") {
            ReplyKind::Error
        } else if line.starts_with(b"CLIENT_ERROR") {
            ReplyKind::ClientError
        } else if line.starts_with(b"SERVER_ERROR") {
            ReplyKind::ServerError
        } else {
            ReplyKind::Other
        }
    }

    /// Whether this line is part of a successful reply.
    pub fn is_ok(&self) -> bool {
        matches!(self, ReplyKind::Stored | ReplyKind::Value | ReplyKind::End)
    }

    /// A `VALUE` line announces a data block; every other kind terminates
    /// the batch.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ReplyKind::Value)
    }
}

/// One parsed backend reply line plus its optional data block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyUnit {
    pub line: Bytes,
    pub data: Bytes,
    pub kind: ReplyKind,
}

impl ReplyUnit {
    /// Bytes this unit occupied on the wire.
    pub fn wire_len(&self) -> usize {
        self.line.len() + self.data.len()
    }

    /// The reply line as text, for logging.
    pub fn line_text(&self) -> String {
        String::from_utf8_lossy(&self.line).trim_end().to_string()
    }
}

/// Splits a protocol line into whitespace-separated fields, ignoring the
/// trailing CRLF.
pub fn split_fields(line: &[u8]) -> impl Iterator<Item = &[u8]> {
    line.split(|&b| b == b' ' || b == b'\r' || b == b'\n')
        .filter(|f| !f.is_empty())
}

fn parse_usize(field: &[u8]) -> Option<usize> {
    if field.is_empty() {
        return None;
    }
    let mut n: usize = 0;
    for &b in field {
        if !b.is_ascii_digit() {
            return None;
        }
        n = n.checked_mul(10)?.checked_add((b - b'0') as usize)?;
    }
    Some(n)
}

/// Payload length declared by a client `set` line, including the trailing
/// CRLF. `None` if the bytes field is missing or not a number.
pub fn set_payload_len(line: &[u8]) -> Option<usize> {
    parse_usize(split_fields(line).nth(SET_BYTES_FIELD)?).map(|n| n + 2)
}

/// Payload length declared by a backend `VALUE` line, including the
/// trailing CRLF. `None` if the bytes field is missing or not a number.
pub fn value_payload_len(line: &[u8]) -> Option<usize> {
    parse_usize(split_fields(line).nth(VALUE_BYTES_FIELD)?).map(|n| n + 2)
}
