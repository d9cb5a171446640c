//! Memcached ASCII Protocol Framing
//!
//! This module implements the subset of the memcached text protocol the
//! proxy speaks on both of its sides:
//!
//! - `client`: frames incoming client requests (`get`, `set`, anything else
//!   is classified as unknown) with an incremental state machine
//! - `backend`: frames backend reply lines (`VALUE`, `STORED`, `END` and the
//!   error family) and groups them into one batch per operation
//! - `types`: the shared request/reply data types and header field helpers
//!
//! Both decoders work the way the rest of the crate reads from sockets:
//! bytes accumulate in a caller-owned `BytesMut`, and the decoder is called
//! in a loop until it reports that it needs more data. Framing never copies
//! payload bytes; completed lines and data blocks are split out of the read
//! buffer as cheap `Bytes` handles.

pub mod backend;
pub mod client;
pub mod types;

// Re-export commonly used types for convenience
pub use backend::{ReplyBatch, ReplyDecoder};
pub use client::RequestDecoder;
pub use types::{ReplyKind, ReplyUnit, Request, Verb, CRLF};

use thiserror::Error;

/// Errors that can occur while framing protocol data.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ProtocolError {
    /// A request line exceeded the configured buffer size
    #[error("request line too long: {size} bytes (max: {max})")]
    LineTooLong { size: usize, max: usize },

    /// A declared payload exceeded the configured buffer size
    #[error("payload too large: {size} bytes (max: {max})")]
    PayloadTooLarge { size: usize, max: usize },
}
