//! Client Request Framing
//!
//! Incremental state machine that turns the byte stream arriving from one
//! client into complete [`Request`]s:
//!
//! ```text
//!          line incomplete                     payload incomplete
//!         ┌──────────────┐                    ┌──────────────┐
//!         ▼              │                    ▼              │
//!      ┌──────┐ LF seen  │   set with bytes ┌──────┐         │
//!  ──> │ Line │──────────┴────────────────> │ Data │─────────┘
//!      └──────┘                             └──────┘
//!         │  get / unknown / malformed set     │ payload complete
//!         └────────────> Request <─────────────┘
//! ```
//!
//! The decoder never copies: the request line and the payload are split out
//! of the read buffer as `Bytes`. Handing out an owned [`Request`] leaves
//! the decoder immediately ready for the next request, so parsing of
//! request N+1 can start while request N is still queued or being served.
//!
//! Contract: the caller loops `while let Some(request) = decode(&mut buf)?`
//! after every read, so all bytes delivered by one read event are consumed
//! before the next await.

use crate::protocol::types::{set_payload_len, Request, Verb};
use crate::protocol::ProtocolError;
use bytes::{Bytes, BytesMut};

#[derive(Debug)]
enum DecodeState {
    /// Collecting a request line up to its LF.
    Line,
    /// Collecting `data_len` payload bytes of a `set`.
    Data { line: Bytes, data_len: usize },
}

/// Incremental decoder for client requests.
#[derive(Debug)]
pub struct RequestDecoder {
    state: DecodeState,
    max_line: usize,
    max_payload: usize,
}

impl RequestDecoder {
    /// Creates a decoder with the configured line and payload bounds.
    pub fn new(max_line: usize, max_payload: usize) -> Self {
        Self {
            state: DecodeState::Line,
            max_line,
            max_payload,
        }
    }

    /// True while no bytes of a new request have been framed yet.
    pub fn is_idle(&self) -> bool {
        matches!(self.state, DecodeState::Line)
    }

    /// Attempts to frame one complete request out of `buf`.
    ///
    /// Returns `Ok(None)` when more bytes are needed. Bytes of a completed
    /// request are consumed from `buf`; partial lines are left in place.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Request>, ProtocolError> {
        loop {
            match &self.state {
                DecodeState::Line => {
                    let Some(pos) = buf.iter().position(|&b| b == b'\n') else {
                        if buf.len() > self.max_line {
                            return Err(ProtocolError::LineTooLong {
                                size: buf.len(),
                                max: self.max_line,
                            });
                        }
                        return Ok(None);
                    };

                    let line = buf.split_to(pos + 1).freeze();
                    let verb = Verb::classify(&line);
                    if verb != Verb::Set {
                        return Ok(Some(Request {
                            line,
                            verb,
                            data: Bytes::new(),
                            data_len: 0,
                        }));
                    }

                    match set_payload_len(&line) {
                        Some(data_len) => {
                            if data_len > self.max_payload {
                                return Err(ProtocolError::PayloadTooLarge {
                                    size: data_len,
                                    max: self.max_payload,
                                });
                            }
                            self.state = DecodeState::Data { line, data_len };
                        }
                        None => {
                            // bytes field missing or unparsable: complete
                            // right away, the worker reports a client
                            // request error for data_len == 0
                            return Ok(Some(Request {
                                line,
                                verb: Verb::Set,
                                data: Bytes::new(),
                                data_len: 0,
                            }));
                        }
                    }
                }

                DecodeState::Data { data_len, .. } => {
                    let data_len = *data_len;
                    if buf.len() < data_len {
                        return Ok(None);
                    }

                    let data = buf.split_to(data_len).freeze();
                    let DecodeState::Data { line, .. } =
                        std::mem::replace(&mut self.state, DecodeState::Line)
                    else {
                        unreachable!();
                    };
                    return Ok(Some(Request {
                        line,
                        verb: Verb::Set,
                        data,
                        data_len,
                    }));
                }
            }
        }
    }
}
