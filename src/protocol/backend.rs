//! Backend Reply Framing
//!
//! Mirror image of the client decoder for the backend side of the proxy.
//! One backend response to one forwarded operation is a finite sequence of
//! reply units: zero or more `VALUE <key> <flags> <bytes>\r\n<data>\r\n`
//! blocks followed by exactly one terminal line (`END`, `STORED` or an
//! error). Units accumulate inside the decoder; when the terminal unit
//! lands the whole batch is made available at once, together with an
//! aggregate ok flag and the first non-ok unit if any.
//!
//! The decoder keeps two batch buffers and swaps them on completion, so the
//! delivered batch stays readable (and its `Vec` reusable) while the next
//! response is already being framed. The swapped-out batch must not be
//! touched after the next completed `decode` call.

use crate::protocol::types::{value_payload_len, ReplyKind, ReplyUnit};
use crate::protocol::ProtocolError;
use bytes::{Bytes, BytesMut};
use tracing::warn;

/// One complete backend response: all units of the reply plus aggregate
/// error information.
#[derive(Debug, Default)]
pub struct ReplyBatch {
    pub units: Vec<ReplyUnit>,
    /// False as soon as any unit classified as not ok.
    pub all_ok: bool,
    /// The first non-ok unit seen, for error propagation to the client.
    pub error: Option<ReplyUnit>,
}

impl ReplyBatch {
    fn reset(&mut self) {
        self.units.clear();
        self.all_ok = true;
        self.error = None;
    }

    /// Total bytes this response occupied on the wire.
    pub fn wire_len(&self) -> usize {
        self.units.iter().map(|u| u.wire_len()).sum()
    }

    /// Number of `VALUE` units (hits) in this batch.
    pub fn hits(&self) -> usize {
        self.units.len().saturating_sub(1)
    }
}

#[derive(Debug)]
enum DecodeState {
    Line,
    Data { line: Bytes, data_len: usize },
}

/// Incremental decoder for backend responses.
#[derive(Debug)]
pub struct ReplyDecoder {
    state: DecodeState,
    current: ReplyBatch,
    ready: ReplyBatch,
    expected_units: usize,
    max_line: usize,
    max_payload: usize,
}

impl ReplyDecoder {
    pub fn new(max_line: usize, max_payload: usize) -> Self {
        let mut current = ReplyBatch::default();
        current.reset();
        let mut ready = ReplyBatch::default();
        ready.reset();
        Self {
            state: DecodeState::Line,
            current,
            ready,
            expected_units: 0,
            max_line,
            max_payload,
        }
    }

    /// Announces the number of units the next response should carry at
    /// most (keys + terminal for a get, 1 for a set). Only used for a
    /// diagnostic warning; the batch always ends at the terminal unit.
    pub fn expect_units(&mut self, expected: usize) {
        self.expected_units = expected;
    }

    /// The most recently completed batch. Valid until the next `decode`
    /// call that returns `Ok(true)`.
    pub fn batch(&self) -> &ReplyBatch {
        &self.ready
    }

    /// Frames reply bytes out of `buf`. Returns `Ok(true)` when a terminal
    /// unit completed a batch (retrievable via [`Self::batch`]), `Ok(false)`
    /// when more bytes are needed.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<bool, ProtocolError> {
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
                        return Ok(false);
                    };

                    let line = buf.split_to(pos + 1).freeze();
                    let kind = ReplyKind::classify(&line);
                    if kind == ReplyKind::Value {
                        match value_payload_len(&line) {
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
                                // VALUE line without a readable bytes field:
                                // record it as a protocol-level error unit
                                // and end the batch
                                self.push_unit(ReplyUnit {
                                    line,
                                    data: Bytes::new(),
                                    kind: ReplyKind::Other,
                                });
                                self.complete();
                                return Ok(true);
                            }
                        }
                    } else {
                        self.push_unit(ReplyUnit {
                            line,
                            data: Bytes::new(),
                            kind,
                        });
                        self.complete();
                        return Ok(true);
                    }
                }

                DecodeState::Data { data_len, .. } => {
                    let data_len = *data_len;
                    if buf.len() < data_len {
                        return Ok(false);
                    }

                    let data = buf.split_to(data_len).freeze();
                    let DecodeState::Data { line, .. } =
                        std::mem::replace(&mut self.state, DecodeState::Line)
                    else {
                        unreachable!();
                    };
                    self.push_unit(ReplyUnit {
                        line,
                        data,
                        kind: ReplyKind::Value,
                    });
                    // a VALUE unit never terminates the batch, keep framing
                }
            }
        }
    }

    fn push_unit(&mut self, unit: ReplyUnit) {
        if !unit.kind.is_ok() {
            if self.current.all_ok {
                self.current.error = Some(unit.clone());
            }
            self.current.all_ok = false;
        }
        self.current.units.push(unit);
    }

    fn complete(&mut self) {
        if self.current.units.len() > self.expected_units {
            warn!(
                units = self.current.units.len(),
                expected = self.expected_units,
                "more reply units received than expected"
            );
        }
        std::mem::swap(&mut self.current, &mut self.ready);
        self.current.reset();
        self.state = DecodeState::Line;
    }
}
