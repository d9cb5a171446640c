//! Connections and the Compose-Then-Drain Write Path
//!
//! Every outbound message in the proxy is built the same way: `write_start`
//! resets the write buffer and its timing state, one or more `write` calls
//! append the message, `write_end` seals it, and `drain` pushes it onto the
//! socket. Sealing and draining are separate so that a reply can be
//! composed piecewise from several backend batches before a single byte
//! hits the wire, and so that the instant the first byte leaves can be
//! captured for backend round-trip measurement.
//!
//! Two connection kinds share this path:
//!
//! - [`BackendConn`]: a persistent socket to one memcached backend, owned
//!   by exactly one worker, carrying a reply decoder and RTT bookkeeping
//! - [`ClientWriter`] / [`ClientHandle`]: the write half of a client
//!   socket. The read half stays with the listener's reader task; the
//!   handle is locked by the worker holding the client's job, which is the
//!   ownership transfer the concurrency model relies on.

use crate::config::ProxyConfig;
use crate::protocol::{ProtocolError, ReplyBatch, ReplyDecoder};
use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

/// Errors on a proxy connection.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// I/O error (network issue)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Framing error in the peer's byte stream
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The peer closed the connection
    #[error("connection closed by peer")]
    PeerClosed,
}

/// Outbound message buffer implementing the three-phase write protocol.
#[derive(Debug)]
pub struct WriteBuffer {
    buf: BytesMut,
    composed: bool,
    fresh: bool,
    started: Option<Instant>,
}

impl WriteBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
            composed: false,
            fresh: false,
            started: None,
        }
    }

    /// Begins a new message: clears the buffer and prior timing state.
    pub fn write_start(&mut self) {
        self.buf.clear();
        self.composed = false;
        self.fresh = false;
        self.started = None;
    }

    /// Appends bytes to the message under composition.
    pub fn write(&mut self, bytes: &[u8]) {
        debug_assert!(!self.composed, "write() after write_end()");
        self.buf.extend_from_slice(bytes);
    }

    /// Seals the message and marks it fresh so the next drain records the
    /// send start instant.
    pub fn write_end(&mut self) {
        self.composed = true;
        self.fresh = true;
    }

    /// True once a sealed message is waiting to be drained.
    pub fn has_pending(&self) -> bool {
        self.composed && !self.buf.is_empty()
    }

    pub fn pending_len(&self) -> usize {
        if self.composed {
            self.buf.len()
        } else {
            0
        }
    }

    /// Instant the current message first touched the socket.
    pub fn started(&self) -> Option<Instant> {
        self.started
    }

    /// Flushes the sealed message to `stream`, returning the number of
    /// bytes written. A no-op unless `write_end` was called.
    pub async fn drain<W: AsyncWrite + Unpin>(
        &mut self,
        stream: &mut W,
    ) -> std::io::Result<usize> {
        if !self.composed {
            return Ok(0);
        }
        if self.fresh {
            self.started = Some(Instant::now());
            self.fresh = false;
        }
        let len = self.buf.len();
        stream.write_all(&self.buf).await?;
        stream.flush().await?;
        self.buf.clear();
        self.composed = false;
        Ok(len)
    }
}

/// A persistent connection from one worker to one backend.
#[derive(Debug)]
pub struct BackendConn {
    pub id: usize,
    addr: String,
    stream: TcpStream,
    rx: BytesMut,
    decoder: ReplyDecoder,
    out: WriteBuffer,
    replied_at: Option<Instant>,
    last_rtt: Duration,
}

impl BackendConn {
    /// Connects to the backend at `addr`. Called once per worker per
    /// backend at startup; the connection is held for the process lifetime.
    pub async fn connect(id: usize, addr: &str, config: &ProxyConfig) -> Result<Self, ConnectionError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        debug!(backend = id, addr = %addr, "backend connection established");
        Ok(Self {
            id,
            addr: addr.to_string(),
            stream,
            rx: BytesMut::with_capacity(config.reply_buffer_size()),
            decoder: ReplyDecoder::new(config.reply_buffer_size(), config.request_buffer_size()),
            out: WriteBuffer::new(config.request_buffer_size()),
            replied_at: None,
            last_rtt: Duration::ZERO,
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Composes and sends one request. `expected_units` is the largest
    /// number of reply units this request should produce (keys + terminal
    /// for a get, 1 for a set).
    pub async fn send_request(
        &mut self,
        line: &[u8],
        payload: &[u8],
        expected_units: usize,
    ) -> Result<usize, ConnectionError> {
        self.decoder.expect_units(expected_units);
        self.replied_at = None;

        self.out.write_start();
        self.out.write(line);
        if !payload.is_empty() {
            self.out.write(payload);
        }
        self.out.write_end();
        Ok(self.out.drain(&mut self.stream).await?)
    }

    /// Reads until the current response's terminal unit has arrived.
    /// The batch is then available through [`Self::batch`].
    pub async fn read_batch(&mut self) -> Result<(), ConnectionError> {
        loop {
            if self.decoder.decode(&mut self.rx)? {
                let replied = self.replied_at.unwrap_or_else(Instant::now);
                self.last_rtt = self
                    .out
                    .started()
                    .map(|sent| replied.saturating_duration_since(sent))
                    .unwrap_or(Duration::ZERO);
                return Ok(());
            }

            let n = self.stream.read_buf(&mut self.rx).await?;
            if n == 0 {
                return Err(ConnectionError::PeerClosed);
            }
            if self.replied_at.is_none() {
                // first bytes of the response, RTT endpoint
                self.replied_at = Some(Instant::now());
            }
        }
    }

    /// The most recently completed response batch.
    pub fn batch(&self) -> &ReplyBatch {
        self.decoder.batch()
    }

    /// Round-trip time of the last request: first byte sent to first byte
    /// of the response.
    pub fn rtt(&self) -> Duration {
        self.last_rtt
    }
}

/// The write half of one client connection. Locked by the worker holding
/// this client's job; no other task touches it.
#[derive(Debug)]
pub struct ClientWriter {
    stream: OwnedWriteHalf,
    out: WriteBuffer,
    closed: bool,
}

impl ClientWriter {
    pub fn new(stream: OwnedWriteHalf, capacity: usize) -> Self {
        Self {
            stream,
            out: WriteBuffer::new(capacity),
            closed: false,
        }
    }

    pub fn write_start(&mut self) {
        self.out.write_start();
    }

    pub fn write(&mut self, bytes: &[u8]) {
        self.out.write(bytes);
    }

    pub fn write_end(&mut self) {
        self.out.write_end();
    }

    pub fn has_pending(&self) -> bool {
        self.out.has_pending()
    }

    pub fn pending_len(&self) -> usize {
        self.out.pending_len()
    }

    /// Flushes the composed reply to the client.
    pub async fn drain(&mut self) -> std::io::Result<usize> {
        self.out.drain(&mut self.stream).await
    }

    /// Marks the connection unusable after a client-send failure.
    pub fn mark_closed(&mut self) {
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

/// Shared handle to one client connection's write side plus the
/// per-connection completion instant used for the client gap signal.
#[derive(Debug)]
pub struct ClientHandle {
    pub id: u64,
    pub addr: SocketAddr,
    writer: Mutex<ClientWriter>,
    last_finished: StdMutex<Option<Instant>>,
}

impl ClientHandle {
    pub fn new(id: u64, addr: SocketAddr, stream: OwnedWriteHalf, capacity: usize) -> Self {
        Self {
            id,
            addr,
            writer: Mutex::new(ClientWriter::new(stream, capacity)),
            last_finished: StdMutex::new(None),
        }
    }

    /// Takes exclusive ownership of the write side for one job.
    pub async fn writer(&self) -> MutexGuard<'_, ClientWriter> {
        self.writer.lock().await
    }

    /// Records when the reply to this connection's last request finished
    /// draining. Written by the worker, read by the listener.
    pub fn set_last_finished(&self, at: Instant) {
        if let Ok(mut guard) = self.last_finished.lock() {
            *guard = Some(at);
        }
    }

    /// Time between the previous reply finishing and `now`. Approximates
    /// the client's round-trip plus think time; zero for the first request.
    pub fn gap_since_last(&self, now: Instant) -> Duration {
        self.last_finished
            .lock()
            .ok()
            .and_then(|guard| *guard)
            .map(|last| now.saturating_duration_since(last))
            .unwrap_or(Duration::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_write_buffer_three_phases() {
        let (mut tx, mut rx) = tokio::io::duplex(256);
        let mut out = WriteBuffer::new(64);

        out.write_start();
        out.write(b"get ");
        out.write(b"a b\r\n");
        assert!(!out.has_pending());
        out.write_end();
        assert!(out.has_pending());
        assert_eq!(out.pending_len(), 9);

        let written = out.drain(&mut tx).await.unwrap();
        assert_eq!(written, 9);
        assert!(!out.has_pending());
        assert!(out.started().is_some());

        let mut read = [0u8; 9];
        rx.read_exact(&mut read).await.unwrap();
        assert_eq!(&read, b"get a b\r\n");
    }

    #[tokio::test]
    async fn test_drain_without_write_end_is_a_noop() {
        let (mut tx, _rx) = tokio::io::duplex(64);
        let mut out = WriteBuffer::new(64);
        out.write_start();
        out.write(b"half composed");
        assert_eq!(out.drain(&mut tx).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_backend_conn_request_reply() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let n = socket.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"get a b\r\n");
            socket
                .write_all(b"VALUE a 0 2\r\nxy\r\nEND\r\n")
                .await
                .unwrap();
        });

        let config = ProxyConfig {
            backends: vec![addr.to_string()],
            ..ProxyConfig::default()
        };
        let mut conn = BackendConn::connect(0, &addr.to_string(), &config)
            .await
            .unwrap();

        conn.send_request(b"get a b\r\n", &[], 3).await.unwrap();
        conn.read_batch().await.unwrap();

        let batch = conn.batch();
        assert!(batch.all_ok);
        assert_eq!(batch.units.len(), 2);
        assert_eq!(batch.hits(), 1);
    }

    #[tokio::test]
    async fn test_backend_conn_peer_close_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            drop(socket);
        });

        let config = ProxyConfig {
            backends: vec![addr.to_string()],
            ..ProxyConfig::default()
        };
        let mut conn = BackendConn::connect(0, &addr.to_string(), &config)
            .await
            .unwrap();
        conn.send_request(b"get a\r\n", &[], 2).await.unwrap();
        assert!(matches!(
            conn.read_batch().await,
            Err(ConnectionError::PeerClosed) | Err(ConnectionError::Io(_))
        ));
    }
}
