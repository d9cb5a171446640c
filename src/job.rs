//! Jobs and Their Lifecycle Record
//!
//! A job is one framed client request travelling through the proxy,
//! together with everything needed to answer it (the client handle) and
//! everything worth knowing about how it went (timestamps, per-backend
//! usage, final status). The listener builds the job, the queue carries it,
//! exactly one worker consumes it, and `into_report` turns the finished job
//! into the flat record the stats collector logs.

use crate::connection::ClientHandle;
use crate::protocol::{Request, Verb};
use crate::stats::{JobReport, QueueSample};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// What the worker will do with a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    /// Single-key get, or multi-key get with sharding off: one backend.
    DirectGet,
    /// Multi-key get with sharding on: fan out across backends.
    ShardedGet,
    /// Replicated write: fan out to every backend.
    Set,
    /// Unrecognized verb: logged and dropped, no reply.
    Unknown,
}

impl JobKind {
    /// Picks the kind from the request verb, the key count and the
    /// configured get mode.
    pub fn classify(verb: Verb, n_keys: usize, sharded_get: bool) -> Self {
        match verb {
            Verb::Get if sharded_get && n_keys > 1 => JobKind::ShardedGet,
            Verb::Get => JobKind::DirectGet,
            Verb::Set => JobKind::Set,
            Verb::Unknown => JobKind::Unknown,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            JobKind::DirectGet => "direct_get",
            JobKind::ShardedGet => "sharded_get",
            JobKind::Set => "set",
            JobKind::Unknown => "unknown",
        }
    }
}

/// Final outcome of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Success,
    /// The request itself was unusable (e.g. a set without a parsable
    /// bytes field).
    ClientRequestError,
    /// The reply could not be written back to the client.
    ClientSendError,
    /// A request could not be written to a backend.
    ServerSendError,
    /// A backend answered with an error line.
    ServerReplyError,
    /// A fault inside the proxy itself.
    InternalError,
}

impl JobStatus {
    pub fn label(&self) -> &'static str {
        match self {
            JobStatus::Success => "success",
            JobStatus::ClientRequestError => "client_request_error",
            JobStatus::ClientSendError => "client_send_error",
            JobStatus::ServerSendError => "server_send_error",
            JobStatus::ServerReplyError => "server_reply_error",
            JobStatus::InternalError => "internal_error",
        }
    }

    /// The error line sent to the client for this status, if any. Success
    /// carries the real reply; a client send error has no one left to tell.
    pub fn wire_line(&self) -> Option<&'static [u8]> {
        match self {
            JobStatus::Success | JobStatus::ClientSendError => None,
            JobStatus::ClientRequestError => Some(b"CLIENT_ERROR Error_client_request\r\n"),
            JobStatus::ServerSendError => Some(b"SERVER_ERROR Error_server_send\r\n"),
            JobStatus::ServerReplyError => Some(b"SERVER_ERROR Error_server_reply\r\n"),
            JobStatus::InternalError => Some(b"SERVER_ERROR Error_middleware\r\n"),
        }
    }

    pub fn is_error(&self) -> bool {
        !matches!(self, JobStatus::Success)
    }
}

/// How one backend took part in serving a job.
#[derive(Debug, Clone, Copy, Default)]
pub struct BackendUse {
    pub used: bool,
    /// Keys routed to this backend (1 for a set).
    pub keys: usize,
    /// First byte sent to first byte of the response.
    pub rtt: Duration,
    /// Response bytes received from this backend.
    pub bytes: usize,
}

/// One client request in flight through the proxy.
#[derive(Debug)]
pub struct Job {
    pub request: Request,
    pub client: Arc<ClientHandle>,
    pub kind: JobKind,
    pub status: JobStatus,
    /// Keys on the request line.
    pub n_keys: usize,
    /// One slot per configured backend, filled by the worker.
    pub backends: Vec<BackendUse>,

    /// When the first byte of this request arrived.
    pub received: Instant,
    /// When the job entered the queue.
    pub enqueued: Instant,
    pub dequeued: Option<Instant>,
    pub finished: Option<Instant>,

    /// Listener time spent awaiting reads while this request accumulated.
    pub listener_wait: Duration,
    /// Gap since the previous reply to this client finished.
    pub client_gap: Duration,
    /// Queue state sampled at enqueue time, at most once per sample period.
    pub queue_sample: Option<QueueSample>,

    /// Keys requested by a get (0 for set/unknown).
    pub get_requested: usize,
    /// Keys a get did not find.
    pub get_misses: usize,
    /// Reply bytes written to the client.
    pub client_bytes: usize,
}

impl Job {
    pub fn new(
        request: Request,
        client: Arc<ClientHandle>,
        kind: JobKind,
        backend_count: usize,
        received: Instant,
    ) -> Self {
        let n_keys = request.key_count();
        Self {
            request,
            client,
            kind,
            status: JobStatus::Success,
            n_keys,
            backends: vec![BackendUse::default(); backend_count],
            received,
            enqueued: received,
            dequeued: None,
            finished: None,
            listener_wait: Duration::ZERO,
            client_gap: Duration::ZERO,
            queue_sample: None,
            get_requested: 0,
            get_misses: 0,
            client_bytes: 0,
        }
    }

    /// Stamps the instant a worker picked the job up.
    pub fn mark_dequeued(&mut self) {
        self.dequeued = Some(Instant::now());
    }

    /// Stamps completion and freezes the job into its report.
    pub fn into_report(mut self, worker: usize) -> JobReport {
        let finished = self.finished.unwrap_or_else(Instant::now);
        self.finished = Some(finished);
        let dequeued = self.dequeued.unwrap_or(finished);

        JobReport {
            worker,
            client: self.client.id,
            kind: self.kind,
            status: self.status,
            n_keys: self.n_keys,
            request_bytes: self.request.wire_len(),
            client_bytes: self.client_bytes,
            queue_wait: dequeued.saturating_duration_since(self.enqueued),
            service_time: finished.saturating_duration_since(dequeued),
            total_time: finished.saturating_duration_since(self.received),
            listener_wait: self.listener_wait,
            client_gap: self.client_gap,
            queue_sample: self.queue_sample,
            backends: self.backends,
            get_requested: self.get_requested,
            get_misses: self.get_misses,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::protocol::RequestDecoder;
    use bytes::BytesMut;
    use tokio::net::{TcpListener, TcpStream};

    /// Builds a job around a real (loopback) client connection, for tests
    /// that only need the job itself.
    pub(crate) async fn job_for_line(line: &[u8]) -> Job {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _client_side = TcpStream::connect(addr).await.unwrap();
        let (accepted, peer) = listener.accept().await.unwrap();
        let (_read_half, write_half) = accepted.into_split();

        let mut decoder = RequestDecoder::new(5120, 4098);
        let mut buf = BytesMut::from(line);
        let request = decoder.decode(&mut buf).unwrap().unwrap();
        let kind = JobKind::classify(request.verb, request.key_count(), false);
        let client = Arc::new(ClientHandle::new(1, peer, write_half, 1024));
        Job::new(request, client, kind, 3, Instant::now())
    }

    #[test]
    fn test_kind_classification() {
        assert_eq!(JobKind::classify(Verb::Get, 1, true), JobKind::DirectGet);
        assert_eq!(JobKind::classify(Verb::Get, 3, false), JobKind::DirectGet);
        assert_eq!(JobKind::classify(Verb::Get, 3, true), JobKind::ShardedGet);
        assert_eq!(JobKind::classify(Verb::Set, 1, true), JobKind::Set);
        assert_eq!(JobKind::classify(Verb::Unknown, 0, true), JobKind::Unknown);
    }

    #[test]
    fn test_status_wire_lines() {
        assert_eq!(JobStatus::Success.wire_line(), None);
        assert_eq!(JobStatus::ClientSendError.wire_line(), None);
        assert_eq!(
            JobStatus::ClientRequestError.wire_line(),
            Some(&b"CLIENT_ERROR Error_client_request\r\n"[..])
        );
        assert_eq!(
            JobStatus::ServerSendError.wire_line(),
            Some(&b"SERVER_ERROR Error_server_send\r\n"[..])
        );
        assert_eq!(
            JobStatus::ServerReplyError.wire_line(),
            Some(&b"SERVER_ERROR Error_server_reply\r\n"[..])
        );
        assert_eq!(
            JobStatus::InternalError.wire_line(),
            Some(&b"SERVER_ERROR Error_middleware\r\n"[..])
        );
    }

    #[tokio::test]
    async fn test_report_durations_are_ordered() {
        let mut job = job_for_line(b"get a b\r\n").await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        job.mark_dequeued();
        tokio::time::sleep(Duration::from_millis(5)).await;
        job.finished = Some(Instant::now());

        let report = job.into_report(0);
        assert!(report.queue_wait >= Duration::from_millis(4));
        assert!(report.service_time >= Duration::from_millis(4));
        assert!(report.total_time >= report.queue_wait + report.service_time);
        assert_eq!(report.n_keys, 2);
    }
}
