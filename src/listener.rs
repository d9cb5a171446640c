//! Client Intake
//!
//! The listener owns the accept loop and, per client connection, a reader
//! task that frames requests and turns them into queued jobs. The reader
//! task keeps the read half of the socket; the write half goes into the
//! [`ClientHandle`] that travels with every job, so replies are written by
//! whichever worker serves the job.
//!
//! Per job the reader also records the intake-side timing signals: when the
//! request's first byte arrived, how long the reader spent parked in read
//! awaits while it accumulated, and the gap since the previous reply to
//! this client finished. Queue depth and idle workers are sampled at most
//! once per sample period across all connections, to keep hot paths cheap.

use crate::config::ProxyConfig;
use crate::connection::ClientHandle;
use crate::job::{Job, JobKind};
use crate::protocol::RequestDecoder;
use crate::queue::JobQueue;
use crate::stats::QueueSample;
use bytes::BytesMut;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// How often queue state is attached to an enqueued job.
const SAMPLE_PERIOD: Duration = Duration::from_millis(100);

/// Rate limiter for queue sampling, shared by all reader tasks.
#[derive(Debug)]
struct QueueSampler {
    period: Duration,
    next: StdMutex<Instant>,
}

impl QueueSampler {
    fn new(period: Duration) -> Self {
        Self {
            period,
            next: StdMutex::new(Instant::now()),
        }
    }

    fn sample(&self, queue: &JobQueue) -> Option<QueueSample> {
        let mut next = self.next.lock().ok()?;
        let now = Instant::now();
        if now < *next {
            return None;
        }
        *next = now + self.period;
        Some(QueueSample {
            depth: queue.len(),
            idle_workers: queue.idle_workers(),
        })
    }
}

/// Accept loop plus the per-connection reader tasks it spawns.
#[derive(Debug)]
pub struct Listener {
    config: Arc<ProxyConfig>,
    queue: Arc<JobQueue>,
    shutdown: watch::Receiver<bool>,
}

impl Listener {
    pub fn new(
        config: Arc<ProxyConfig>,
        queue: Arc<JobQueue>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            config,
            queue,
            shutdown,
        }
    }

    /// Accepts clients until shutdown is signalled.
    pub async fn run(mut self, socket: TcpListener) {
        let sampler = Arc::new(QueueSampler::new(SAMPLE_PERIOD));
        let mut next_id: u64 = 0;
        let mut first_conn: Option<Instant> = None;
        let mut last_conn: Option<Instant> = None;

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => break,
                accepted = socket.accept() => match accepted {
                    Ok((stream, addr)) => {
                        next_id += 1;
                        let now = Instant::now();
                        first_conn.get_or_insert(now);
                        last_conn = Some(now);
                        debug!(client = next_id, addr = %addr, "client connected");
                        tokio::spawn(serve_client(
                            Arc::clone(&self.config),
                            Arc::clone(&self.queue),
                            Arc::clone(&sampler),
                            self.shutdown.clone(),
                            next_id,
                            stream,
                        ));
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                    }
                }
            }
        }

        let accept_span = match (first_conn, last_conn) {
            (Some(first), Some(last)) => last.saturating_duration_since(first),
            _ => Duration::ZERO,
        };
        info!(
            connections = next_id,
            accept_span_ms = accept_span.as_millis() as u64,
            "listener stopped"
        );
    }
}

/// Reads one client connection until it closes, the proxy shuts down, or
/// the byte stream turns unframeable.
async fn serve_client(
    config: Arc<ProxyConfig>,
    queue: Arc<JobQueue>,
    sampler: Arc<QueueSampler>,
    mut shutdown: watch::Receiver<bool>,
    id: u64,
    stream: TcpStream,
) {
    if let Err(e) = stream.set_nodelay(true) {
        warn!(client = id, error = %e, "set_nodelay failed");
    }
    let addr = match stream.peer_addr() {
        Ok(addr) => addr,
        Err(e) => {
            warn!(client = id, error = %e, "peer address unavailable");
            return;
        }
    };
    let (mut read_half, write_half) = stream.into_split();
    let handle = Arc::new(ClientHandle::new(
        id,
        addr,
        write_half,
        config.reply_buffer_size(),
    ));

    let mut decoder = RequestDecoder::new(
        config.request_buffer_size(),
        config.max_data_size + 2,
    );
    let mut buf = BytesMut::with_capacity(config.request_buffer_size());
    // read-await time attributed to the request currently accumulating
    let mut wait = Duration::ZERO;
    let mut received: Option<Instant> = None;

    loop {
        // frame everything one read event delivered before awaiting again
        loop {
            match decoder.decode(&mut buf) {
                Ok(Some(request)) => {
                    let now = Instant::now();
                    let kind =
                        JobKind::classify(request.verb, request.key_count(), config.sharded_get);
                    let mut job = Job::new(
                        request,
                        Arc::clone(&handle),
                        kind,
                        config.backend_count(),
                        received.take().unwrap_or(now),
                    );
                    job.listener_wait = std::mem::take(&mut wait);
                    job.client_gap = handle.gap_since_last(job.received);
                    job.queue_sample = sampler.sample(&queue);
                    job.enqueued = now;
                    if !buf.is_empty() {
                        // pipelined: the next request's bytes arrived with
                        // this read
                        received = Some(now);
                    }
                    if !queue.push(job) {
                        debug!(client = id, "queue closed, dropping client");
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(client = id, error = %e, "unframeable request, closing client");
                    return;
                }
            }
        }

        let parked = Instant::now();
        let n = tokio::select! {
            _ = shutdown.changed() => return,
            read = read_half.read_buf(&mut buf) => match read {
                Ok(n) => n,
                Err(e) => {
                    debug!(client = id, error = %e, "client read failed");
                    return;
                }
            }
        };
        wait += parked.elapsed();

        if n == 0 {
            debug!(client = id, "client disconnected");
            return;
        }
        if received.is_none() {
            received = Some(Instant::now());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    async fn start_listener(
        config: ProxyConfig,
    ) -> (std::net::SocketAddr, Arc<JobQueue>, watch::Sender<bool>) {
        let socket = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let queue = Arc::new(JobQueue::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let listener = Listener::new(Arc::new(config), Arc::clone(&queue), shutdown_rx);
        tokio::spawn(listener.run(socket));
        (addr, queue, shutdown_tx)
    }

    #[tokio::test]
    async fn test_request_becomes_a_job() {
        let config = ProxyConfig {
            backends: vec!["127.0.0.1:1".into(), "127.0.0.1:2".into()],
            sharded_get: true,
            ..ProxyConfig::default()
        };
        let (addr, queue, _shutdown) = start_listener(config).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"get a b c\r\n").await.unwrap();

        let job = queue.pop().await.unwrap();
        assert_eq!(job.kind, JobKind::ShardedGet);
        assert_eq!(job.n_keys, 3);
        assert_eq!(job.backends.len(), 2);
        assert!(job.queue_sample.is_some(), "first job must carry a sample");
        assert!(job.enqueued >= job.received);
    }

    #[tokio::test]
    async fn test_pipelined_requests_become_separate_jobs() {
        let config = ProxyConfig {
            backends: vec!["127.0.0.1:1".into()],
            ..ProxyConfig::default()
        };
        let (addr, queue, _shutdown) = start_listener(config).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"get a\r\nset k 0 0 1\r\nx\r\nfoo\r\n")
            .await
            .unwrap();

        assert_eq!(queue.pop().await.unwrap().kind, JobKind::DirectGet);
        assert_eq!(queue.pop().await.unwrap().kind, JobKind::Set);
        assert_eq!(queue.pop().await.unwrap().kind, JobKind::Unknown);
    }

    #[tokio::test]
    async fn test_shutdown_stops_accepting() {
        let config = ProxyConfig {
            backends: vec!["127.0.0.1:1".into()],
            ..ProxyConfig::default()
        };
        let (addr, _queue, shutdown) = start_listener(config).await;
        shutdown.send(true).unwrap();

        // the accept loop exits; a fresh connection gets no service
        tokio::time::sleep(Duration::from_millis(20)).await;
        if let Ok(mut client) = TcpStream::connect(addr).await {
            client.write_all(b"get a\r\n").await.ok();
            let mut buf = [0u8; 8];
            // server side is gone, read sees EOF or an error
            match tokio::time::timeout(Duration::from_millis(200), client.read(&mut buf)).await {
                Ok(Ok(n)) => assert_eq!(n, 0),
                Ok(Err(_)) | Err(_) => {}
            }
        }
    }
}
