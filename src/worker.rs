//! The Worker Pool
//!
//! Each worker owns one persistent connection to every backend and serves
//! one job at a time, popped from the shared queue. Because a backend
//! connection belongs to exactly one worker, a worker's request/response
//! exchange on it can never interleave with anyone else's and needs no
//! locking.
//!
//! Dispatch per job kind:
//!
//! - direct get: the whole request goes to one backend, chosen by this
//!   worker's rotating cursor, and the response is forwarded verbatim
//! - sharded get: the key list is split per the shard table, one
//!   sub-request per backend starting at the cursor; responses are
//!   reassembled in dispatch order, keeping only the last terminal line
//! - set: replicated to every backend; success only if each one answers
//!   with a single `STORED`
//! - unknown: logged and dropped without a reply
//!
//! The cursor advances by the number of backends contacted, so load spreads
//! evenly across backends regardless of the workload mix. The client's
//! write half is locked before the first backend send; holding it across
//! the whole exchange is what serializes replies per client.
//!
//! Backend I/O failure is fatal to the worker (the connection state is
//! unknowable); a best-effort error line goes to the client and the worker
//! exits. Client I/O failure only loses that client.

use crate::config::ProxyConfig;
use crate::connection::{BackendConn, ClientWriter, ConnectionError};
use crate::job::{BackendUse, Job, JobKind, JobStatus};
use crate::protocol::{ReplyKind, ReplyUnit, CRLF};
use crate::queue::JobQueue;
use crate::shard::ShardTable;
use crate::stats::ReportSink;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Fatal worker faults.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// I/O on a backend connection failed; its state is unknown.
    #[error("backend {backend}: {source}")]
    Backend {
        backend: usize,
        source: ConnectionError,
    },
}

/// One worker: a slot in the pool with its own backend connections.
#[derive(Debug)]
pub struct Worker {
    id: usize,
    config: Arc<ProxyConfig>,
    table: Arc<ShardTable>,
    queue: Arc<JobQueue>,
    sink: ReportSink,
    backends: Vec<BackendConn>,
    cursor: usize,
}

impl Worker {
    /// Connects this worker to every backend. Startup fails if any backend
    /// is unreachable.
    pub async fn connect(
        id: usize,
        config: Arc<ProxyConfig>,
        table: Arc<ShardTable>,
        queue: Arc<JobQueue>,
        sink: ReportSink,
    ) -> Result<Self, ConnectionError> {
        let mut backends = Vec::with_capacity(config.backend_count());
        for (i, addr) in config.backends.iter().enumerate() {
            backends.push(BackendConn::connect(i, addr, &config).await?);
        }
        let cursor = id % config.backend_count();
        Ok(Self {
            id,
            config,
            table,
            queue,
            sink,
            backends,
            cursor,
        })
    }

    /// Serves jobs until the queue is closed and drained.
    pub async fn run(mut self) {
        let mut served: u64 = 0;
        while let Some(mut job) = self.queue.pop().await {
            job.mark_dequeued();
            match self.process(&mut job).await {
                Ok(()) => {
                    served += 1;
                    self.finish(job);
                }
                Err(e) => {
                    error!(worker = self.id, error = %e, "backend connection lost, worker stopping");
                    job.status = JobStatus::ServerSendError;
                    let client = Arc::clone(&job.client);
                    let mut writer = client.writer().await;
                    send_error_line(&mut writer, &mut job, None).await;
                    drop(writer);
                    self.finish(job);
                    return;
                }
            }
        }
        info!(worker = self.id, jobs = served, "worker stopped");
    }

    /// Serves one job end to end, including the client reply. Only fatal
    /// backend faults propagate.
    async fn process(&mut self, job: &mut Job) -> Result<(), WorkerError> {
        if job.kind == JobKind::Unknown {
            // logged and counted as a client request error, but no reply
            // bytes at all
            warn!(
                worker = self.id,
                client = job.client.id,
                line = %job.request.line_text(),
                "unknown request dropped without reply"
            );
            job.status = JobStatus::ClientRequestError;
            return Ok(());
        }

        // the reply slot is claimed before anything is sent upstream, so
        // replies to one client can never interleave
        let client = Arc::clone(&job.client);
        let mut writer = client.writer().await;
        if writer.is_closed() {
            job.status = JobStatus::ClientSendError;
            return Ok(());
        }

        match job.kind {
            JobKind::DirectGet => self.direct_get(&mut writer, job).await?,
            JobKind::ShardedGet => self.sharded_get(&mut writer, job).await?,
            JobKind::Set => self.replicate_set(&mut writer, job).await?,
            JobKind::Unknown => unreachable!(),
        }
        Ok(())
    }

    async fn direct_get(
        &mut self,
        writer: &mut ClientWriter,
        job: &mut Job,
    ) -> Result<(), WorkerError> {
        // the max-keys bound only limits the shard table; a direct get is
        // forwarded whole, so any non-empty key list goes through
        if job.n_keys == 0 {
            job.status = JobStatus::ClientRequestError;
            send_error_line(writer, job, None).await;
            return Ok(());
        }

        let idx = self.cursor % self.backends.len();
        self.cursor = self.cursor.wrapping_add(1);

        let expected = job.n_keys + 1;
        let conn = &mut self.backends[idx];
        conn.send_request(&job.request.line, &[], expected)
            .await
            .map_err(|source| WorkerError::Backend { backend: idx, source })?;
        conn.read_batch()
            .await
            .map_err(|source| WorkerError::Backend { backend: idx, source })?;

        job.backends[idx] = BackendUse {
            used: true,
            keys: job.n_keys,
            rtt: conn.rtt(),
            bytes: conn.batch().wire_len(),
        };

        let batch = self.backends[idx].batch();
        job.get_requested = job.n_keys;
        if !batch.all_ok {
            job.status = JobStatus::ServerReplyError;
            let unit = batch.error.clone();
            send_error_line(writer, job, unit.as_ref()).await;
            return Ok(());
        }

        job.get_misses = job.n_keys.saturating_sub(batch.hits());
        writer.write_start();
        for unit in &batch.units {
            writer.write(&unit.line);
            writer.write(&unit.data);
        }
        writer.write_end();
        drain_reply(writer, job).await;
        Ok(())
    }

    async fn sharded_get(
        &mut self,
        writer: &mut ClientWriter,
        job: &mut Job,
    ) -> Result<(), WorkerError> {
        if job.n_keys == 0 || job.n_keys > self.config.max_keys {
            job.status = JobStatus::ClientRequestError;
            send_error_line(writer, job, None).await;
            return Ok(());
        }

        // compose one sub-request per shard slice before any I/O
        let slices = self.table.slices(job.n_keys);
        let lines: Vec<Vec<u8>> = {
            let keys: Vec<&[u8]> = job.request.keys().collect();
            slices
                .iter()
                .map(|range| {
                    let mut line = Vec::with_capacity(64);
                    line.extend_from_slice(b"get");
                    for key in &keys[range.begin..range.end] {
                        line.push(b' ');
                        line.extend_from_slice(key);
                    }
                    line.extend_from_slice(CRLF);
                    line
                })
                .collect()
        };
        let key_counts: Vec<usize> = slices.iter().map(|r| r.len()).collect();
        let contacted: Vec<usize> = (0..lines.len())
            .map(|i| (self.cursor + i) % self.backends.len())
            .collect();
        self.cursor = self.cursor.wrapping_add(lines.len());

        // fan out all sub-requests, then fan in the responses in the same
        // order
        for (slot, &idx) in contacted.iter().enumerate() {
            self.backends[idx]
                .send_request(&lines[slot], &[], key_counts[slot] + 1)
                .await
                .map_err(|source| WorkerError::Backend { backend: idx, source })?;
        }
        for (slot, &idx) in contacted.iter().enumerate() {
            let conn = &mut self.backends[idx];
            conn.read_batch()
                .await
                .map_err(|source| WorkerError::Backend { backend: idx, source })?;
            job.backends[idx] = BackendUse {
                used: true,
                keys: key_counts[slot],
                rtt: conn.rtt(),
                bytes: conn.batch().wire_len(),
            };
        }

        job.get_requested = job.n_keys;
        if let Some(&idx) = contacted
            .iter()
            .find(|&&idx| !self.backends[idx].batch().all_ok)
        {
            job.status = JobStatus::ServerReplyError;
            let unit = self.backends[idx].batch().error.clone();
            send_error_line(writer, job, unit.as_ref()).await;
            return Ok(());
        }

        // reassemble: values from every batch, the terminal line only from
        // the last one
        let mut hits = 0;
        writer.write_start();
        for (slot, &idx) in contacted.iter().enumerate() {
            let batch = self.backends[idx].batch();
            hits += batch.hits();
            let last_slot = slot + 1 == contacted.len();
            for unit in &batch.units {
                if unit.kind.is_terminal() && !last_slot {
                    continue;
                }
                writer.write(&unit.line);
                writer.write(&unit.data);
            }
        }
        writer.write_end();

        job.get_misses = job.n_keys.saturating_sub(hits);
        drain_reply(writer, job).await;
        Ok(())
    }

    async fn replicate_set(
        &mut self,
        writer: &mut ClientWriter,
        job: &mut Job,
    ) -> Result<(), WorkerError> {
        if job.request.data_len == 0 {
            // the bytes field never parsed, there is no payload to store
            job.status = JobStatus::ClientRequestError;
            send_error_line(writer, job, None).await;
            return Ok(());
        }

        let n = self.backends.len();
        self.cursor = self.cursor.wrapping_add(n);

        for idx in 0..n {
            self.backends[idx]
                .send_request(&job.request.line, &job.request.data, 1)
                .await
                .map_err(|source| WorkerError::Backend { backend: idx, source })?;
        }
        for idx in 0..n {
            let conn = &mut self.backends[idx];
            conn.read_batch()
                .await
                .map_err(|source| WorkerError::Backend { backend: idx, source })?;
            job.backends[idx] = BackendUse {
                used: true,
                keys: 1,
                rtt: conn.rtt(),
                bytes: conn.batch().wire_len(),
            };
        }

        // success means every backend confirmed with exactly one STORED
        let failed = (0..n).find(|&idx| {
            let batch = self.backends[idx].batch();
            batch.units.len() != 1 || batch.units[0].kind != ReplyKind::Stored
        });
        if let Some(idx) = failed {
            job.status = JobStatus::ServerReplyError;
            // without a backend error line to forward the client gets the
            // canned server-reply line, never a non-error unit
            let unit = self.backends[idx].batch().error.clone();
            send_error_line(writer, job, unit.as_ref()).await;
            return Ok(());
        }

        writer.write_start();
        writer.write(&self.backends[0].batch().units[0].line);
        writer.write_end();
        drain_reply(writer, job).await;
        Ok(())
    }

    fn finish(&self, mut job: Job) {
        let now = Instant::now();
        job.finished = Some(now);
        job.client.set_last_finished(now);
        self.sink.emit(job.into_report(self.id));
    }
}

/// Writes the error reply for a failed job: the offending backend line
/// verbatim when there is one, the status's canned line otherwise.
async fn send_error_line(writer: &mut ClientWriter, job: &mut Job, unit: Option<&ReplyUnit>) {
    if writer.is_closed() {
        return;
    }
    writer.write_start();
    match unit {
        Some(unit) => {
            writer.write(&unit.line);
            if !unit.line.ends_with(b"\n") {
                writer.write(CRLF);
            }
        }
        None => match job.status.wire_line() {
            Some(line) => writer.write(line),
            None => {
                writer.write_end();
                return;
            }
        },
    }
    writer.write_end();
    drain_reply(writer, job).await;
}

/// Drains the composed reply; a client write failure downgrades the job to
/// a client send error and poisons the connection's write side.
async fn drain_reply(writer: &mut ClientWriter, job: &mut Job) {
    match writer.drain().await {
        Ok(n) => job.client_bytes = n,
        Err(e) => {
            debug!(client = job.client.id, error = %e, "client reply failed");
            writer.mark_closed();
            job.status = JobStatus::ClientSendError;
        }
    }
}
