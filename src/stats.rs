//! Job Reporting
//!
//! Workers never write statistics anywhere shared. When a job finishes, the
//! worker freezes it into a [`JobReport`] and sends it over an unbounded
//! channel to the single collector task; aggregation is the collector's
//! problem. The channel closing (every sink dropped during shutdown) is the
//! collector's signal to emit its final summary and exit.

use crate::job::{BackendUse, JobKind, JobStatus};
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};

/// Queue state observed at enqueue time.
#[derive(Debug, Clone, Copy)]
pub struct QueueSample {
    pub depth: usize,
    pub idle_workers: usize,
}

/// Everything worth recording about one finished job.
#[derive(Debug)]
pub struct JobReport {
    pub worker: usize,
    pub client: u64,
    pub kind: JobKind,
    pub status: JobStatus,
    pub n_keys: usize,
    pub request_bytes: usize,
    pub client_bytes: usize,
    pub queue_wait: Duration,
    pub service_time: Duration,
    pub total_time: Duration,
    pub listener_wait: Duration,
    pub client_gap: Duration,
    pub queue_sample: Option<QueueSample>,
    pub backends: Vec<BackendUse>,
    pub get_requested: usize,
    pub get_misses: usize,
}

/// Cloneable sending side of the report channel.
#[derive(Debug, Clone)]
pub struct ReportSink {
    tx: UnboundedSender<JobReport>,
}

impl ReportSink {
    pub fn emit(&self, report: JobReport) {
        if self.tx.send(report).is_err() {
            warn!("report dropped, stats collector already stopped");
        }
    }
}

/// Creates the report channel and its collector.
pub fn channel() -> (ReportSink, StatsCollector) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ReportSink { tx }, StatsCollector { rx })
}

/// Aggregate counters over the process lifetime.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Summary {
    pub jobs: u64,
    pub errors: u64,
    pub direct_gets: u64,
    pub sharded_gets: u64,
    pub sets: u64,
    pub unknown: u64,
    pub get_hits: u64,
    pub get_misses: u64,
    pub client_bytes: u64,
    pub peak_queue_depth: usize,
}

/// Receives job reports, logs each one, and keeps running totals.
#[derive(Debug)]
pub struct StatsCollector {
    rx: UnboundedReceiver<JobReport>,
}

impl StatsCollector {
    /// Consumes reports until every sink is gone, then logs and returns
    /// the summary.
    pub async fn run(mut self) -> Summary {
        let mut summary = Summary::default();

        while let Some(report) = self.rx.recv().await {
            summary.jobs += 1;
            if report.status.is_error() {
                summary.errors += 1;
            }
            match report.kind {
                JobKind::DirectGet => summary.direct_gets += 1,
                JobKind::ShardedGet => summary.sharded_gets += 1,
                JobKind::Set => summary.sets += 1,
                JobKind::Unknown => summary.unknown += 1,
            }
            if !report.status.is_error() {
                summary.get_hits += (report.get_requested - report.get_misses) as u64;
                summary.get_misses += report.get_misses as u64;
            }
            summary.client_bytes += report.client_bytes as u64;
            if let Some(sample) = report.queue_sample {
                summary.peak_queue_depth = summary.peak_queue_depth.max(sample.depth);
            }

            debug!(
                worker = report.worker,
                client = report.client,
                kind = report.kind.label(),
                status = report.status.label(),
                keys = report.n_keys,
                misses = report.get_misses,
                request_bytes = report.request_bytes,
                reply_bytes = report.client_bytes,
                queue_wait_us = report.queue_wait.as_micros() as u64,
                service_us = report.service_time.as_micros() as u64,
                total_us = report.total_time.as_micros() as u64,
                "job finished"
            );
        }

        info!(
            jobs = summary.jobs,
            errors = summary.errors,
            direct_gets = summary.direct_gets,
            sharded_gets = summary.sharded_gets,
            sets = summary.sets,
            unknown = summary.unknown,
            get_hits = summary.get_hits,
            get_misses = summary.get_misses,
            reply_bytes = summary.client_bytes,
            peak_queue_depth = summary.peak_queue_depth,
            "final statistics"
        );
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::tests::job_for_line;
    use crate::job::JobStatus;

    #[tokio::test]
    async fn test_collector_aggregates_and_exits_on_close() {
        let (sink, collector) = channel();
        let collector = tokio::spawn(collector.run());

        let mut job = job_for_line(b"get a b c\r\n").await;
        job.mark_dequeued();
        job.get_requested = 3;
        job.get_misses = 1;
        job.client_bytes = 42;
        sink.emit(job.into_report(0));

        let mut job = job_for_line(b"set k 0 0 3\r\ncab\r\n").await;
        job.mark_dequeued();
        job.status = JobStatus::ServerReplyError;
        sink.emit(job.into_report(1));

        drop(sink);
        let summary = collector.await.unwrap();
        assert_eq!(summary.jobs, 2);
        assert_eq!(summary.errors, 1);
        assert_eq!(summary.direct_gets, 1);
        assert_eq!(summary.sets, 1);
        assert_eq!(summary.get_hits, 2);
        assert_eq!(summary.get_misses, 1);
        assert_eq!(summary.client_bytes, 42);
    }
}
