//! Two-Phase Shutdown
//!
//! Stopping the proxy must not lose accepted work, so teardown happens in
//! two phases:
//!
//! 1. `prepare_stop`: the shutdown signal flips, which stops the accept
//!    loop and the per-client readers, and the queue is closed so nothing
//!    new can be enqueued. Workers keep draining what is already queued;
//!    each one exits when the queue hands it `None`. The phase ends when
//!    every worker and the listener have joined.
//! 2. `stop`: with every worker gone, the last report sink drops, the
//!    stats collector logs its final summary and exits, and its result is
//!    returned.
//!
//! Joining the task handles doubles as the wait group; there is no
//! separate completion counter.

use crate::queue::JobQueue;
use crate::stats::Summary;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Holds the shutdown signal and the handles of every long-lived task.
#[derive(Debug)]
pub struct Coordinator {
    shutdown_tx: watch::Sender<bool>,
    listener: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
    collector: Option<JoinHandle<Summary>>,
}

impl Coordinator {
    pub fn new(
        shutdown_tx: watch::Sender<bool>,
        listener: JoinHandle<()>,
        workers: Vec<JoinHandle<()>>,
        collector: JoinHandle<Summary>,
    ) -> Self {
        Self {
            shutdown_tx,
            listener: Some(listener),
            workers,
            collector: Some(collector),
        }
    }

    /// Phase one: stop intake and wait until all accepted work is served.
    pub async fn prepare_stop(&mut self, queue: &JobQueue) {
        info!(queued = queue.len(), "shutdown: stopping intake");
        if self.shutdown_tx.send(true).is_err() {
            warn!("shutdown signal had no receivers");
        }
        queue.close();

        for (i, handle) in self.workers.drain(..).enumerate() {
            if let Err(e) = handle.await {
                warn!(worker = i, error = %e, "worker task join failed");
            }
        }
        if let Some(listener) = self.listener.take() {
            if let Err(e) = listener.await {
                warn!(error = %e, "listener task join failed");
            }
        }
        info!("shutdown: all workers and the listener stopped");
    }

    /// Phase two: wait for the stats collector's final summary.
    pub async fn stop(mut self) -> Summary {
        match self.collector.take() {
            Some(collector) => match collector.await {
                Ok(summary) => summary,
                Err(e) => {
                    warn!(error = %e, "stats collector join failed");
                    Summary::default()
                }
            },
            None => Summary::default(),
        }
    }
}
