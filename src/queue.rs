//! The Job Queue
//!
//! Single synchronization point between the listener and the worker pool.
//! The listener pushes framed requests as jobs; any free worker pops the
//! next one. FIFO, unbounded, multi-producer multi-consumer.
//!
//! Built from an unbounded mpsc channel whose receiver sits behind an async
//! mutex shared by all workers. Waiting for the mutex and waiting in
//! `recv()` both count as idle time, so the idle-worker gauge covers every
//! worker currently parked on the queue.
//!
//! `close()` drops the sender half. Workers then drain whatever is still
//! queued and get `None` from [`JobQueue::pop`] once the queue is empty,
//! which is their signal to exit. This ordering is what makes the two-phase
//! shutdown lossless: intake stops first, queued jobs are still served.

use crate::job::Job;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex as StdMutex;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;

/// FIFO queue of pending jobs shared by the listener and all workers.
#[derive(Debug)]
pub struct JobQueue {
    tx: StdMutex<Option<UnboundedSender<Job>>>,
    rx: Mutex<UnboundedReceiver<Job>>,
    depth: AtomicUsize,
    idle: AtomicUsize,
}

impl JobQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx: StdMutex::new(Some(tx)),
            rx: Mutex::new(rx),
            depth: AtomicUsize::new(0),
            idle: AtomicUsize::new(0),
        }
    }

    /// Enqueues a job. Returns `false` when the queue has been closed; the
    /// caller owns the rejected job again and decides what to do with it.
    pub fn push(&self, job: Job) -> bool {
        let guard = match self.tx.lock() {
            Ok(guard) => guard,
            Err(_) => return false,
        };
        match guard.as_ref() {
            Some(tx) => {
                // counted before the send: a consumer may pop the job the
                // instant it is sent, and its decrement must never observe
                // a depth of zero
                self.depth.fetch_add(1, Ordering::Relaxed);
                if tx.send(job).is_ok() {
                    true
                } else {
                    self.depth.fetch_sub(1, Ordering::Relaxed);
                    false
                }
            }
            None => false,
        }
    }

    /// Waits for the next job. Returns `None` once the queue is closed and
    /// fully drained.
    pub async fn pop(&self) -> Option<Job> {
        let _idle = IdleGuard::new(&self.idle);
        let mut rx = self.rx.lock().await;
        let job = rx.recv().await;
        if job.is_some() {
            self.depth.fetch_sub(1, Ordering::Relaxed);
        }
        job
    }

    /// Stops intake. Already queued jobs remain poppable.
    pub fn close(&self) {
        if let Ok(mut guard) = self.tx.lock() {
            guard.take();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.lock().map(|guard| guard.is_none()).unwrap_or(true)
    }

    /// Current number of queued jobs.
    pub fn len(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of workers currently parked waiting for a job.
    pub fn idle_workers(&self) -> usize {
        self.idle.load(Ordering::Relaxed)
    }
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

struct IdleGuard<'a> {
    counter: &'a AtomicUsize,
}

impl<'a> IdleGuard<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self { counter }
    }
}

impl Drop for IdleGuard<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::tests::job_for_line;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = JobQueue::new();
        assert!(queue.push(job_for_line(b"get a\r\n").await));
        assert!(queue.push(job_for_line(b"get b\r\n").await));
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.pop().await.unwrap().request.line_text(), "get a");
        assert_eq!(queue.pop().await.unwrap().request.line_text(), "get b");
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_close_rejects_push_but_keeps_queued_jobs() {
        let queue = JobQueue::new();
        assert!(queue.push(job_for_line(b"get a\r\n").await));
        queue.close();
        assert!(!queue.push(job_for_line(b"get b\r\n").await));

        assert!(queue.pop().await.is_some());
        assert!(queue.pop().await.is_none());
    }

    #[tokio::test]
    async fn test_pop_wakes_a_waiting_consumer() {
        let queue = Arc::new(JobQueue::new());
        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop().await })
        };

        // let the consumer park on the empty queue first
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(queue.idle_workers(), 1);

        assert!(queue.push(job_for_line(b"get a\r\n").await));
        let job = consumer.await.unwrap().unwrap();
        assert_eq!(job.request.line_text(), "get a");
        assert_eq!(queue.idle_workers(), 0);
    }

    #[tokio::test]
    async fn test_depth_never_wraps_with_an_eager_consumer() {
        // a consumer parked in pop() can take a job the moment it is sent;
        // the depth gauge must never be observable below zero
        let queue = Arc::new(JobQueue::new());
        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                let mut popped = 0u32;
                while queue.pop().await.is_some() {
                    popped += 1;
                }
                popped
            })
        };

        for i in 0..50 {
            let line = format!("get key{i}\r\n");
            assert!(queue.push(job_for_line(line.as_bytes()).await));
            tokio::task::yield_now().await;
            assert!(queue.len() < 1000, "depth counter wrapped below zero");
        }

        queue.close();
        assert_eq!(consumer.await.unwrap(), 50);
        assert_eq!(queue.len(), 0);
    }

    #[tokio::test]
    async fn test_each_job_is_popped_exactly_once() {
        let queue = Arc::new(JobQueue::new());
        for i in 0..100 {
            let line = format!("get key{i}\r\n");
            assert!(queue.push(job_for_line(line.as_bytes()).await));
        }
        queue.close();

        let mut consumers = Vec::new();
        for _ in 0..4 {
            let queue = Arc::clone(&queue);
            consumers.push(tokio::spawn(async move {
                let mut seen = Vec::new();
                while let Some(job) = queue.pop().await {
                    seen.push(job.request.line_text());
                }
                seen
            }));
        }

        let mut all = Vec::new();
        for consumer in consumers {
            all.extend(consumer.await.unwrap());
        }
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 100);
    }
}
