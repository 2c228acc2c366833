//! Single-consumer work queue.
//!
//! RPC handlers push [`WorkItem`]s into an unbounded FIFO channel; one
//! dedicated OS thread drains it, runs the synthetic workload for each item
//! and resolves the item's completion signal. The queue is deliberately
//! unbounded: a bounded queue would convert pressure into rejections and
//! hide the saturation the harness exists to measure, so pressure is
//! observable as queue-wait time instead.
//!
//! Each item carries five microsecond stamps (client send, server arrival,
//! enqueue, dequeue, complete) and the queue depth it saw when it was
//! enqueued. The handler and the worker write disjoint fields, so no lock
//! protects an item; counters shared across both sides are atomics.
//!
//! The consumer is an OS thread, not a runtime task: the workload busy-waits
//! by contract, and a spin loop parked on a runtime worker would distort
//! every latency the harness measures. A crash of the consumer is fatal to
//! the process; there is no retry.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use crate::clock;
use crate::workload::{self, DelaySampler, WorkloadSpec};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum QueueError {
    /// The queue has been shut down; no new work is accepted.
    #[error("work queue is closed")]
    Closed,
}

/// Immutable snapshot of a work item's server-side stamps, microseconds
/// since the process anchor. A zero field means the stamp was never taken.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timeline {
    pub arrival: i64,
    pub enqueue: i64,
    pub dequeue: i64,
    pub complete: i64,
}

impl Timeline {
    /// Queue residency of the item, if both stamps were taken.
    pub fn queue_wait(&self) -> Option<Duration> {
        (self.enqueue > 0 && self.dequeue > 0)
            .then(|| clock::ticks_between(self.enqueue, self.dequeue))
    }
}

/// Terminal resolution of a work item. Exactly one is sent per item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOutcome {
    Completed(Timeline),
    CancelledInQueue,
}

/// Caller-side cancellation switch for one queued item.
///
/// The worker reads it exactly once, at dequeue; an item that has already
/// started processing runs to completion regardless.
#[derive(Debug, Clone)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// One in-flight server-side unit of work.
#[derive(Debug)]
pub struct WorkItem {
    pub request_id: String,
    pub client_send: i64,
    pub arrival: i64,
    enqueue: i64,
    dequeue: i64,
    complete: i64,
    depth_at_enqueue: u32,
    cancelled: Arc<AtomicBool>,
    done: Option<oneshot::Sender<ItemOutcome>>,
}

impl WorkItem {
    /// Build an item plus the two handles its creator keeps: the
    /// cancellation switch and the completion receiver.
    pub fn new(
        request_id: String,
        client_send: i64,
        arrival: i64,
    ) -> (Self, CancelHandle, oneshot::Receiver<ItemOutcome>) {
        let cancelled = Arc::new(AtomicBool::new(false));
        let (done_tx, done_rx) = oneshot::channel();
        let item = Self {
            request_id,
            client_send,
            arrival,
            enqueue: 0,
            dequeue: 0,
            complete: 0,
            depth_at_enqueue: 0,
            cancelled: Arc::clone(&cancelled),
            done: Some(done_tx),
        };
        (item, CancelHandle(cancelled), done_rx)
    }

    fn resolve(&mut self, outcome: ItemOutcome) {
        if let Some(done) = self.done.take() {
            // The receiver may be gone if the client already gave up.
            let _ = done.send(outcome);
        }
    }

    fn timeline(&self) -> Timeline {
        Timeline {
            arrival: self.arrival,
            enqueue: self.enqueue,
            dequeue: self.dequeue,
            complete: self.complete,
        }
    }
}

#[derive(Debug, Default)]
struct QueueStats {
    peak_depth: AtomicUsize,
    processed: AtomicU64,
    cancelled: AtomicU64,
    max_queue_wait_us: AtomicI64,
}

/// Counters the prober snapshots and resets between concurrency levels.
pub trait QueueTelemetry: Send + Sync {
    fn snapshot(&self) -> ResourceSnapshot;
    fn reset(&self);
}

/// Point-in-time view of the queue counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub peak_queue_depth: usize,
    pub max_queue_wait: Duration,
    pub processed: u64,
    pub cancelled_in_queue: u64,
}

/// External-server mode has no visibility into the remote queue.
pub struct NoTelemetry;

impl QueueTelemetry for NoTelemetry {
    fn snapshot(&self) -> ResourceSnapshot {
        ResourceSnapshot::default()
    }

    fn reset(&self) {}
}

/// The FIFO channel, its single consumer and the shared counters.
pub struct WorkQueue {
    tx: Mutex<Option<mpsc::UnboundedSender<WorkItem>>>,
    depth: AtomicUsize,
    stats: QueueStats,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl WorkQueue {
    /// Create the queue and launch its consumer thread.
    pub fn start(spec: WorkloadSpec) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let queue = Arc::new(Self {
            tx: Mutex::new(Some(tx)),
            depth: AtomicUsize::new(0),
            stats: QueueStats::default(),
            worker: Mutex::new(None),
        });
        let handle = thread::Builder::new()
            .name("queue-worker".into())
            .spawn({
                let queue = Arc::clone(&queue);
                move || worker_loop(&queue, rx, DelaySampler::new(spec))
            })
            .expect("spawn queue worker thread");
        *queue.worker.lock().expect("queue worker lock") = Some(handle);
        queue
    }

    /// Stamp and push one item; returns the depth it saw ahead of itself.
    ///
    /// Non-blocking: the channel is unbounded, so pressure becomes wait time
    /// rather than rejection.
    pub fn enqueue(&self, mut item: WorkItem) -> Result<u32, QueueError> {
        let tx = self.tx.lock().expect("queue sender lock");
        let tx = tx.as_ref().ok_or(QueueError::Closed)?;
        item.enqueue = clock::ticks_now();
        let ahead = self.depth.fetch_add(1, Ordering::SeqCst);
        let depth = ahead as u32;
        item.depth_at_enqueue = depth;
        self.stats.peak_depth.fetch_max(ahead + 1, Ordering::SeqCst);
        if tx.send(item).is_err() {
            self.depth.fetch_sub(1, Ordering::SeqCst);
            return Err(QueueError::Closed);
        }
        Ok(depth)
    }

    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    pub fn peak_depth(&self) -> usize {
        self.stats.peak_depth.load(Ordering::SeqCst)
    }

    pub fn processed_count(&self) -> u64 {
        self.stats.processed.load(Ordering::SeqCst)
    }

    pub fn cancelled_count(&self) -> u64 {
        self.stats.cancelled.load(Ordering::SeqCst)
    }

    pub fn max_queue_wait(&self) -> Duration {
        Duration::from_micros(self.stats.max_queue_wait_us.load(Ordering::SeqCst).max(0) as u64)
    }

    /// Zero the four counters. Safe between probe levels: items already in
    /// the channel are neither drained nor reordered. Idempotent.
    pub fn reset_stats(&self) {
        self.stats.peak_depth.store(0, Ordering::SeqCst);
        self.stats.processed.store(0, Ordering::SeqCst);
        self.stats.cancelled.store(0, Ordering::SeqCst);
        self.stats.max_queue_wait_us.store(0, Ordering::SeqCst);
    }

    /// Close the producer side and give the consumer `grace` to drain.
    ///
    /// Past the grace period the thread is detached rather than joined; it
    /// exits on its own once the channel empties.
    pub fn shutdown(&self, grace: Duration) {
        self.tx.lock().expect("queue sender lock").take();
        let handle = self.worker.lock().expect("queue worker lock").take();
        if let Some(handle) = handle {
            let deadline = Instant::now() + grace;
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(5));
            }
            if handle.is_finished() {
                let _ = handle.join();
            }
        }
    }
}

impl QueueTelemetry for WorkQueue {
    fn snapshot(&self) -> ResourceSnapshot {
        ResourceSnapshot {
            peak_queue_depth: self.peak_depth(),
            max_queue_wait: self.max_queue_wait(),
            processed: self.processed_count(),
            cancelled_in_queue: self.cancelled_count(),
        }
    }

    fn reset(&self) {
        self.reset_stats();
    }
}

/// Consumer loop: runs until the producer side closes.
///
/// Cancellation is checked exactly once per item, at dequeue. An item that
/// passes that check runs to completion even if its client has since given
/// up: the synthetic work is short, and preempting it would add scheduling
/// noise to the measurements.
fn worker_loop(
    queue: &WorkQueue,
    mut rx: mpsc::UnboundedReceiver<WorkItem>,
    mut sampler: DelaySampler,
) {
    while let Some(mut item) = rx.blocking_recv() {
        queue.depth.fetch_sub(1, Ordering::SeqCst);
        if item.cancelled.load(Ordering::SeqCst) {
            queue.stats.cancelled.fetch_add(1, Ordering::SeqCst);
            item.resolve(ItemOutcome::CancelledInQueue);
            continue;
        }
        item.dequeue = clock::ticks_now();
        let wait_us = item.dequeue.saturating_sub(item.enqueue);
        queue.stats.max_queue_wait_us.fetch_max(wait_us, Ordering::SeqCst);
        workload::execute(sampler.sample());
        item.complete = clock::ticks_now();
        queue.stats.processed.fetch_add(1, Ordering::SeqCst);
        let timeline = item.timeline();
        item.resolve(ItemOutcome::Completed(timeline));
    }
}
