//! The process-wide emigration priority queue (spec.md §4.C "Scheduling").
//!
//! Jobs are popped by a scan-and-choose rule rather than straight FIFO: a
//! worker inspects up to the head of the queue and takes the job
//! minimizing `(migrate_order, tree_element_count)`, where `migrate_order`
//! is the job's enqueue sequence number. This keeps one huge partition
//! from blocking smaller ones queued behind it -- the same head-of-line
//! concern spec.md §4.C calls out.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::migrate::emigrator::MigrationJob;

struct QueuedJob {
    migrate_order: u64,
    job: MigrationJob,
}

/// Bounded, scan-and-choose queue of pending emigration jobs.
///
/// Grounded on the teacher's `ShutdownController` pool-plus-`watch<bool>`
/// worker shape (see [`crate::migrate::emigrator::spawn_workers`]): this
/// adds the ordering rule spec.md asks for on top of that same
/// shared-receiver worker pool, replacing what would otherwise be a plain
/// `mpsc` FIFO.
pub struct EmigrationQueue {
    jobs: Mutex<VecDeque<QueuedJob>>,
    capacity: usize,
    next_order: AtomicU64,
    notify: Notify,
}

impl EmigrationQueue {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            jobs: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            next_order: AtomicU64::new(0),
            notify: Notify::new(),
        }
    }

    /// Enqueues `job`. Fails with the job handed back if the queue is at
    /// `emigration_queue_capacity`.
    pub fn push(&self, job: MigrationJob) -> Result<(), MigrationJob> {
        let mut jobs = self.jobs.lock();
        if jobs.len() >= self.capacity {
            return Err(job);
        }
        let migrate_order = self.next_order.fetch_add(1, Ordering::Relaxed);
        jobs.push_back(QueuedJob { migrate_order, job });
        drop(jobs);
        self.notify.notify_one();
        Ok(())
    }

    /// Scans up to `scan_window` jobs from the head of the queue and
    /// removes the one minimizing `(migrate_order, tree_size(partition))`,
    /// returning it. `None` if the queue is empty.
    pub fn pop(&self, scan_window: usize, tree_size: impl Fn(&MigrationJob) -> usize) -> Option<MigrationJob> {
        let mut jobs = self.jobs.lock();
        if jobs.is_empty() {
            return None;
        }
        let window = scan_window.max(1).min(jobs.len());
        let mut best_idx = 0;
        let mut best_key = (jobs[0].migrate_order, tree_size(&jobs[0].job));
        for (idx, queued) in jobs.iter().enumerate().take(window).skip(1) {
            let key = (queued.migrate_order, tree_size(&queued.job));
            if key < best_key {
                best_key = key;
                best_idx = idx;
            }
        }
        jobs.remove(best_idx).map(|q| q.job)
    }

    /// Waits until a job is pushed (or was already waiting when this was
    /// called). Callers loop on `pop` after waking since another worker
    /// may win the race.
    pub async fn wait_for_work(&self) {
        self.notify.notified().await;
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.jobs.lock().is_empty()
    }
}
