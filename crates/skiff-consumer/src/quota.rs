use std::sync::atomic::{AtomicUsize, Ordering};

/// Share of a topic-level budget for one queue: even split, at least 1.
/// `None` when the topic budget is unlimited or nothing is owned.
pub fn per_queue_limit(topic_limit: Option<usize>, queue_count: usize) -> Option<usize> {
    if queue_count == 0 {
        return None;
    }
    topic_limit.map(|limit| (limit / queue_count).max(1))
}

/// Per-queue flow-control limits read by the pull path.
#[derive(Debug)]
pub struct QueueQuotas {
    max_count: AtomicUsize,
    max_size: AtomicUsize,
}

impl QueueQuotas {
    pub fn new(max_count: usize, max_size: usize) -> Self {
        Self {
            max_count: AtomicUsize::new(max_count),
            max_size: AtomicUsize::new(max_size),
        }
    }

    /// Maximum buffered messages per queue.
    pub fn max_count(&self) -> usize {
        self.max_count.load(Ordering::Relaxed)
    }

    /// Maximum buffered MiB per queue.
    pub fn max_size(&self) -> usize {
        self.max_size.load(Ordering::Relaxed)
    }

    /// Re-split the topic budgets across `queue_count` owned queues.
    /// Unlimited budgets keep the current per-queue value.
    pub fn recompute(
        &self,
        topic_count: Option<usize>,
        topic_size: Option<usize>,
        queue_count: usize,
    ) {
        if let Some(count) = per_queue_limit(topic_count, queue_count) {
            self.max_count.store(count, Ordering::Relaxed);
        }
        if let Some(size) = per_queue_limit(topic_size, queue_count) {
            self.max_size.store(size, Ordering::Relaxed);
        }
    }
}
