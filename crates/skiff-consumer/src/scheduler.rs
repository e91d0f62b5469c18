use std::collections::hash_map::DefaultHasher;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::panic::AssertUnwindSafe;
use std::sync::{Mutex, PoisonError, RwLock};

use futures::FutureExt;
use futures::future::BoxFuture;
use skiff_core::{ConsumerError, QueueId};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

type Job = BoxFuture<'static, ()>;

/// Fixed pool of consume workers.
///
/// Every queue is pinned to one worker, so jobs of a queue run one at a time in
/// submission order while different queues spread across the pool.
pub struct Scheduler {
    senders: RwLock<Vec<mpsc::UnboundedSender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    worker_count: usize,
}

impl Scheduler {
    /// Spawns the workers; must be called inside a Tokio runtime.
    pub fn new(worker_count: usize) -> Self {
        let worker_count = worker_count.max(1);
        let mut senders = Vec::with_capacity(worker_count);
        let mut workers = Vec::with_capacity(worker_count);

        for index in 0..worker_count {
            let (tx, rx) = mpsc::unbounded_channel::<Job>();
            senders.push(tx);
            workers.push(tokio::spawn(run_worker(index, rx)));
        }

        Self {
            senders: RwLock::new(senders),
            workers: Mutex::new(workers),
            worker_count,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    fn worker_for(&self, queue: &QueueId) -> usize {
        let mut hasher = DefaultHasher::new();
        queue.hash(&mut hasher);
        (hasher.finish() % self.worker_count as u64) as usize
    }

    /// Queue `job` behind every job previously submitted for `queue`.
    pub fn submit<F>(&self, queue: &QueueId, job: F) -> Result<(), ConsumerError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let senders = self.senders.read().unwrap_or_else(PoisonError::into_inner);
        let sender = senders
            .get(self.worker_for(queue))
            .ok_or(ConsumerError::ShuttingDown)?;
        sender
            .send(job.boxed())
            .map_err(|_| ConsumerError::ShuttingDown)
    }

    /// Stop accepting jobs and wait until every queued job has run.
    pub async fn shutdown(&self) {
        self.senders
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();

        let workers: Vec<_> = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for worker in workers {
            let _ = worker.await;
        }
        info!(workers = self.worker_count, "Scheduler drained");
    }
}

async fn run_worker(index: usize, mut rx: mpsc::UnboundedReceiver<Job>) {
    debug!(worker = index, "Scheduler worker started");
    while let Some(job) = rx.recv().await {
        if AssertUnwindSafe(job).catch_unwind().await.is_err() {
            error!(worker = index, "Consume job panicked");
        }
    }
    debug!(worker = index, "Scheduler worker stopped");
}
