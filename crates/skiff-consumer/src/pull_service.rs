use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use skiff_core::{ConsumerError, QueueId};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

use crate::process_queue::ProcessQueue;

/// One pull cycle of a queue: where to pull from and where the messages go.
#[derive(Clone)]
pub struct PullRequest {
    pub group: String,
    pub queue: QueueId,
    pub next_offset: i64,
    pub process_queue: Arc<ProcessQueue>,
}

impl std::fmt::Debug for PullRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PullRequest")
            .field("group", &self.group)
            .field("queue", &self.queue)
            .field("next_offset", &self.next_offset)
            .finish()
    }
}

/// What the poller of a queue does after a pull.
#[derive(Debug)]
pub enum PullNext {
    Immediately(PullRequest),
    After(PullRequest, Duration),
    Stop,
}

/// Performs one pull round-trip and feeds the result to the process queue.
#[async_trait]
pub trait MessagePuller: Send + Sync {
    async fn pull(&self, request: PullRequest) -> PullNext;
}

struct Poller {
    id: u64,
    process_queue: Arc<ProcessQueue>,
    handle: JoinHandle<()>,
}

/// Keeps exactly one pull loop alive per queue.
#[derive(Clone)]
pub struct PullService {
    puller: Arc<dyn MessagePuller>,
    request_buffer_size: usize,
    pollers: Arc<DashMap<QueueId, Poller>>,
    next_poller_id: Arc<AtomicU64>,
    closed: Arc<AtomicBool>,
    shutdown_tx: Arc<watch::Sender<bool>>,
}

pub const DEFAULT_REQUEST_BUFFER_SIZE: usize = 16;

impl PullService {
    pub fn new(
        puller: Option<Arc<dyn MessagePuller>>,
        request_buffer_size: usize,
    ) -> Result<Self, ConsumerError> {
        let puller = puller.ok_or(ConsumerError::MissingCollaborator("message puller"))?;
        let request_buffer_size = if request_buffer_size == 0 {
            DEFAULT_REQUEST_BUFFER_SIZE
        } else {
            request_buffer_size
        };
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            puller,
            request_buffer_size,
            pollers: Arc::new(DashMap::new()),
            next_poller_id: Arc::new(AtomicU64::new(0)),
            closed: Arc::new(AtomicBool::new(false)),
            shutdown_tx: Arc::new(shutdown_tx),
        })
    }

    pub fn request_buffer_size(&self) -> usize {
        self.request_buffer_size
    }

    pub fn registered_count(&self) -> usize {
        self.pollers.len()
    }

    pub fn is_registered(&self, queue: &QueueId) -> bool {
        self.pollers.contains_key(queue)
    }

    /// Start a pull loop for the request's queue. A no-op returning `false`
    /// when the queue already has one for the same process queue or the
    /// service is shut down. A loop left over from an earlier ownership of
    /// the queue is aborted and replaced.
    pub fn submit_request_immediately(&self, request: PullRequest) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            debug!(queue = %request.queue, "Pull service closed, request ignored");
            return false;
        }

        let queue = request.queue.clone();
        match self.pollers.entry(queue.clone()) {
            Entry::Occupied(mut slot) => {
                if Arc::ptr_eq(&slot.get().process_queue, &request.process_queue) {
                    debug!(queue = %queue, "Pull loop already registered");
                    return false;
                }
                let stale = std::mem::replace(slot.get_mut(), self.spawn_poller(request));
                stale.handle.abort();
                debug!(queue = %queue, "Stale pull loop replaced");
                true
            }
            Entry::Vacant(slot) => {
                slot.insert(self.spawn_poller(request));
                debug!(queue = %queue, "Pull loop registered");
                true
            }
        }
    }

    fn spawn_poller(&self, request: PullRequest) -> Poller {
        let (tx, rx) = mpsc::channel(self.request_buffer_size);
        let process_queue = request.process_queue.clone();
        let queue = request.queue.clone();
        // Fresh channel with capacity >= 1.
        let _ = tx.try_send(request);

        let id = self.next_poller_id.fetch_add(1, Ordering::Relaxed);
        let handle = tokio::spawn(run_poller(
            self.puller.clone(),
            queue,
            id,
            tx,
            rx,
            self.pollers.clone(),
            self.shutdown_tx.subscribe(),
        ));
        Poller {
            id,
            process_queue,
            handle,
        }
    }

    /// Start the request's pull loop after `delay`. Same rules as
    /// [`Self::submit_request_immediately`]: a live loop of the same process
    /// queue keeps running alone.
    pub fn submit_request_later(&self, request: PullRequest, delay: Duration) {
        let service = self.clone();
        tokio::spawn(async move {
            time::sleep(delay).await;
            service.submit_request_immediately(request);
        });
    }

    /// Stop accepting requests, tear down every pull loop and clear the registrations.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(true);

        let queues: Vec<QueueId> = self.pollers.iter().map(|p| p.key().clone()).collect();
        for queue in queues {
            if let Some((_, poller)) = self.pollers.remove(&queue) {
                poller.handle.abort();
                let _ = poller.handle.await;
            }
        }
        info!("Pull service stopped");
    }
}

async fn run_poller(
    puller: Arc<dyn MessagePuller>,
    queue: QueueId,
    id: u64,
    tx: mpsc::Sender<PullRequest>,
    mut rx: mpsc::Receiver<PullRequest>,
    pollers: Arc<DashMap<QueueId, Poller>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let request = tokio::select! {
            _ = shutdown.changed() => break,
            request = rx.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };

        if request.process_queue.is_dropped() {
            debug!(queue = %queue, "Queue dropped, pull loop exits");
            break;
        }

        let next = match puller.pull(request).await {
            PullNext::Immediately(next) => next,
            PullNext::After(next, delay) => {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = time::sleep(delay) => next,
                }
            }
            PullNext::Stop => break,
        };

        if let Err(e) = tx.try_send(next) {
            warn!(queue = %queue, error = %e, "Pull request buffer full, follow-up dropped");
        }
    }

    pollers.remove_if(&queue, |_, poller| poller.id == id);
    debug!(queue = %queue, "Pull loop stopped");
}
