use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use skiff_core::{
    ConsumeStatus, ConsumerConfig, ConsumerError, MessageExt, PROPERTY_RETRY_TOPIC, QueueId,
    retry_topic,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info, warn};

use crate::collab::{ConsumeContext, MessageListener, MessageSendBack, OffsetStore};
use crate::process_queue::{ProcessQueue, ProcessQueueInfo};
use crate::scheduler::Scheduler;

/// Construction parameters of a [`ConsumeService`]. Collaborators are optional
/// here only so that a missing one is reported instead of defaulted.
#[derive(Clone)]
pub struct ConsumeServiceConfig {
    pub group: String,
    pub scheduler_workers: usize,
    pub pull_expired_interval: Duration,
    pub sweep_interval: Duration,
    pub consume_timeout: Duration,
    pub consume_batch_max_size: usize,
    pub send_back_retry_delay: Duration,
    pub max_reconsume_times: i32,
    pub message_send_back: Option<Arc<dyn MessageSendBack>>,
    pub offset_store: Option<Arc<dyn OffsetStore>>,
    pub listener: Option<Arc<dyn MessageListener>>,
}

impl ConsumeServiceConfig {
    pub fn new(group: &str, config: &ConsumerConfig) -> Self {
        Self {
            group: group.to_string(),
            scheduler_workers: config.scheduler_workers,
            pull_expired_interval: config.pull_expired_interval(),
            sweep_interval: config.expiry_sweep_interval(),
            consume_timeout: config.consume_timeout(),
            consume_batch_max_size: config.consume_batch_max_size,
            send_back_retry_delay: config.send_back_retry_delay(),
            max_reconsume_times: config.max_reconsume_times,
            message_send_back: None,
            offset_store: None,
            listener: None,
        }
    }
}

/// Owns the assignment table (queue -> process queue) and the consume scheduler.
pub struct ConsumeService {
    group: String,
    retry_topic: String,
    process_queues: DashMap<QueueId, Arc<ProcessQueue>>,
    scheduler: Scheduler,
    offset_store: Arc<dyn OffsetStore>,
    message_send_back: Arc<dyn MessageSendBack>,
    listener: Arc<dyn MessageListener>,
    pull_expired_interval: Duration,
    sweep_interval: Duration,
    consume_timeout: Duration,
    consume_batch_max_size: usize,
    send_back_retry_delay: Duration,
    max_reconsume_times: i32,
    shutdown_tx: watch::Sender<bool>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl ConsumeService {
    pub fn new(config: ConsumeServiceConfig) -> Result<Arc<Self>, ConsumerError> {
        if config.group.is_empty() {
            return Err(ConsumerError::EmptyGroup);
        }
        let message_send_back = config
            .message_send_back
            .ok_or(ConsumerError::MissingCollaborator("message send-back"))?;
        let offset_store = config
            .offset_store
            .ok_or(ConsumerError::MissingCollaborator("offset store"))?;
        let listener = config
            .listener
            .ok_or(ConsumerError::MissingCollaborator("message listener"))?;

        let (shutdown_tx, _) = watch::channel(false);

        Ok(Arc::new(Self {
            retry_topic: retry_topic(&config.group),
            group: config.group,
            process_queues: DashMap::new(),
            scheduler: Scheduler::new(config.scheduler_workers),
            offset_store,
            message_send_back,
            listener,
            pull_expired_interval: config.pull_expired_interval,
            sweep_interval: config.sweep_interval,
            consume_timeout: config.consume_timeout,
            consume_batch_max_size: config.consume_batch_max_size.max(1),
            send_back_retry_delay: config.send_back_retry_delay,
            max_reconsume_times: config.max_reconsume_times,
            shutdown_tx,
            sweeper: Mutex::new(None),
        }))
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Start the periodic sweep of queues whose pull loop went quiet.
    pub fn start(self: &Arc<Self>) {
        let service = self.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            let mut interval = time::interval(service.sweep_interval);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            debug!(group = %service.group, "Expiry sweep shutting down");
                            break;
                        }
                    }
                    _ = interval.tick() => {
                        service.drop_expired_process_queues().await;
                    }
                }
            }
        });

        *self.sweeper.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        info!(group = %self.group, "Consume service started");
    }

    /// Stop the sweep, wait for it, then drain the scheduler.
    pub async fn shutdown(&self) {
        info!(group = %self.group, "Consume service shutting down");
        let _ = self.shutdown_tx.send(true);

        let sweeper = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = sweeper {
            let _ = handle.await;
        }

        self.scheduler.shutdown().await;
        info!(group = %self.group, "Consume service stopped");
    }

    /// Snapshot of the queues currently owned.
    pub fn message_queues(&self) -> Vec<QueueId> {
        self.process_queues
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn owned_count(&self) -> usize {
        self.process_queues.len()
    }

    pub fn process_queue(&self, queue: &QueueId) -> Option<Arc<ProcessQueue>> {
        self.process_queues
            .get(queue)
            .map(|entry| entry.value().clone())
    }

    pub fn process_queue_infos(&self) -> Vec<(QueueId, ProcessQueueInfo)> {
        self.process_queues
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().info()))
            .collect()
    }

    /// Take ownership of `queue` unless it is already owned.
    /// The flag tells whether a fresh process queue was inserted.
    pub fn insert_new_message_queue(&self, queue: &QueueId) -> (Arc<ProcessQueue>, bool) {
        match self.process_queues.entry(queue.clone()) {
            Entry::Occupied(existing) => (existing.get().clone(), false),
            Entry::Vacant(slot) => {
                let pq = Arc::new(ProcessQueue::new());
                slot.insert(pq.clone());
                (pq, true)
            }
        }
    }

    /// Give up ownership of `queue`: persist and forget its offset and drop its
    /// process queue. Returns whether the queue was owned.
    pub async fn remove_old_message_queue(&self, queue: &QueueId) -> bool {
        // Remove before side effects: concurrent removals of one queue have a single winner.
        let Some((_, pq)) = self.process_queues.remove(queue) else {
            return false;
        };
        self.release(queue, &pq).await;
        true
    }

    /// Remove `queue` only while the process queue that owns it has gone quiet.
    /// A fresh process queue inserted for the same queue is left alone.
    pub async fn drop_if_pull_expired(&self, queue: &QueueId) -> bool {
        let interval = self.pull_expired_interval;
        let Some((_, pq)) = self
            .process_queues
            .remove_if(queue, |_, pq| pq.is_pull_expired(interval))
        else {
            return false;
        };
        self.release(queue, &pq).await;
        warn!(group = %self.group, queue = %queue, "Pull expired, queue dropped");
        skiff_core::metrics::record_queue_expired(&queue.topic);
        true
    }

    async fn release(&self, queue: &QueueId, pq: &ProcessQueue) {
        pq.mark_dropped();

        if let Err(e) = self.offset_store.persist_one(queue).await {
            error!(group = %self.group, queue = %queue, error = %e, "Failed to persist offset of removed queue");
        }
        self.offset_store.remove_offset(queue).await;

        skiff_core::metrics::record_queue_removed(&queue.topic);
        skiff_core::metrics::set_owned_queues(&self.group, self.process_queues.len() as f64);
    }

    /// Remove every owned queue whose last pull is older than the expiry window.
    pub async fn drop_expired_process_queues(&self) -> Vec<QueueId> {
        let expired: Vec<QueueId> = self
            .process_queues
            .iter()
            .filter(|entry| entry.value().is_pull_expired(self.pull_expired_interval))
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = Vec::with_capacity(expired.len());
        for queue in expired {
            if self.drop_if_pull_expired(&queue).await {
                removed.push(queue);
            }
        }
        removed
    }

    /// Schedule pulled messages for consumption, in batches, behind earlier work of the same queue.
    pub fn submit_consume_request(
        self: &Arc<Self>,
        messages: Vec<MessageExt>,
        pq: Arc<ProcessQueue>,
        queue: QueueId,
    ) {
        for batch in messages.chunks(self.consume_batch_max_size) {
            let service = self.clone();
            let batch = batch.to_vec();
            let pq = pq.clone();
            let job_queue = queue.clone();
            let job = async move { service.consume_batch(batch, pq, job_queue).await };

            if let Err(e) = self.scheduler.submit(&queue, job) {
                debug!(group = %self.group, queue = %queue, error = %e, "Consume request rejected");
                return;
            }
        }
    }

    /// Put the original topic back on messages redelivered through the group's retry topic.
    pub fn reset_retry_topic(&self, messages: &mut [MessageExt]) {
        for message in messages.iter_mut() {
            if message.topic != self.retry_topic {
                continue;
            }
            if let Some(original) = message.properties.get(PROPERTY_RETRY_TOPIC) {
                message.topic = original.clone();
            }
        }
    }

    async fn consume_batch(
        self: Arc<Self>,
        mut messages: Vec<MessageExt>,
        pq: Arc<ProcessQueue>,
        queue: QueueId,
    ) {
        if pq.is_dropped() {
            debug!(group = %self.group, queue = %queue, "Queue dropped, skipping consume");
            return;
        }

        self.reset_retry_topic(&mut messages);
        pq.update_consume_timestamp();

        let mut ctx = ConsumeContext {
            queue: queue.clone(),
            delay_level: 0,
        };
        let started = Instant::now();
        let status = match time::timeout(
            self.consume_timeout,
            self.listener.consume(&messages, &mut ctx),
        )
        .await
        {
            Ok(status) => status,
            Err(_) => {
                warn!(group = %self.group, queue = %queue, error = %ConsumerError::ConsumeTimeout, "Consume callback timed out");
                ConsumeStatus::RetryLater
            }
        };
        skiff_core::metrics::record_consume_latency(
            &queue.topic,
            started.elapsed().as_secs_f64() * 1000.0,
        );

        if pq.is_dropped() {
            debug!(group = %self.group, queue = %queue, "Queue dropped while consuming, result discarded");
            return;
        }

        let mut failed = Vec::new();
        match status {
            ConsumeStatus::Success => {
                skiff_core::metrics::record_consume_success(&queue.topic, messages.len());
            }
            ConsumeStatus::RetryLater => {
                skiff_core::metrics::record_consume_retry(&queue.topic, messages.len());
                for message in &messages {
                    if let Err(e) = self
                        .message_send_back
                        .send_back(
                            message,
                            ctx.delay_level,
                            &message.broker_name,
                            self.max_reconsume_times,
                        )
                        .await
                    {
                        error!(
                            group = %self.group,
                            queue = %queue,
                            offset = message.queue_offset,
                            error = %e,
                            "Send back failed, consuming locally later"
                        );
                        let mut retry = message.clone();
                        retry.reconsume_times += 1;
                        failed.push(retry);
                    }
                }
            }
        }

        let done: Vec<MessageExt> = messages
            .into_iter()
            .filter(|m| !failed.iter().any(|f| f.queue_offset == m.queue_offset))
            .collect();
        if let Some(offset) = pq.remove_messages(&done) {
            if !pq.is_dropped() {
                self.offset_store.update_offset(&queue, offset).await;
            }
        }

        if !failed.is_empty() {
            let service = self.clone();
            let delay = self.send_back_retry_delay;
            tokio::spawn(async move {
                time::sleep(delay).await;
                service.submit_consume_request(failed, pq, queue);
            });
        }
    }
}
