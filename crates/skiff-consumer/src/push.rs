use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::{DashMap, DashSet};
use serde::Serialize;
use skiff_client::ManagedConsumer;
use skiff_core::{ConsumerConfig, ConsumerError, QueueId, SubscriptionData, retry_topic};
use tokio::time;
use tracing::{debug, error, info, warn};

use crate::collab::{
    HeartbeatTrigger, MessageListener, MessageSendBack, OffsetQuery, OffsetStore, PullTransport,
    QueueAllocator,
};
use crate::consume_service::{ConsumeService, ConsumeServiceConfig};
use crate::diff::subtract;
use crate::offset_policy::OffsetPolicy;
use crate::process_queue::ProcessQueueInfo;
use crate::pull_service::{MessagePuller, PullRequest, PullService};
use crate::puller::PullExecutor;
use crate::quota::QueueQuotas;
use crate::subscription::SubscriptionTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Created,
    Running,
    Stopped,
}

impl ConsumerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Membership changes applied by one rebalance pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RebalanceOutcome {
    pub added: Vec<QueueId>,
    pub removed: Vec<QueueId>,
    /// Queues skipped this pass because their start offset could not be computed.
    pub failed: Vec<QueueId>,
    /// Queues whose pull request was handed to the pull service.
    pub dispatched: Vec<QueueId>,
}

impl RebalanceOutcome {
    pub fn changed(&self) -> bool {
        !self.added.is_empty() || !self.removed.is_empty()
    }
}

/// Serializable snapshot of a consumer for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct RunningInfo {
    pub properties: BTreeMap<String, String>,
    pub subscriptions: Vec<SubscriptionData>,
    pub process_queues: BTreeMap<String, ProcessQueueInfo>,
}

pub struct PushConsumerBuilder {
    group: String,
    config: ConsumerConfig,
    subscriptions: Vec<(String, String)>,
    offset_store: Option<Arc<dyn OffsetStore>>,
    allocator: Option<Arc<dyn QueueAllocator>>,
    offset_query: Option<Arc<dyn OffsetQuery>>,
    heartbeat: Option<Arc<dyn HeartbeatTrigger>>,
    send_back: Option<Arc<dyn MessageSendBack>>,
    transport: Option<Arc<dyn PullTransport>>,
    listener: Option<Arc<dyn MessageListener>>,
}

impl PushConsumerBuilder {
    pub fn new(group: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            config: ConsumerConfig::default(),
            subscriptions: Vec::new(),
            offset_store: None,
            allocator: None,
            offset_query: None,
            heartbeat: None,
            send_back: None,
            transport: None,
            listener: None,
        }
    }

    pub fn config(mut self, config: ConsumerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn subscribe(mut self, topic: impl Into<String>, expression: impl Into<String>) -> Self {
        self.subscriptions.push((topic.into(), expression.into()));
        self
    }

    pub fn offset_store(mut self, store: Arc<dyn OffsetStore>) -> Self {
        self.offset_store = Some(store);
        self
    }

    pub fn allocator(mut self, allocator: Arc<dyn QueueAllocator>) -> Self {
        self.allocator = Some(allocator);
        self
    }

    pub fn offset_query(mut self, query: Arc<dyn OffsetQuery>) -> Self {
        self.offset_query = Some(query);
        self
    }

    pub fn heartbeat(mut self, heartbeat: Arc<dyn HeartbeatTrigger>) -> Self {
        self.heartbeat = Some(heartbeat);
        self
    }

    pub fn send_back(mut self, send_back: Arc<dyn MessageSendBack>) -> Self {
        self.send_back = Some(send_back);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn PullTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn listener(mut self, listener: Arc<dyn MessageListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Validate the configuration and wire the services. Spawns the consume
    /// workers, so it must run inside a Tokio runtime.
    pub fn build(self) -> Result<PushConsumer, ConsumerError> {
        if self.group.is_empty() {
            return Err(ConsumerError::EmptyGroup);
        }
        self.config.validate()?;

        let allocator = self
            .allocator
            .ok_or(ConsumerError::MissingCollaborator("queue allocator"))?;
        let offset_query = self
            .offset_query
            .ok_or(ConsumerError::MissingCollaborator("offset query"))?;
        let heartbeat = self
            .heartbeat
            .ok_or(ConsumerError::MissingCollaborator("heartbeat trigger"))?;
        let transport = self
            .transport
            .ok_or(ConsumerError::MissingCollaborator("pull transport"))?;
        let offset_store = self
            .offset_store
            .ok_or(ConsumerError::MissingCollaborator("offset store"))?;

        let mut service_config = ConsumeServiceConfig::new(&self.group, &self.config);
        service_config.message_send_back = self.send_back;
        service_config.offset_store = Some(offset_store.clone());
        service_config.listener = self.listener;
        let consume_service = ConsumeService::new(service_config)?;

        let subscriptions = Arc::new(SubscriptionTable::new());
        for (topic, expression) in &self.subscriptions {
            subscriptions.subscribe(topic, expression);
        }
        let quotas = Arc::new(QueueQuotas::new(
            self.config.max_count_for_queue,
            self.config.max_size_for_queue,
        ));

        let puller = PullExecutor::new(
            transport,
            consume_service.clone(),
            offset_store.clone(),
            subscriptions.clone(),
            quotas.clone(),
            &self.config,
        );
        let puller: Arc<dyn MessagePuller> = Arc::new(puller);
        let pull_service = PullService::new(Some(puller), self.config.request_buffer_size)?;

        Ok(PushConsumer {
            inner: Arc::new(Inner {
                policy: OffsetPolicy::from_config(&self.config),
                group: self.group,
                config: self.config,
                state: Mutex::new(ConsumerState::Created),
                subscriptions,
                quotas,
                consume_service,
                pull_service,
                allocator,
                offset_store,
                offset_query,
                heartbeat,
                topic_locks: DashMap::new(),
                pending_retries: DashSet::new(),
            }),
        })
    }
}

struct Inner {
    group: String,
    config: ConsumerConfig,
    state: Mutex<ConsumerState>,
    subscriptions: Arc<SubscriptionTable>,
    quotas: Arc<QueueQuotas>,
    consume_service: Arc<ConsumeService>,
    pull_service: PullService,
    allocator: Arc<dyn QueueAllocator>,
    offset_store: Arc<dyn OffsetStore>,
    offset_query: Arc<dyn OffsetQuery>,
    heartbeat: Arc<dyn HeartbeatTrigger>,
    policy: OffsetPolicy,
    topic_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    pending_retries: DashSet<String>,
}

/// A push-style consumer group member: keeps the owned queues in line with
/// the allocation and keeps one pull loop running per owned queue.
#[derive(Clone)]
pub struct PushConsumer {
    inner: Arc<Inner>,
}

impl PushConsumer {
    pub fn builder(group: impl Into<String>) -> PushConsumerBuilder {
        PushConsumerBuilder::new(group)
    }

    pub fn group(&self) -> &str {
        &self.inner.group
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ConsumerState {
        *self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn consume_service(&self) -> &Arc<ConsumeService> {
        &self.inner.consume_service
    }

    pub fn pull_service(&self) -> &PullService {
        &self.inner.pull_service
    }

    pub fn max_count_per_queue(&self) -> usize {
        self.inner.quotas.max_count()
    }

    pub fn max_size_per_queue(&self) -> usize {
        self.inner.quotas.max_size()
    }

    pub fn subscription(&self, topic: &str) -> Option<SubscriptionData> {
        self.inner.subscriptions.get(topic)
    }

    pub fn start(&self) -> Result<(), ConsumerError> {
        self.transition(ConsumerState::Created, ConsumerState::Running)?;

        self.inner
            .subscriptions
            .subscribe(&retry_topic(&self.inner.group), "*");
        self.inner.consume_service.start();

        info!(group = %self.inner.group, "Push consumer started");
        Ok(())
    }

    /// Stop periodic work, drain consumption, stop pulling, then persist the
    /// offsets of every queue still owned.
    pub async fn shutdown(&self) -> Result<(), ConsumerError> {
        self.transition(ConsumerState::Running, ConsumerState::Stopped)?;
        info!(group = %self.inner.group, "Push consumer shutting down");

        self.inner.consume_service.shutdown().await;
        self.inner.pull_service.shutdown().await;

        for queue in self.inner.consume_service.message_queues() {
            if let Err(e) = self.inner.offset_store.persist_one(&queue).await {
                error!(group = %self.inner.group, queue = %queue, error = %e, "Failed to persist offset on shutdown");
            }
        }

        info!(group = %self.inner.group, "Push consumer stopped");
        Ok(())
    }

    fn transition(&self, from: ConsumerState, to: ConsumerState) -> Result<(), ConsumerError> {
        let mut state = self.inner.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != from {
            return Err(ConsumerError::InvalidState {
                expected: from.as_str(),
                actual: state.as_str(),
            });
        }
        *state = to;
        Ok(())
    }

    /// Subscribe to a topic; it is picked up by the next rebalance pass.
    pub fn subscribe(&self, topic: &str, expression: &str) -> bool {
        let added = self.inner.subscriptions.subscribe(topic, expression);
        if added {
            info!(group = %self.inner.group, topic, expression, "Subscribed");
        }
        added
    }

    /// Drop the subscription and release every owned queue of the topic.
    pub async fn unsubscribe(&self, topic: &str) -> bool {
        let lock = self.topic_lock(topic);
        let _guard = lock.lock().await;

        if self.inner.subscriptions.unsubscribe(topic).is_none() {
            return false;
        }
        let owned: Vec<QueueId> = self
            .inner
            .consume_service
            .message_queues()
            .into_iter()
            .filter(|q| q.topic == topic)
            .collect();
        for queue in &owned {
            self.inner.consume_service.remove_old_message_queue(queue).await;
        }
        if !owned.is_empty() {
            self.update_threshold_of_queue();
            self.inner.heartbeat.trigger_heartbeat();
        }

        info!(group = %self.inner.group, topic, released = owned.len(), "Unsubscribed");
        true
    }

    fn topic_lock(&self, topic: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.inner
            .topic_locks
            .entry(topic.to_string())
            .or_default()
            .clone()
    }

    /// Bring the owned queues of `topic` in line with the current allocation.
    ///
    /// An empty routing result leaves everything untouched. A queue whose start
    /// offset cannot be computed is skipped for this pass; the others proceed.
    pub async fn rebalance(&self, topic: &str) -> Result<RebalanceOutcome, ConsumerError> {
        let state = self.state();
        if state == ConsumerState::Stopped {
            return Err(ConsumerError::InvalidState {
                expected: ConsumerState::Running.as_str(),
                actual: state.as_str(),
            });
        }

        let lock = self.topic_lock(topic);
        let _guard = lock.lock().await;

        let allocation = self.inner.allocator.allocate(&self.inner.group, topic).await?;
        if allocation.all.is_empty() {
            debug!(group = %self.inner.group, topic, "No route for topic yet, rebalance skipped");
            return Ok(RebalanceOutcome::default());
        }

        let (mut outcome, requests) = self.update_process_table(topic, &allocation.mine).await;
        outcome.dispatched = self.dispatch_pull_requests(requests);

        if outcome.changed() {
            info!(
                group = %self.inner.group,
                topic,
                added = outcome.added.len(),
                removed = outcome.removed.len(),
                owned = self.inner.consume_service.owned_count(),
                "Rebalance changed queue ownership"
            );
            skiff_core::metrics::record_rebalance_changed(topic);
            self.update_subscribe_version(topic);
            self.update_threshold_of_queue();
        }
        if !outcome.failed.is_empty() {
            self.schedule_offset_init_retry(topic);
        }

        Ok(outcome)
    }

    /// Apply the diff between owned and allocated queues of one topic. Returns
    /// the outcome and the pull requests of the freshly inserted queues.
    async fn update_process_table(
        &self,
        topic: &str,
        allocated: &[QueueId],
    ) -> (RebalanceOutcome, Vec<PullRequest>) {
        let service = &self.inner.consume_service;
        let current: Vec<QueueId> = service
            .message_queues()
            .into_iter()
            .filter(|q| q.topic == topic)
            .collect();

        let mut outcome = RebalanceOutcome::default();
        for queue in subtract(&current, allocated) {
            if service.remove_old_message_queue(&queue).await {
                info!(group = %self.inner.group, queue = %queue, "Queue released");
                outcome.removed.push(queue);
            }
        }

        let mut requests = Vec::new();
        for queue in subtract(allocated, &current) {
            self.inner.offset_store.remove_offset(&queue).await;

            let offset = match self
                .inner
                .policy
                .compute_where_to_pull(
                    &queue,
                    self.inner.offset_store.as_ref(),
                    self.inner.offset_query.as_ref(),
                )
                .await
            {
                Ok(offset) => offset,
                Err(e) => {
                    error!(group = %self.inner.group, queue = %queue, error = %e, "Failed to compute start offset, queue skipped");
                    skiff_core::metrics::record_offset_init_failed(topic);
                    outcome.failed.push(queue);
                    continue;
                }
            };

            let (process_queue, inserted) = service.insert_new_message_queue(&queue);
            if !inserted {
                debug!(group = %self.inner.group, queue = %queue, "Queue already owned");
                continue;
            }

            info!(group = %self.inner.group, queue = %queue, offset, "Queue acquired");
            skiff_core::metrics::record_queue_added(topic);
            requests.push(PullRequest {
                group: self.inner.group.clone(),
                queue: queue.clone(),
                next_offset: offset,
                process_queue,
            });
            outcome.added.push(queue);
        }

        skiff_core::metrics::set_owned_queues(&self.inner.group, service.owned_count() as f64);
        (outcome, requests)
    }

    fn dispatch_pull_requests(&self, requests: Vec<PullRequest>) -> Vec<QueueId> {
        let mut dispatched = Vec::with_capacity(requests.len());
        for request in requests {
            let queue = request.queue.clone();
            if self.inner.pull_service.submit_request_immediately(request) {
                skiff_core::metrics::record_pull_request_dispatched(&queue.topic);
                dispatched.push(queue);
            }
        }
        dispatched
    }

    fn update_subscribe_version(&self, topic: &str) {
        if let Some((old, new)) = self.inner.subscriptions.bump_version(topic) {
            info!(group = %self.inner.group, topic, old, new, "Subscription version updated");
            skiff_core::metrics::set_subscription_version(topic, new);
        }
        self.inner.heartbeat.trigger_heartbeat();
    }

    fn update_threshold_of_queue(&self) {
        let owned = self.inner.consume_service.owned_count();
        self.inner.quotas.recompute(
            self.inner.config.max_count_for_topic,
            self.inner.config.max_size_for_topic,
            owned,
        );
        debug!(
            group = %self.inner.group,
            owned,
            max_count = self.inner.quotas.max_count(),
            max_size = self.inner.quotas.max_size(),
            "Queue quotas recomputed"
        );
    }

    /// Re-run the topic's rebalance after the configured delay. At most one
    /// pending retry per topic; nothing happens unless the consumer is running by then.
    fn schedule_offset_init_retry(&self, topic: &str) {
        let Some(delay) = self.inner.config.offset_init_retry() else {
            return;
        };
        if !self.inner.pending_retries.insert(topic.to_string()) {
            return;
        }

        let consumer = self.clone();
        let topic = topic.to_string();
        tokio::spawn(async move {
            time::sleep(delay).await;
            consumer.inner.pending_retries.remove(&topic);
            if consumer.state() != ConsumerState::Running {
                return;
            }
            debug!(group = %consumer.inner.group, topic = %topic, "Retrying offset initialization");
            if let Err(e) = consumer.rebalance(&topic).await {
                warn!(group = %consumer.inner.group, topic = %topic, error = %e, "Targeted rebalance failed");
            }
        });
    }

    /// One rebalance pass over every subscribed topic. Topic failures are logged.
    pub async fn rebalance_all(&self) {
        if self.state() != ConsumerState::Running {
            debug!(group = %self.inner.group, "Consumer not running, rebalance skipped");
            return;
        }
        for topic in self.inner.subscriptions.topics() {
            if let Err(e) = self.rebalance(&topic).await {
                warn!(group = %self.inner.group, topic = %topic, error = %e, "Rebalance failed");
            }
        }
    }

    pub fn running_info(&self) -> RunningInfo {
        let config = &self.inner.config;
        let mut properties = BTreeMap::new();
        properties.insert("group".to_string(), self.inner.group.clone());
        properties.insert("state".to_string(), self.state().to_string());
        properties.insert("consume_type".to_string(), "CONSUME_PASSIVELY".to_string());
        properties.insert("consume_from".to_string(), config.consume_from.to_string());
        properties.insert(
            "consume_timestamp_ms".to_string(),
            config.consume_timestamp_ms.to_string(),
        );
        properties.insert(
            "scheduler_workers".to_string(),
            self.inner.consume_service.scheduler().worker_count().to_string(),
        );
        properties.insert(
            "max_count_per_queue".to_string(),
            self.inner.quotas.max_count().to_string(),
        );
        properties.insert(
            "max_size_per_queue".to_string(),
            self.inner.quotas.max_size().to_string(),
        );
        properties.insert("snapshot_at".to_string(), Utc::now().to_rfc3339());

        let mut subscriptions = self.inner.subscriptions.snapshot();
        subscriptions.sort_by(|a, b| a.topic.cmp(&b.topic));

        let process_queues = self
            .inner
            .consume_service
            .process_queue_infos()
            .into_iter()
            .map(|(queue, info)| (queue.to_string(), info))
            .collect();

        RunningInfo {
            properties,
            subscriptions,
            process_queues,
        }
    }
}

#[async_trait]
impl ManagedConsumer for PushConsumer {
    fn group(&self) -> &str {
        &self.inner.group
    }

    fn subscribed_topics(&self) -> Vec<String> {
        self.inner.subscriptions.topics()
    }

    async fn rebalance_all(&self) {
        PushConsumer::rebalance_all(self).await;
    }
}
