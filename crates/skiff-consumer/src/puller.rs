use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use skiff_core::ConsumerConfig;
use tracing::{debug, error, warn};

use crate::collab::{OffsetStore, PullStatus, PullTransport};
use crate::consume_service::ConsumeService;
use crate::pull_service::{MessagePuller, PullNext, PullRequest};
use crate::quota::QueueQuotas;
use crate::subscription::SubscriptionTable;

const MIB: usize = 1024 * 1024;

/// Pulls a queue over the transport, buffers what arrives and hands it to the consume service.
pub struct PullExecutor {
    transport: Arc<dyn PullTransport>,
    consume_service: Arc<ConsumeService>,
    offset_store: Arc<dyn OffsetStore>,
    subscriptions: Arc<SubscriptionTable>,
    quotas: Arc<QueueQuotas>,
    batch_size: u32,
    pull_interval: Duration,
    flow_control_delay: Duration,
    pull_error_delay: Duration,
}

impl PullExecutor {
    pub fn new(
        transport: Arc<dyn PullTransport>,
        consume_service: Arc<ConsumeService>,
        offset_store: Arc<dyn OffsetStore>,
        subscriptions: Arc<SubscriptionTable>,
        quotas: Arc<QueueQuotas>,
        config: &ConsumerConfig,
    ) -> Self {
        Self {
            transport,
            consume_service,
            offset_store,
            subscriptions,
            quotas,
            batch_size: config.pull_batch_size,
            pull_interval: config.pull_interval(),
            flow_control_delay: config.flow_control_delay(),
            pull_error_delay: config.pull_error_delay(),
        }
    }

    fn next_cycle(&self, request: PullRequest) -> PullNext {
        if self.pull_interval.is_zero() {
            PullNext::Immediately(request)
        } else {
            PullNext::After(request, self.pull_interval)
        }
    }
}

#[async_trait]
impl MessagePuller for PullExecutor {
    async fn pull(&self, mut request: PullRequest) -> PullNext {
        let pq = request.process_queue.clone();
        let queue = request.queue.clone();

        if pq.is_dropped() {
            debug!(queue = %queue, "Queue dropped, pull cancelled");
            return PullNext::Stop;
        }
        pq.update_pull_timestamp();

        let buffered = pq.message_count();
        if buffered > self.quotas.max_count() {
            debug!(queue = %queue, buffered, limit = self.quotas.max_count(), "Flow control by count");
            return PullNext::After(request, self.flow_control_delay);
        }
        let buffered_mib = pq.message_bytes() / MIB;
        if buffered_mib > self.quotas.max_size() {
            debug!(queue = %queue, buffered_mib, limit = self.quotas.max_size(), "Flow control by size");
            return PullNext::After(request, self.flow_control_delay);
        }

        let Some(subscription) = self.subscriptions.get(&queue.topic) else {
            warn!(queue = %queue, "No subscription for topic, pull delayed");
            return PullNext::After(request, self.pull_error_delay);
        };

        let response = match self
            .transport
            .pull(
                &request.group,
                &queue,
                &subscription.expression,
                request.next_offset,
                self.batch_size,
            )
            .await
        {
            Ok(response) => response,
            Err(e) => {
                error!(queue = %queue, offset = request.next_offset, error = %e, "Pull failed");
                return PullNext::After(request, self.pull_error_delay);
            }
        };

        match response.status {
            PullStatus::Found => {
                request.next_offset = response.next_begin_offset;
                let messages = response.messages;
                if messages.is_empty() {
                    return PullNext::Immediately(request);
                }

                skiff_core::metrics::record_messages_pulled(&queue.topic, messages.len());
                pq.put_messages(messages.clone());
                self.consume_service
                    .submit_consume_request(messages, pq, queue);
                self.next_cycle(request)
            }
            PullStatus::NoNewMessage | PullStatus::NoMatchedMessage => {
                request.next_offset = response.next_begin_offset;
                if pq.message_count() == 0 {
                    self.offset_store
                        .update_offset(&queue, request.next_offset)
                        .await;
                }
                self.next_cycle(request)
            }
            PullStatus::OffsetIllegal => {
                warn!(
                    queue = %queue,
                    offset = request.next_offset,
                    suggested = response.next_begin_offset,
                    "Illegal pull offset, queue reset"
                );
                pq.mark_dropped();
                self.offset_store
                    .update_offset(&queue, response.next_begin_offset)
                    .await;
                if let Err(e) = self.offset_store.persist_one(&queue).await {
                    error!(queue = %queue, error = %e, "Failed to persist corrected offset");
                }
                self.consume_service.remove_old_message_queue(&queue).await;
                PullNext::Stop
            }
        }
    }
}
