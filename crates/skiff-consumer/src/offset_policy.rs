use std::time::Duration;

use skiff_core::{ConsumeFrom, ConsumerConfig, ConsumerError, QueueId, ReadOffsetType};
use tokio::time;
use tracing::debug;

use crate::collab::{OffsetQuery, OffsetStore};

/// Decides the first offset pulled from a newly acquired queue.
///
/// A stored offset always wins. Without one:
/// - `LastOffset`: 0 for retry queues, otherwise the broker's max offset.
/// - `FirstOffset`: 0.
/// - `Timestamp`: the broker's max offset for retry queues, otherwise the
///   offset at or after `consume_timestamp_ms`, looked up under `search_timeout`.
///
/// Any other store or broker failure is returned and the queue is skipped for this pass.
#[derive(Debug, Clone)]
pub struct OffsetPolicy {
    pub consume_from: ConsumeFrom,
    pub consume_timestamp_ms: i64,
    pub search_timeout: Duration,
}

impl OffsetPolicy {
    pub fn from_config(config: &ConsumerConfig) -> Self {
        Self {
            consume_from: config.consume_from,
            consume_timestamp_ms: config.consume_timestamp_ms,
            search_timeout: config.search_offset_timeout(),
        }
    }

    pub async fn compute_where_to_pull(
        &self,
        queue: &QueueId,
        store: &dyn OffsetStore,
        query: &dyn OffsetQuery,
    ) -> Result<i64, ConsumerError> {
        if let Some(offset) = store.read_offset(queue, ReadOffsetType::Store).await? {
            return Ok(offset);
        }
        debug!(
            queue = %queue,
            consume_from = %self.consume_from,
            "No stored offset, falling back"
        );

        match self.consume_from {
            ConsumeFrom::LastOffset => {
                if queue.is_retry() {
                    Ok(0)
                } else {
                    query.max_offset(queue).await
                }
            }
            ConsumeFrom::FirstOffset => Ok(0),
            ConsumeFrom::Timestamp => {
                if queue.is_retry() {
                    query.max_offset(queue).await
                } else {
                    self.search_offset(queue, query).await
                }
            }
        }
    }

    async fn search_offset(
        &self,
        queue: &QueueId,
        query: &dyn OffsetQuery,
    ) -> Result<i64, ConsumerError> {
        time::timeout(
            self.search_timeout,
            query.search_offset(queue, self.consume_timestamp_ms, self.search_timeout),
        )
        .await
        .map_err(|_| ConsumerError::Timeout(format!("search offset of {queue}")))?
    }
}
