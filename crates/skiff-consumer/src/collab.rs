//! Contracts of the collaborators the consumer core drives but does not own:
//! routing/assignment, offset persistence, broker queries, the wire pull,
//! send-back and the application callback.

use std::time::Duration;

use async_trait::async_trait;
use skiff_client::ClientInstance;
use skiff_core::{ConsumeStatus, ConsumerError, MessageExt, QueueId, ReadOffsetType};

/// Full queue set of a topic plus the subset allocated to this instance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Allocation {
    pub all: Vec<QueueId>,
    pub mine: Vec<QueueId>,
}

/// Routing lookup combined with the group's allocation strategy.
/// An empty `all` means routing is not available yet.
#[async_trait]
pub trait QueueAllocator: Send + Sync {
    async fn allocate(&self, group: &str, topic: &str) -> Result<Allocation, ConsumerError>;
}

/// Durable per-queue consumption progress.
#[async_trait]
pub trait OffsetStore: Send + Sync {
    /// `Ok(None)` when no offset is recorded for the queue.
    async fn read_offset(
        &self,
        queue: &QueueId,
        from: ReadOffsetType,
    ) -> Result<Option<i64>, ConsumerError>;

    async fn update_offset(&self, queue: &QueueId, offset: i64);

    async fn persist_one(&self, queue: &QueueId) -> Result<(), ConsumerError>;

    /// Forget any cached offset of the queue.
    async fn remove_offset(&self, queue: &QueueId);
}

/// Broker-side offset lookups.
#[async_trait]
pub trait OffsetQuery: Send + Sync {
    async fn max_offset(&self, queue: &QueueId) -> Result<i64, ConsumerError>;

    async fn search_offset(
        &self,
        queue: &QueueId,
        timestamp_ms: i64,
        timeout: Duration,
    ) -> Result<i64, ConsumerError>;
}

/// Signal raised after every membership change.
pub trait HeartbeatTrigger: Send + Sync {
    fn trigger_heartbeat(&self);
}

impl HeartbeatTrigger for ClientInstance {
    fn trigger_heartbeat(&self) {
        self.send_heartbeat();
    }
}

/// Returns a message to the broker for delayed redelivery.
#[async_trait]
pub trait MessageSendBack: Send + Sync {
    /// `max_reconsume_times` is the redelivery limit after which the broker
    /// dead-letters the message; -1 leaves it to the broker's default.
    async fn send_back(
        &self,
        message: &MessageExt,
        delay_level: i32,
        broker_name: &str,
        max_reconsume_times: i32,
    ) -> Result<(), ConsumerError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullStatus {
    Found,
    NoNewMessage,
    NoMatchedMessage,
    OffsetIllegal,
}

#[derive(Debug, Clone)]
pub struct PullResponse {
    pub status: PullStatus,
    pub next_begin_offset: i64,
    pub min_offset: i64,
    pub max_offset: i64,
    pub messages: Vec<MessageExt>,
}

/// One network pull round-trip.
#[async_trait]
pub trait PullTransport: Send + Sync {
    async fn pull(
        &self,
        group: &str,
        queue: &QueueId,
        expression: &str,
        offset: i64,
        batch_size: u32,
    ) -> Result<PullResponse, ConsumerError>;
}

/// Per-batch context handed to the application callback.
#[derive(Debug, Clone)]
pub struct ConsumeContext {
    pub queue: QueueId,
    /// Delay level used when the batch is sent back; 0 lets the broker decide.
    pub delay_level: i32,
}

/// The application callback.
#[async_trait]
pub trait MessageListener: Send + Sync {
    async fn consume(&self, messages: &[MessageExt], ctx: &mut ConsumeContext) -> ConsumeStatus;
}
