use async_trait::async_trait;
use skiff_core::ConsumerError;

/// Producer as seen by the client instance.
pub trait ManagedProducer: Send + Sync {
    fn group(&self) -> &str;
    fn publish_topics(&self) -> Vec<String>;
}

/// Admin as seen by the client instance.
pub trait ManagedAdmin: Send + Sync {
    fn group(&self) -> &str;
}

/// Consumer as seen by the client instance: something that can be rebalanced.
#[async_trait]
pub trait ManagedConsumer: Send + Sync {
    fn group(&self) -> &str;
    fn subscribed_topics(&self) -> Vec<String>;

    /// Run one rebalance pass over every subscribed topic.
    async fn rebalance_all(&self);
}

/// Sends the heartbeat for the registered groups; payload encoding lives behind it.
#[async_trait]
pub trait HeartbeatSink: Send + Sync {
    async fn send_heartbeat(
        &self,
        producer_groups: Vec<String>,
        consumer_groups: Vec<String>,
    ) -> Result<(), ConsumerError>;
}
