use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::ConsumerError;

/// Prefix of the system-managed topics holding messages scheduled for redelivery.
pub const RETRY_GROUP_TOPIC_PREFIX: &str = "%RETRY%";

/// Message property carrying the original retry topic of a redelivered message.
pub const PROPERTY_RETRY_TOPIC: &str = "RETRY_TOPIC";

/// Identity of one partition: (topic, broker, queue index).
///
/// Compared by value; two identities with equal fields are the same partition
/// no matter where they were built.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueueId {
    pub topic: String,
    pub broker_name: String,
    pub queue_id: i32,
}

impl QueueId {
    pub fn new(topic: impl Into<String>, broker_name: impl Into<String>, queue_id: i32) -> Self {
        Self {
            topic: topic.into(),
            broker_name: broker_name.into(),
            queue_id,
        }
    }

    /// Whether this partition belongs to a group's retry topic.
    pub fn is_retry(&self) -> bool {
        self.topic.starts_with(RETRY_GROUP_TOPIC_PREFIX)
    }
}

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.topic, self.broker_name, self.queue_id)
    }
}

/// Retry topic name of a consumer group.
pub fn retry_topic(group: &str) -> String {
    format!("{RETRY_GROUP_TOPIC_PREFIX}{group}")
}

/// Where a newly acquired partition starts consuming when no offset is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumeFrom {
    LastOffset,
    FirstOffset,
    Timestamp,
}

impl ConsumeFrom {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LastOffset => "CONSUME_FROM_LAST_OFFSET",
            Self::FirstOffset => "CONSUME_FROM_FIRST_OFFSET",
            Self::Timestamp => "CONSUME_FROM_TIMESTAMP",
        }
    }
}

impl fmt::Display for ConsumeFrom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ConsumeFrom {
    type Err = ConsumerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "last_offset" | "CONSUME_FROM_LAST_OFFSET" => Ok(Self::LastOffset),
            "first_offset" | "CONSUME_FROM_FIRST_OFFSET" => Ok(Self::FirstOffset),
            "timestamp" | "CONSUME_FROM_TIMESTAMP" => Ok(Self::Timestamp),
            other => Err(ConsumerError::UnknownConsumeFrom(other.to_string())),
        }
    }
}

/// Where an offset read is served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOffsetType {
    Memory,
    Store,
    MemoryThenStore,
}

/// Result reported by the application callback for one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsumeStatus {
    Success,
    RetryLater,
}

/// A message as delivered by the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageExt {
    pub msg_id: String,
    pub topic: String,
    pub broker_name: String,
    pub queue_id: i32,
    pub queue_offset: i64,
    pub reconsume_times: i32,
    pub body: Vec<u8>,
    pub properties: HashMap<String, String>,
}

impl MessageExt {
    pub fn new(queue: &QueueId, queue_offset: i64, body: impl Into<Vec<u8>>) -> Self {
        Self {
            msg_id: Uuid::now_v7().to_string(),
            topic: queue.topic.clone(),
            broker_name: queue.broker_name.clone(),
            queue_id: queue.queue_id,
            queue_offset,
            reconsume_times: 0,
            body: body.into(),
            properties: HashMap::new(),
        }
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn size(&self) -> usize {
        self.body.len()
    }
}

/// Subscription of a consumer group to one topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionData {
    pub topic: String,
    pub expression: String,
    pub version: i64,
}

impl SubscriptionData {
    pub fn new(topic: impl Into<String>, expression: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            expression: expression.into(),
            version: now_millis(),
        }
    }
}

/// Current wall-clock time in milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
