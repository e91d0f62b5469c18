//! In-memory collaborators for driving the consumer without a broker.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use skiff_client::HeartbeatSink;
use skiff_consumer::collab::{
    Allocation, ConsumeContext, HeartbeatTrigger, MessageListener, MessageSendBack, OffsetQuery,
    OffsetStore, PullResponse, PullStatus, PullTransport, QueueAllocator,
};
use skiff_consumer::{ConsumeServiceConfig, PushConsumer};
use skiff_core::{
    ConsumeStatus, ConsumerConfig, ConsumerError, MessageExt, QueueId, ReadOffsetType,
};

pub const BROKER: &str = "broker-a";

pub fn queue(topic: &str, id: i32) -> QueueId {
    QueueId::new(topic, BROKER, id)
}

pub fn queues(topic: &str, ids: &[i32]) -> Vec<QueueId> {
    ids.iter().map(|id| queue(topic, *id)).collect()
}

/// Offsets cached in memory plus a "durable" copy written by `persist_one`.
#[derive(Default)]
pub struct MemoryOffsetStore {
    cached: DashMap<QueueId, i64>,
    stored: DashMap<QueueId, i64>,
    failing: DashSet<QueueId>,
    persisted: Mutex<Vec<QueueId>>,
    forgotten: Mutex<Vec<QueueId>>,
}

impl MemoryOffsetStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_stored(&self, queue: &QueueId, offset: i64) {
        self.stored.insert(queue.clone(), offset);
    }

    pub fn fail_reads(&self, queue: &QueueId) {
        self.failing.insert(queue.clone());
    }

    pub fn cached(&self, queue: &QueueId) -> Option<i64> {
        self.cached.get(queue).map(|v| *v)
    }

    pub fn stored(&self, queue: &QueueId) -> Option<i64> {
        self.stored.get(queue).map(|v| *v)
    }

    pub fn persisted(&self) -> Vec<QueueId> {
        self.persisted.lock().unwrap().clone()
    }

    pub fn forgotten(&self) -> Vec<QueueId> {
        self.forgotten.lock().unwrap().clone()
    }
}

#[async_trait]
impl OffsetStore for MemoryOffsetStore {
    async fn read_offset(
        &self,
        queue: &QueueId,
        from: ReadOffsetType,
    ) -> Result<Option<i64>, ConsumerError> {
        if self.failing.contains(queue) {
            return Err(ConsumerError::OffsetStore(format!("read failed for {queue}")));
        }
        Ok(match from {
            ReadOffsetType::Memory => self.cached(queue),
            ReadOffsetType::Store => self.stored(queue),
            ReadOffsetType::MemoryThenStore => self.cached(queue).or_else(|| self.stored(queue)),
        })
    }

    async fn update_offset(&self, queue: &QueueId, offset: i64) {
        self.cached.insert(queue.clone(), offset);
    }

    async fn persist_one(&self, queue: &QueueId) -> Result<(), ConsumerError> {
        if let Some(offset) = self.cached(queue) {
            self.stored.insert(queue.clone(), offset);
        }
        self.persisted.lock().unwrap().push(queue.clone());
        Ok(())
    }

    async fn remove_offset(&self, queue: &QueueId) {
        self.cached.remove(queue);
        self.forgotten.lock().unwrap().push(queue.clone());
    }
}

/// Allocation per topic, set by the test.
#[derive(Default)]
pub struct ScriptedAllocator {
    allocations: DashMap<String, Allocation>,
    calls: AtomicUsize,
}

impl ScriptedAllocator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Route the topic to `all` and allocate `mine` to this instance.
    pub fn set(&self, topic: &str, all: Vec<QueueId>, mine: Vec<QueueId>) {
        self.allocations
            .insert(topic.to_string(), Allocation { all, mine });
    }

    /// Every routed queue allocated to this instance.
    pub fn assign(&self, topic: &str, mine: Vec<QueueId>) {
        self.set(topic, mine.clone(), mine);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl QueueAllocator for ScriptedAllocator {
    async fn allocate(&self, _group: &str, topic: &str) -> Result<Allocation, ConsumerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .allocations
            .get(topic)
            .map(|a| a.value().clone())
            .unwrap_or_default())
    }
}

pub struct StaticOffsetQuery {
    max_offsets: DashMap<QueueId, i64>,
    default_max: i64,
    search_result: i64,
    search_delay: Mutex<Option<Duration>>,
    failing: DashSet<QueueId>,
}

impl StaticOffsetQuery {
    pub fn new(default_max: i64) -> Arc<Self> {
        Arc::new(Self {
            max_offsets: DashMap::new(),
            default_max,
            search_result: 42,
            search_delay: Mutex::new(None),
            failing: DashSet::new(),
        })
    }

    pub fn set_max(&self, queue: &QueueId, offset: i64) {
        self.max_offsets.insert(queue.clone(), offset);
    }

    pub fn fail(&self, queue: &QueueId) {
        self.failing.insert(queue.clone());
    }

    pub fn recover(&self, queue: &QueueId) {
        self.failing.remove(queue);
    }

    pub fn delay_search(&self, delay: Duration) {
        *self.search_delay.lock().unwrap() = Some(delay);
    }

    pub fn search_result(&self) -> i64 {
        self.search_result
    }
}

#[async_trait]
impl OffsetQuery for StaticOffsetQuery {
    async fn max_offset(&self, queue: &QueueId) -> Result<i64, ConsumerError> {
        if self.failing.contains(queue) {
            return Err(ConsumerError::BrokerNotFound(BROKER.to_string()));
        }
        Ok(self
            .max_offsets
            .get(queue)
            .map(|v| *v)
            .unwrap_or(self.default_max))
    }

    async fn search_offset(
        &self,
        queue: &QueueId,
        _timestamp_ms: i64,
        _timeout: Duration,
    ) -> Result<i64, ConsumerError> {
        if self.failing.contains(queue) {
            return Err(ConsumerError::remote(anyhow::anyhow!("connection reset")));
        }
        let delay = *self.search_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.search_result)
    }
}

#[derive(Default)]
pub struct CountingHeartbeat {
    count: AtomicUsize,
}

impl CountingHeartbeat {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

impl HeartbeatTrigger for CountingHeartbeat {
    fn trigger_heartbeat(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct RecordingHeartbeatSink {
    sent: Mutex<Vec<(Vec<String>, Vec<String>)>>,
}

impl RecordingHeartbeatSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn sent(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    pub fn last_consumer_groups(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .last()
            .map(|(_, consumers)| consumers.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl HeartbeatSink for RecordingHeartbeatSink {
    async fn send_heartbeat(
        &self,
        producer_groups: Vec<String>,
        consumer_groups: Vec<String>,
    ) -> Result<(), ConsumerError> {
        self.sent
            .lock()
            .unwrap()
            .push((producer_groups, consumer_groups));
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingSendBack {
    sent: Mutex<Vec<MessageExt>>,
    limits: Mutex<Vec<i32>>,
    fail: std::sync::atomic::AtomicBool,
}

impl RecordingSendBack {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<MessageExt> {
        self.sent.lock().unwrap().clone()
    }

    /// Redelivery limit passed with each successful send-back.
    pub fn max_reconsume_times(&self) -> Vec<i32> {
        self.limits.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageSendBack for RecordingSendBack {
    async fn send_back(
        &self,
        message: &MessageExt,
        _delay_level: i32,
        _broker_name: &str,
        max_reconsume_times: i32,
    ) -> Result<(), ConsumerError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(ConsumerError::BrokerNotFound(BROKER.to_string()));
        }
        self.sent.lock().unwrap().push(message.clone());
        self.limits.lock().unwrap().push(max_reconsume_times);
        Ok(())
    }
}

/// Replies from a per-queue script, then "no new message" at the requested offset.
#[derive(Default)]
pub struct ScriptedTransport {
    scripts: DashMap<QueueId, VecDeque<Result<PullResponse, ConsumerError>>>,
    pulls: DashMap<QueueId, Vec<i64>>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push(&self, queue: &QueueId, response: Result<PullResponse, ConsumerError>) {
        self.scripts
            .entry(queue.clone())
            .or_default()
            .push_back(response);
    }

    /// Offsets requested for the queue, in order.
    pub fn pulls(&self, queue: &QueueId) -> Vec<i64> {
        self.pulls
            .get(queue)
            .map(|p| p.value().clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl PullTransport for ScriptedTransport {
    async fn pull(
        &self,
        _group: &str,
        queue: &QueueId,
        _expression: &str,
        offset: i64,
        _batch_size: u32,
    ) -> Result<PullResponse, ConsumerError> {
        self.pulls.entry(queue.clone()).or_default().push(offset);
        let scripted = self
            .scripts
            .get_mut(queue)
            .and_then(|mut script| script.pop_front());
        scripted.unwrap_or_else(|| Ok(no_new_message(offset)))
    }
}

pub fn no_new_message(offset: i64) -> PullResponse {
    PullResponse {
        status: PullStatus::NoNewMessage,
        next_begin_offset: offset,
        min_offset: 0,
        max_offset: offset,
        messages: Vec::new(),
    }
}

pub fn found(queue: &QueueId, offsets: std::ops::Range<i64>) -> PullResponse {
    let next = offsets.end;
    PullResponse {
        status: PullStatus::Found,
        next_begin_offset: next,
        min_offset: 0,
        max_offset: next,
        messages: offsets
            .map(|offset| MessageExt::new(queue, offset, format!("body-{offset}")))
            .collect(),
    }
}

/// Records every batch; optionally sleeps and tracks overlap per queue.
pub struct RecordingListener {
    status: Mutex<ConsumeStatus>,
    delay: Option<Duration>,
    consumed: Mutex<Vec<MessageExt>>,
    active: DashMap<QueueId, usize>,
    overlaps: AtomicUsize,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Self::with_delay(None)
    }

    pub fn with_delay(delay: Option<Duration>) -> Arc<Self> {
        Arc::new(Self {
            status: Mutex::new(ConsumeStatus::Success),
            delay,
            consumed: Mutex::new(Vec::new()),
            active: DashMap::new(),
            overlaps: AtomicUsize::new(0),
        })
    }

    pub fn set_status(&self, status: ConsumeStatus) {
        *self.status.lock().unwrap() = status;
    }

    pub fn consumed(&self) -> Vec<MessageExt> {
        self.consumed.lock().unwrap().clone()
    }

    pub fn consumed_offsets(&self, queue: &QueueId) -> Vec<i64> {
        self.consumed()
            .iter()
            .filter(|m| m.queue_id == queue.queue_id && m.broker_name == queue.broker_name)
            .map(|m| m.queue_offset)
            .collect()
    }

    pub fn overlaps(&self) -> usize {
        self.overlaps.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageListener for RecordingListener {
    async fn consume(&self, messages: &[MessageExt], ctx: &mut ConsumeContext) -> ConsumeStatus {
        {
            let mut active = self.active.entry(ctx.queue.clone()).or_insert(0);
            *active += 1;
            if *active > 1 {
                self.overlaps.fetch_add(1, Ordering::SeqCst);
            }
        }

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.consumed
            .lock()
            .unwrap()
            .extend(messages.iter().cloned());

        if let Some(mut active) = self.active.get_mut(&ctx.queue) {
            *active -= 1;
        }
        *self.status.lock().unwrap()
    }
}

/// Config for tests: pull loops idle for a minute between cycles.
pub fn test_config() -> ConsumerConfig {
    ConsumerConfig {
        pull_interval_ms: 60_000,
        ..ConsumerConfig::default()
    }
}

pub fn service_config(
    group: &str,
    store: Arc<MemoryOffsetStore>,
    send_back: Arc<RecordingSendBack>,
    listener: Arc<RecordingListener>,
) -> ConsumeServiceConfig {
    let mut config = ConsumeServiceConfig::new(group, &test_config());
    config.offset_store = Some(store as Arc<dyn OffsetStore>);
    config.message_send_back = Some(send_back as Arc<dyn MessageSendBack>);
    config.listener = Some(listener as Arc<dyn MessageListener>);
    config
}

/// A consumer wired to fresh mocks.
pub struct Harness {
    pub consumer: PushConsumer,
    pub store: Arc<MemoryOffsetStore>,
    pub allocator: Arc<ScriptedAllocator>,
    pub query: Arc<StaticOffsetQuery>,
    pub heartbeat: Arc<CountingHeartbeat>,
    pub send_back: Arc<RecordingSendBack>,
    pub transport: Arc<ScriptedTransport>,
    pub listener: Arc<RecordingListener>,
}

pub fn harness(group: &str, topics: &[&str], config: ConsumerConfig) -> Harness {
    let store = MemoryOffsetStore::new();
    let allocator = ScriptedAllocator::new();
    let query = StaticOffsetQuery::new(100);
    let heartbeat = CountingHeartbeat::new();
    let send_back = RecordingSendBack::new();
    let transport = ScriptedTransport::new();
    let listener = RecordingListener::new();

    let mut builder = PushConsumer::builder(group)
        .config(config)
        .offset_store(store.clone())
        .allocator(allocator.clone())
        .offset_query(query.clone())
        .heartbeat(heartbeat.clone())
        .send_back(send_back.clone())
        .transport(transport.clone())
        .listener(listener.clone());
    for topic in topics {
        builder = builder.subscribe(*topic, "*");
    }

    Harness {
        consumer: builder.build().unwrap(),
        store,
        allocator,
        query,
        heartbeat,
        send_back,
        transport,
        listener,
    }
}

/// Poll `condition` every 10ms for up to 2s.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

pub fn sorted(mut queues: Vec<QueueId>) -> Vec<QueueId> {
    queues.sort();
    queues
}
