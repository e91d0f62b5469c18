use std::sync::Arc;
use std::time::Duration;

use skiff_consumer::collab::{MessageListener, MessageSendBack};
use skiff_consumer::{ConsumeService, ConsumeServiceConfig, ProcessQueue};
use skiff_core::{
    ConsumeStatus, ConsumerConfig, ConsumerError, MessageExt, PROPERTY_RETRY_TOPIC, now_millis,
    retry_topic,
};

use crate::mocks::{
    MemoryOffsetStore, RecordingListener, RecordingSendBack, eventually, queue, service_config,
};

struct Fixture {
    service: Arc<ConsumeService>,
    store: Arc<MemoryOffsetStore>,
    send_back: Arc<RecordingSendBack>,
    listener: Arc<RecordingListener>,
}

fn fixture(tune: impl FnOnce(&mut ConsumeServiceConfig)) -> Fixture {
    let store = MemoryOffsetStore::new();
    let send_back = RecordingSendBack::new();
    let listener = RecordingListener::new();
    let mut config = service_config("orders-group", store.clone(), send_back.clone(), listener.clone());
    tune(&mut config);

    Fixture {
        service: ConsumeService::new(config).unwrap(),
        store,
        send_back,
        listener,
    }
}

fn buffered(pq: &ProcessQueue, offsets: std::ops::Range<i64>) -> Vec<MessageExt> {
    let q = queue("orders", 0);
    let messages: Vec<MessageExt> = offsets
        .map(|offset| MessageExt::new(&q, offset, "payload"))
        .collect();
    pq.put_messages(messages.clone());
    messages
}

#[tokio::test]
async fn test_new_rejects_missing_collaborators() {
    let base = ConsumeServiceConfig::new("orders-group", &ConsumerConfig::default());

    let mut config = base.clone();
    config.group = String::new();
    assert!(matches!(
        ConsumeService::new(config),
        Err(ConsumerError::EmptyGroup)
    ));

    let result = ConsumeService::new(base.clone());
    assert!(matches!(
        result,
        Err(ConsumerError::MissingCollaborator("message send-back"))
    ));

    let mut config = base;
    config.message_send_back = Some(RecordingSendBack::new() as Arc<dyn MessageSendBack>);
    config.listener = Some(RecordingListener::new() as Arc<dyn MessageListener>);
    assert!(matches!(
        ConsumeService::new(config),
        Err(ConsumerError::MissingCollaborator("offset store"))
    ));
}

#[tokio::test]
async fn test_insert_twice_inserts_once() {
    let f = fixture(|_| {});
    let q = queue("orders", 1);

    let (first, inserted) = f.service.insert_new_message_queue(&q);
    assert!(inserted);
    let (second, inserted_again) = f.service.insert_new_message_queue(&q);
    assert!(!inserted_again);
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(f.service.owned_count(), 1);
}

#[tokio::test]
async fn test_remove_persists_forgets_and_drops() {
    let f = fixture(|_| {});
    let q = queue("orders", 1);
    let (pq, _) = f.service.insert_new_message_queue(&q);

    assert!(f.service.remove_old_message_queue(&q).await);
    assert!(pq.is_dropped());
    assert_eq!(f.store.persisted(), vec![q.clone()]);
    assert_eq!(f.store.forgotten(), vec![q.clone()]);
    assert!(f.service.message_queues().is_empty());

    // Second removal is a no-op
    assert!(!f.service.remove_old_message_queue(&q).await);
    assert_eq!(f.store.persisted().len(), 1);
}

#[tokio::test]
async fn test_reacquired_queue_gets_fresh_process_queue() {
    let f = fixture(|_| {});
    let q = queue("orders", 1);
    let (old, _) = f.service.insert_new_message_queue(&q);
    f.service.remove_old_message_queue(&q).await;

    let (fresh, inserted) = f.service.insert_new_message_queue(&q);
    assert!(inserted);
    assert!(old.is_dropped());
    assert!(!fresh.is_dropped());
}

#[tokio::test]
async fn test_drop_expired_process_queues() {
    let f = fixture(|_| {});
    let stale = queue("orders", 1);
    let fresh = queue("orders", 2);
    let (stale_pq, _) = f.service.insert_new_message_queue(&stale);
    f.service.insert_new_message_queue(&fresh);
    stale_pq.set_last_pull_timestamp(now_millis() - 121_000);

    let removed = f.service.drop_expired_process_queues().await;
    assert_eq!(removed, vec![stale.clone()]);
    assert!(stale_pq.is_dropped());
    assert_eq!(f.service.message_queues(), vec![fresh]);
    assert_eq!(f.store.persisted(), vec![stale]);
}

#[tokio::test]
async fn test_expiry_spares_queue_reacquired_since_scan() {
    let f = fixture(|_| {});
    let q = queue("orders", 1);
    let (stale_pq, _) = f.service.insert_new_message_queue(&q);
    stale_pq.set_last_pull_timestamp(now_millis() - 121_000);

    // A rebalance releases and takes the queue again before the sweep gets to it
    assert!(f.service.remove_old_message_queue(&q).await);
    let (fresh_pq, inserted) = f.service.insert_new_message_queue(&q);
    assert!(inserted);

    assert!(!f.service.drop_if_pull_expired(&q).await);
    assert!(!fresh_pq.is_dropped());
    assert_eq!(f.service.message_queues(), vec![q.clone()]);

    fresh_pq.set_last_pull_timestamp(now_millis() - 121_000);
    assert!(f.service.drop_if_pull_expired(&q).await);
    assert!(fresh_pq.is_dropped());
    assert_eq!(f.service.owned_count(), 0);
}

#[tokio::test]
async fn test_sweep_removes_stale_queue_without_rebalance() {
    let f = fixture(|config| {
        config.sweep_interval = Duration::from_millis(20);
        config.pull_expired_interval = Duration::from_millis(100);
    });
    let q = queue("orders", 1);
    let (pq, _) = f.service.insert_new_message_queue(&q);
    pq.set_last_pull_timestamp(now_millis() - 1_000);

    f.service.start();
    let service = f.service.clone();
    assert!(eventually(|| service.owned_count() == 0).await);
    assert!(pq.is_dropped());

    f.service.shutdown().await;
}

#[tokio::test]
async fn test_successful_consume_advances_offset() {
    let f = fixture(|_| {});
    let q = queue("orders", 0);
    let (pq, _) = f.service.insert_new_message_queue(&q);
    let messages = buffered(&pq, 0..3);

    f.service.submit_consume_request(messages, pq.clone(), q.clone());

    let store = f.store.clone();
    let watched = q.clone();
    assert!(eventually(|| store.cached(&watched) == Some(3)).await);
    assert_eq!(pq.message_count(), 0);
    assert_eq!(f.listener.consumed_offsets(&q), vec![0, 1, 2]);
    assert!(f.send_back.sent().is_empty());
}

#[tokio::test]
async fn test_retry_later_sends_messages_back() {
    let f = fixture(|_| {});
    f.listener.set_status(ConsumeStatus::RetryLater);
    let q = queue("orders", 0);
    let (pq, _) = f.service.insert_new_message_queue(&q);
    let messages = buffered(&pq, 5..7);

    f.service.submit_consume_request(messages, pq.clone(), q.clone());

    let send_back = f.send_back.clone();
    assert!(eventually(|| send_back.sent().len() == 2).await);
    let store = f.store.clone();
    let watched = q.clone();
    assert!(eventually(|| store.cached(&watched) == Some(7)).await);
    assert_eq!(f.send_back.max_reconsume_times(), vec![-1, -1]);
}

#[tokio::test]
async fn test_send_back_carries_max_reconsume_times() {
    let f = fixture(|config| {
        config.max_reconsume_times = 3;
    });
    f.listener.set_status(ConsumeStatus::RetryLater);
    let q = queue("orders", 0);
    let (pq, _) = f.service.insert_new_message_queue(&q);
    let messages = buffered(&pq, 0..1);

    f.service.submit_consume_request(messages, pq, q);

    let send_back = f.send_back.clone();
    assert!(eventually(|| send_back.sent().len() == 1).await);
    assert_eq!(f.send_back.max_reconsume_times(), vec![3]);
}

#[tokio::test]
async fn test_failed_send_back_is_consumed_locally_later() {
    let f = fixture(|config| {
        config.send_back_retry_delay = Duration::from_millis(20);
    });
    f.listener.set_status(ConsumeStatus::RetryLater);
    f.send_back.set_failing(true);
    let q = queue("orders", 0);
    let (pq, _) = f.service.insert_new_message_queue(&q);
    let messages = buffered(&pq, 0..1);

    f.service.submit_consume_request(messages, pq.clone(), q.clone());

    let listener = f.listener.clone();
    assert!(eventually(|| listener.consumed().len() >= 2).await);
    f.listener.set_status(ConsumeStatus::Success);

    let consumed = f.listener.consumed();
    assert_eq!(consumed[0].reconsume_times, 0);
    assert_eq!(consumed[1].reconsume_times, 1);
    assert!(f.send_back.sent().is_empty());
}

#[tokio::test]
async fn test_dropped_queue_is_not_consumed() {
    let f = fixture(|_| {});
    let q = queue("orders", 0);
    let (pq, _) = f.service.insert_new_message_queue(&q);
    let messages = buffered(&pq, 0..2);
    pq.mark_dropped();

    f.service.submit_consume_request(messages, pq, q);
    f.service.shutdown().await;

    assert!(f.listener.consumed().is_empty());
}

#[tokio::test]
async fn test_consume_batches_respect_batch_size() {
    let f = fixture(|config| config.consume_batch_max_size = 2);
    let q = queue("orders", 0);
    let (pq, _) = f.service.insert_new_message_queue(&q);
    let messages = buffered(&pq, 0..5);

    f.service.submit_consume_request(messages, pq, q.clone());
    f.service.shutdown().await;

    assert_eq!(f.listener.consumed_offsets(&q), vec![0, 1, 2, 3, 4]);
    assert_eq!(f.store.cached(&q), Some(5));
}

#[tokio::test]
async fn test_reset_retry_topic_restores_original_topic() {
    let f = fixture(|_| {});
    let q = queue(&retry_topic("orders-group"), 0);

    let mut redelivered = MessageExt::new(&q, 0, "payload");
    redelivered
        .properties
        .insert(PROPERTY_RETRY_TOPIC.to_string(), "orders".to_string());
    let mut unrelated = MessageExt::new(&queue("payments", 0), 0, "payload");
    unrelated
        .properties
        .insert(PROPERTY_RETRY_TOPIC.to_string(), "orders".to_string());

    let mut batch = vec![redelivered, unrelated];
    f.service.reset_retry_topic(&mut batch);

    assert_eq!(batch[0].topic, "orders");
    assert_eq!(batch[1].topic, "payments");
}

#[tokio::test]
async fn test_shutdown_waits_for_inflight_consumption() {
    let store = MemoryOffsetStore::new();
    let listener = RecordingListener::with_delay(Some(Duration::from_millis(50)));
    let config = service_config("orders-group", store, RecordingSendBack::new(), listener.clone());
    let service = ConsumeService::new(config).unwrap();

    let q = queue("orders", 0);
    let (pq, _) = service.insert_new_message_queue(&q);
    let messages = buffered(&pq, 0..3);
    service.submit_consume_request(messages, pq, q);

    service.shutdown().await;
    assert_eq!(listener.consumed().len(), 3);
}
