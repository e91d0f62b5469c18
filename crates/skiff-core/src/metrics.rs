use metrics::{counter, gauge, histogram};

pub fn record_queue_added(topic: &str) {
    counter!("skiff_queues_added_total", "topic" => topic.to_string()).increment(1);
}

pub fn record_queue_removed(topic: &str) {
    counter!("skiff_queues_removed_total", "topic" => topic.to_string()).increment(1);
}

pub fn record_queue_expired(topic: &str) {
    counter!("skiff_queues_expired_total", "topic" => topic.to_string()).increment(1);
}

pub fn record_rebalance_changed(topic: &str) {
    counter!("skiff_rebalance_changes_total", "topic" => topic.to_string()).increment(1);
}

pub fn record_offset_init_failed(topic: &str) {
    counter!("skiff_offset_init_failures_total", "topic" => topic.to_string()).increment(1);
}

pub fn record_pull_request_dispatched(topic: &str) {
    counter!("skiff_pull_requests_dispatched_total", "topic" => topic.to_string()).increment(1);
}

pub fn record_messages_pulled(topic: &str, count: usize) {
    counter!("skiff_messages_pulled_total", "topic" => topic.to_string()).increment(count as u64);
}

pub fn record_consume_success(topic: &str, count: usize) {
    counter!("skiff_consume_success_total", "topic" => topic.to_string()).increment(count as u64);
}

pub fn record_consume_retry(topic: &str, count: usize) {
    counter!("skiff_consume_retry_total", "topic" => topic.to_string()).increment(count as u64);
}

pub fn record_consume_latency(topic: &str, latency_ms: f64) {
    histogram!("skiff_consume_latency_ms", "topic" => topic.to_string()).record(latency_ms);
}

pub fn set_owned_queues(group: &str, count: f64) {
    gauge!("skiff_owned_queues", "group" => group.to_string()).set(count);
}

pub fn set_subscription_version(topic: &str, version: i64) {
    gauge!("skiff_subscription_version", "topic" => topic.to_string()).set(version as f64);
}
