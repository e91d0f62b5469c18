use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use skiff_core::{MessageExt, now_millis};

/// Buffered-but-unconsumed messages of one queue, keyed by queue offset.
#[derive(Default)]
struct MessageWindow {
    messages: BTreeMap<i64, MessageExt>,
    bytes: usize,
    max_offset: i64,
}

impl MessageWindow {
    fn span(&self) -> i64 {
        match (self.messages.first_key_value(), self.messages.last_key_value()) {
            (Some((first, _)), Some((last, _))) => last - first,
            _ => 0,
        }
    }
}

/// Local pull/consume state of one owned queue.
///
/// Once dropped it stays dropped; a reacquired queue gets a fresh instance.
pub struct ProcessQueue {
    window: Mutex<MessageWindow>,
    last_pull_ms: AtomicI64,
    last_consume_ms: AtomicI64,
    dropped: AtomicBool,
}

/// Serializable view of a process queue, used by running info.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessQueueInfo {
    pub message_count: usize,
    pub message_bytes: usize,
    pub min_offset: Option<i64>,
    pub max_offset: Option<i64>,
    pub max_span: i64,
    pub last_pull_timestamp: i64,
    pub last_consume_timestamp: i64,
    pub dropped: bool,
}

impl ProcessQueue {
    pub fn new() -> Self {
        let now = now_millis();
        Self {
            window: Mutex::new(MessageWindow::default()),
            last_pull_ms: AtomicI64::new(now),
            last_consume_ms: AtomicI64::new(now),
            dropped: AtomicBool::new(false),
        }
    }

    fn window(&self) -> MutexGuard<'_, MessageWindow> {
        self.window.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Buffer pulled messages. Returns how many were new (offsets already buffered are skipped).
    pub fn put_messages(&self, messages: Vec<MessageExt>) -> usize {
        let mut window = self.window();
        let mut added = 0;
        for message in messages {
            let offset = message.queue_offset;
            let size = message.size();
            if window.messages.insert(offset, message).is_none() {
                window.bytes += size;
                added += 1;
            }
            window.max_offset = window.max_offset.max(offset);
        }
        added
    }

    /// Remove consumed messages and return the offset consumption may advance to:
    /// the smallest offset still buffered, or one past the largest ever buffered
    /// once the window is empty. `None` when the window was already empty.
    pub fn remove_messages(&self, messages: &[MessageExt]) -> Option<i64> {
        let mut window = self.window();
        if window.messages.is_empty() {
            return None;
        }

        let mut result = window.max_offset + 1;
        for message in messages {
            if let Some(removed) = window.messages.remove(&message.queue_offset) {
                window.bytes -= removed.size();
            }
        }
        if let Some((&first, _)) = window.messages.first_key_value() {
            result = first;
        }
        Some(result)
    }

    pub fn message_count(&self) -> usize {
        self.window().messages.len()
    }

    pub fn message_bytes(&self) -> usize {
        self.window().bytes
    }

    /// Distance between the first and last buffered offsets.
    pub fn max_span(&self) -> i64 {
        self.window().span()
    }

    pub fn mark_dropped(&self) {
        self.dropped.store(true, Ordering::SeqCst);
    }

    pub fn is_dropped(&self) -> bool {
        self.dropped.load(Ordering::SeqCst)
    }

    pub fn update_pull_timestamp(&self) {
        self.set_last_pull_timestamp(now_millis());
    }

    pub fn set_last_pull_timestamp(&self, timestamp_ms: i64) {
        self.last_pull_ms.store(timestamp_ms, Ordering::SeqCst);
    }

    pub fn last_pull_timestamp(&self) -> i64 {
        self.last_pull_ms.load(Ordering::SeqCst)
    }

    pub fn update_consume_timestamp(&self) {
        self.last_consume_ms.store(now_millis(), Ordering::SeqCst);
    }

    pub fn last_consume_timestamp(&self) -> i64 {
        self.last_consume_ms.load(Ordering::SeqCst)
    }

    /// Whether no pull happened within `interval`.
    pub fn is_pull_expired(&self, interval: Duration) -> bool {
        now_millis() - self.last_pull_timestamp() > interval.as_millis() as i64
    }

    pub fn info(&self) -> ProcessQueueInfo {
        let window = self.window();
        ProcessQueueInfo {
            message_count: window.messages.len(),
            message_bytes: window.bytes,
            min_offset: window.messages.first_key_value().map(|(offset, _)| *offset),
            max_offset: window.messages.last_key_value().map(|(offset, _)| *offset),
            max_span: window.span(),
            last_pull_timestamp: self.last_pull_timestamp(),
            last_consume_timestamp: self.last_consume_timestamp(),
            dropped: self.is_dropped(),
        }
    }
}

impl Default for ProcessQueue {
    fn default() -> Self {
        Self::new()
    }
}
