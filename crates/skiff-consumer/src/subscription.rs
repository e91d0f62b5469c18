use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use skiff_core::{SubscriptionData, now_millis};

/// Topics a group subscribes to, with their versions.
#[derive(Default)]
pub struct SubscriptionTable {
    entries: DashMap<String, SubscriptionData>,
}

impl SubscriptionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe unless already subscribed; returns whether it was added.
    pub fn subscribe(&self, topic: &str, expression: &str) -> bool {
        match self.entries.entry(topic.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(SubscriptionData::new(topic, expression));
                true
            }
        }
    }

    pub fn unsubscribe(&self, topic: &str) -> Option<SubscriptionData> {
        self.entries.remove(topic).map(|(_, data)| data)
    }

    pub fn get(&self, topic: &str) -> Option<SubscriptionData> {
        self.entries.get(topic).map(|entry| entry.value().clone())
    }

    pub fn topics(&self) -> Vec<String> {
        self.entries.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn snapshot(&self) -> Vec<SubscriptionData> {
        self.entries.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Move the topic's version to the current time in ms, strictly past the previous one.
    /// Returns `(old, new)`, or `None` when the topic is not subscribed.
    pub fn bump_version(&self, topic: &str) -> Option<(i64, i64)> {
        let mut entry = self.entries.get_mut(topic)?;
        let old = entry.version;
        let new = now_millis().max(old + 1);
        entry.version = new;
        Some((old, new))
    }
}
