use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

/// Concurrent group-name keyed collection with insert-if-absent semantics.
///
/// Backs the producer, consumer and admin registries of a client instance.
pub struct Registry<T> {
    entries: DashMap<String, T>,
}

impl<T: Clone> Registry<T> {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Insert `value` under `group` unless the group is taken.
    /// On conflict the already registered value is returned in `Err`.
    pub fn put_if_absent(&self, group: &str, value: T) -> Result<(), T> {
        match self.entries.entry(group.to_string()) {
            Entry::Occupied(existing) => Err(existing.get().clone()),
            Entry::Vacant(slot) => {
                slot.insert(value);
                Ok(())
            }
        }
    }

    pub fn get(&self, group: &str) -> Option<T> {
        self.entries.get(group).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, group: &str) -> bool {
        self.entries.contains_key(group)
    }

    pub fn delete(&self, group: &str) -> Option<T> {
        self.entries.remove(group).map(|(_, value)| value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Copy of every registered value; no lock is held once this returns.
    pub fn snapshot(&self) -> Vec<T> {
        self.entries
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn groups(&self) -> Vec<String> {
        self.entries.iter().map(|entry| entry.key().clone()).collect()
    }
}

impl<T: Clone> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}
