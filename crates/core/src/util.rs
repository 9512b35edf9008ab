use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

/// Removal of a key that is not present.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[error("key not present")]
pub struct NotFound;

/// Fixed-capacity map that remembers the order in which keys were inserted
/// or last updated. Inserting a new key at capacity evicts the entry that
/// was touched longest ago. There is no time-based expiry.
#[derive(Debug)]
pub struct BoundedMap<K, V> {
    limit: usize,
    entries: HashMap<K, V>,
    /// Touch order, oldest first.
    order: VecDeque<K>,
}

impl<K, V> BoundedMap<K, V>
where
    K: Eq + Hash + Clone,
{
    pub fn new(limit: usize) -> Self {
        BoundedMap {
            limit,
            entries: HashMap::with_capacity(limit.min(1024)),
            order: VecDeque::with_capacity(limit.min(1024)),
        }
    }

    /// Inserts or updates an entry, returning the previous value for the
    /// key if there was one. Updating an existing key moves it to the
    /// most-recently-used position without changing the map's size.
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        if self.entries.contains_key(&key) {
            self.order.retain(|k| *k != key);
            self.order.push_back(key.clone());
            return self.entries.insert(key, value);
        }
        if self.order.len() == self.limit {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
        self.order.push_back(key.clone());
        self.entries.insert(key, value)
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn remove(&mut self, key: &K) -> Result<V, NotFound> {
        let value = self.entries.remove(key).ok_or(NotFound)?;
        self.order.retain(|k| k != key);
        Ok(value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
