//! Fine-grained change sets for map-valued cache entries.
//!
//! Shipping a whole entity or association map on every write is wasteful
//! when only a field changed. A [`MapDelta`] records per-key changes
//! client-side so a delta-aware cache can replay them against the stored
//! map atomically on the server.

use std::collections::HashMap;
use std::hash::Hash;

/// One recorded change.
#[derive(Debug, Clone, PartialEq)]
pub enum DeltaOperation<K, V> {
    Put(K, V),
    Remove(K),
    Clear,
}

/// Ordered changes to a map, plus the map to start from if the entry does
/// not exist yet.
#[derive(Debug, Clone)]
pub struct MapDelta<K, V> {
    seed: HashMap<K, V>,
    operations: Vec<DeltaOperation<K, V>>,
}

impl<K, V> Default for MapDelta<K, V> {
    fn default() -> Self {
        Self {
            seed: HashMap::new(),
            operations: Vec::new(),
        }
    }
}

impl<K: Eq + Hash + Clone, V: Clone> MapDelta<K, V> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A delta whose entry starts as `seed` when it is absent.
    #[must_use]
    pub fn with_seed(seed: HashMap<K, V>) -> Self {
        Self {
            seed,
            operations: Vec::new(),
        }
    }

    pub fn put(&mut self, key: K, value: V) {
        self.operations.push(DeltaOperation::Put(key, value));
    }

    pub fn remove(&mut self, key: K) {
        self.operations.push(DeltaOperation::Remove(key));
    }

    pub fn clear(&mut self) {
        self.operations.push(DeltaOperation::Clear);
    }

    #[must_use]
    pub fn seed(&self) -> &HashMap<K, V> {
        &self.seed
    }

    #[must_use]
    pub fn operations(&self) -> &[DeltaOperation<K, V>] {
        &self.operations
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Replays every change onto `map`.
    pub fn apply_to(&self, map: &mut HashMap<K, V>) {
        for operation in &self.operations {
            match operation {
                DeltaOperation::Put(key, value) => {
                    map.insert(key.clone(), value.clone());
                }
                DeltaOperation::Remove(key) => {
                    map.remove(key);
                }
                DeltaOperation::Clear => map.clear(),
            }
        }
    }

    /// The map that results from applying this delta to `existing`, or to
    /// the seed when there is no existing entry.
    #[must_use]
    pub fn merge(&self, existing: Option<&HashMap<K, V>>) -> HashMap<K, V> {
        let mut map = existing.unwrap_or(&self.seed).clone();
        self.apply_to(&mut map);
        map
    }
}
