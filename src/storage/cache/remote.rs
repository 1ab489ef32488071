//! Remote cache client surface and an in-process implementation.
//!
//! A remote cache only exposes whole-value operations keyed by string:
//! get, put, put-if-absent, versioned get and replace-with-version. Caches
//! holding map values may additionally be [`DeltaAwareCache`]s, replaying a
//! [`MapDelta`] on the server side.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::info;

use crate::association::RowMap;
use crate::storage::cache::delta::MapDelta;
use crate::storage::StorageError;
use crate::value::Value;

/// A cached value together with the version it was stored under.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<V> {
    pub value: V,
    pub version: u64,
}

/// Whole-value operations of one named remote cache.
pub trait RemoteCache<V>: Send + Sync {
    fn name(&self) -> &str;

    fn get(&self, key: &str) -> Result<Option<V>, StorageError>;

    fn get_versioned(&self, key: &str) -> Result<Option<Versioned<V>>, StorageError>;

    fn put(&self, key: &str, value: V) -> Result<(), StorageError>;

    /// Stores `value` only if `key` is absent. Returns `true` if stored.
    fn put_if_absent(&self, key: &str, value: V) -> Result<bool, StorageError>;

    /// Stores `value` only if the entry still has `version`. Returns `true`
    /// if stored.
    fn replace_with_version(&self, key: &str, version: u64, value: V)
        -> Result<bool, StorageError>;

    /// Returns `true` if an entry was removed.
    fn remove(&self, key: &str) -> Result<bool, StorageError>;

    /// Every key starting with `prefix`, in lexicographic order.
    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError>;
}

/// A cache of maps that can apply fine-grained changes server-side.
pub trait DeltaAwareCache<K, V>: RemoteCache<HashMap<K, V>> {
    /// Atomically applies `delta` to the entry under `key`, creating it
    /// from the delta's seed if absent.
    fn apply_delta(&self, key: &str, delta: &MapDelta<K, V>) -> Result<(), StorageError>;
}

/// In-process cache with per-entry versions.
pub struct InMemoryRemoteCache<V> {
    name: String,
    entries: DashMap<String, Versioned<V>>,
    next_version: AtomicU64,
    running: Arc<AtomicBool>,
}

impl<V> fmt::Debug for InMemoryRemoteCache<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryRemoteCache")
            .field("name", &self.name)
            .field("entries", &self.entries.len())
            .finish_non_exhaustive()
    }
}

impl<V: Clone + Send + Sync> InMemoryRemoteCache<V> {
    #[must_use]
    pub fn new(name: impl Into<String>, running: Arc<AtomicBool>) -> Self {
        Self {
            name: name.into(),
            entries: DashMap::new(),
            next_version: AtomicU64::new(1),
            running,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn version(&self) -> u64 {
        self.next_version.fetch_add(1, Ordering::Relaxed)
    }

    fn ensure_running(&self) -> Result<(), StorageError> {
        if self.running.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(StorageError::BackendUnavailable(format!(
                "cache {} has been stopped",
                self.name
            )))
        }
    }
}

impl<V: Clone + Send + Sync> RemoteCache<V> for InMemoryRemoteCache<V> {
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self, key: &str) -> Result<Option<V>, StorageError> {
        self.ensure_running()?;
        Ok(self.entries.get(key).map(|entry| entry.value.clone()))
    }

    fn get_versioned(&self, key: &str) -> Result<Option<Versioned<V>>, StorageError> {
        self.ensure_running()?;
        Ok(self.entries.get(key).map(|entry| entry.value().clone()))
    }

    fn put(&self, key: &str, value: V) -> Result<(), StorageError> {
        self.ensure_running()?;
        let version = self.version();
        self.entries
            .insert(key.to_string(), Versioned { value, version });
        Ok(())
    }

    fn put_if_absent(&self, key: &str, value: V) -> Result<bool, StorageError> {
        self.ensure_running()?;
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                let version = self.version();
                slot.insert(Versioned { value, version });
                Ok(true)
            }
        }
    }

    fn replace_with_version(
        &self,
        key: &str,
        version: u64,
        value: V,
    ) -> Result<bool, StorageError> {
        self.ensure_running()?;
        match self.entries.get_mut(key) {
            Some(mut entry) if entry.version == version => {
                *entry = Versioned {
                    value,
                    version: self.version(),
                };
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn remove(&self, key: &str) -> Result<bool, StorageError> {
        self.ensure_running()?;
        Ok(self.entries.remove(key).is_some())
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        self.ensure_running()?;
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort_unstable();
        Ok(keys)
    }
}

impl<K, V> DeltaAwareCache<K, V> for InMemoryRemoteCache<HashMap<K, V>>
where
    K: Eq + Hash + Clone + Send + Sync,
    V: Clone + Send + Sync,
{
    fn apply_delta(&self, key: &str, delta: &MapDelta<K, V>) -> Result<(), StorageError> {
        self.ensure_running()?;
        let version = self.version();
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut slot) => {
                let entry = slot.get_mut();
                delta.apply_to(&mut entry.value);
                entry.version = version;
            }
            Entry::Vacant(slot) => {
                slot.insert(Versioned {
                    value: delta.merge(None),
                    version,
                });
            }
        }
        Ok(())
    }
}

pub type EntityCache = InMemoryRemoteCache<HashMap<String, Value>>;
pub type AssociationCache = InMemoryRemoteCache<RowMap>;
pub type IdentifierCache = InMemoryRemoteCache<i64>;

/// Owns the three named caches the cache adapter works against.
#[derive(Debug)]
pub struct CacheManager {
    entities: Arc<EntityCache>,
    associations: Arc<AssociationCache>,
    identifiers: Arc<IdentifierCache>,
    running: Arc<AtomicBool>,
}

impl CacheManager {
    #[must_use]
    pub fn new(entity_store: &str, association_store: &str, identifier_store: &str) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        info!(
            entity_store,
            association_store, identifier_store, "cache manager started"
        );
        Self {
            entities: Arc::new(InMemoryRemoteCache::new(entity_store, Arc::clone(&running))),
            associations: Arc::new(InMemoryRemoteCache::new(
                association_store,
                Arc::clone(&running),
            )),
            identifiers: Arc::new(InMemoryRemoteCache::new(
                identifier_store,
                Arc::clone(&running),
            )),
            running,
        }
    }

    #[must_use]
    pub fn entities(&self) -> &Arc<EntityCache> {
        &self.entities
    }

    #[must_use]
    pub fn associations(&self) -> &Arc<AssociationCache> {
        &self.associations
    }

    #[must_use]
    pub fn identifiers(&self) -> &Arc<IdentifierCache> {
        &self.identifiers
    }

    /// Stops every cache. Later calls fail with `BackendUnavailable`.
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            info!("cache manager stopped");
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}
