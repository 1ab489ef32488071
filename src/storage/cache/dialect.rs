//! Remote-cache mapping of tuples and associations.
//!
//! An entity is the whole column map stored under its identifier in the
//! entity cache; an association is the whole row map stored under its
//! identifier in the association cache. Writes either read-modify-CAS the
//! whole value, retrying on version mismatch, or ship a [`MapDelta`] that
//! the cache replays server-side. Counters live in the identifier cache
//! and go through the optimistic [`SequenceGenerator`].

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::association::{Association, MapAssociationSnapshot, RowMap};
use crate::identifier::{association_id, entity_id, owned_association_prefix, row_id, table_prefix};
use crate::key::{AssociationKey, EntityKey, EntityKeyMetadata, RowKey};
use crate::operation::{AssociationOperation, TupleOperation};
use crate::sequence::{CounterBackend, SequenceGenerator};
use crate::storage::cache::delta::MapDelta;
use crate::storage::cache::remote::{CacheManager, DeltaAwareCache, RemoteCache, Versioned};
use crate::storage::columns::{
    apply_association_operations, apply_tuple_operations, check_row_keys, entity_key_columns,
    row_columns,
};
use crate::storage::traits::{StorageError, TupleConsumer, TupleStore};
use crate::tuple::Tuple;
use crate::value::Value;

/// How the adapter ships changes to the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheWriteMode {
    /// Read the whole value, modify it locally, replace it conditioned on
    /// the version read.
    #[default]
    CompareAndSwap,
    /// Send only the changed fields for server-side replay.
    Delta,
}

type ColumnMap = HashMap<String, Value>;

/// Counter primitives over the identifier cache.
struct IdentifierCounters<'a> {
    cache: &'a dyn RemoteCache<i64>,
}

impl CounterBackend for IdentifierCounters<'_> {
    type Token = u64;

    fn read(&self, key: &RowKey) -> Result<(Option<i64>, u64), StorageError> {
        Ok(match self.cache.get_versioned(&row_id(key))? {
            Some(Versioned { value, version }) => (Some(value), version),
            None => (None, 0),
        })
    }

    fn create(&self, key: &RowKey, _token: u64, value: i64) -> Result<bool, StorageError> {
        self.cache.put_if_absent(&row_id(key), value)
    }

    fn replace(&self, key: &RowKey, token: u64, value: i64) -> Result<bool, StorageError> {
        self.cache.replace_with_version(&row_id(key), token, value)
    }
}

/// Adapter over the three caches of a [`CacheManager`].
#[derive(Clone)]
pub struct CacheStore {
    entities: Arc<dyn DeltaAwareCache<String, Value>>,
    associations: Arc<dyn DeltaAwareCache<RowKey, ColumnMap>>,
    identifiers: Arc<dyn RemoteCache<i64>>,
    write_mode: CacheWriteMode,
    max_cas_retries: u32,
    sequences: SequenceGenerator,
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("entities", &self.entities.name())
            .field("associations", &self.associations.name())
            .field("identifiers", &self.identifiers.name())
            .field("write_mode", &self.write_mode)
            .field("max_cas_retries", &self.max_cas_retries)
            .finish()
    }
}

impl CacheStore {
    #[must_use]
    pub fn new(
        manager: &CacheManager,
        write_mode: CacheWriteMode,
        max_cas_retries: u32,
        sequences: SequenceGenerator,
    ) -> Self {
        Self {
            entities: manager.entities().clone(),
            associations: manager.associations().clone(),
            identifiers: manager.identifiers().clone(),
            write_mode,
            max_cas_retries,
            sequences,
        }
    }

    #[must_use]
    pub const fn write_mode(&self) -> CacheWriteMode {
        self.write_mode
    }

    /// Read-modify-write of one cache entry, retried on version mismatch.
    fn compare_and_swap<V, C>(
        &self,
        cache: &C,
        key: &str,
        create: impl Fn() -> V,
        mutate: impl Fn(&mut V),
    ) -> Result<(), StorageError>
    where
        C: RemoteCache<V> + ?Sized,
    {
        for attempt in 1..=self.max_cas_retries {
            let won = match cache.get_versioned(key)? {
                None => {
                    let mut value = create();
                    mutate(&mut value);
                    cache.put_if_absent(key, value)?
                }
                Some(Versioned { mut value, version }) => {
                    mutate(&mut value);
                    cache.replace_with_version(key, version, value)?
                }
            };
            if won {
                return Ok(());
            }
            trace!(cache = cache.name(), key, attempt, "cache write lost its race, retrying");
        }
        warn!(
            cache = cache.name(),
            key,
            attempts = self.max_cas_retries,
            "cache write retry cap reached"
        );
        Err(StorageError::ContentionExceeded {
            key: key.to_string(),
            attempts: self.max_cas_retries,
        })
    }

    fn tuple_delta(tuple: &Tuple, key: &EntityKey) -> MapDelta<String, Value> {
        let mut delta = MapDelta::with_seed(entity_key_columns(key));
        for operation in tuple.operations() {
            match operation {
                TupleOperation::Put { column, value } => delta.put(column.clone(), value.clone()),
                TupleOperation::PutNull { column } | TupleOperation::Remove { column } => {
                    delta.remove(column.clone());
                }
            }
        }
        delta
    }

    fn association_delta(association: &Association) -> MapDelta<RowKey, ColumnMap> {
        let mut delta = MapDelta::new();
        for operation in association.operations() {
            match operation {
                AssociationOperation::Clear => delta.clear(),
                AssociationOperation::Put { key, value } => {
                    delta.put(key.clone(), row_columns(key, value));
                }
                AssociationOperation::PutNull { key } | AssociationOperation::Remove { key } => {
                    delta.remove(key.clone());
                }
            }
        }
        delta
    }
}

impl TupleStore for CacheStore {
    fn backend_name(&self) -> &'static str {
        "cache"
    }

    fn get_tuple(&self, key: &EntityKey) -> Result<Option<Tuple>, StorageError> {
        Ok(self.entities.get(&entity_id(key))?.map(Tuple::from_columns))
    }

    fn create_tuple(&self, _key: &EntityKey) -> Tuple {
        Tuple::new()
    }

    fn update_tuple(&self, tuple: &Tuple, key: &EntityKey) -> Result<(), StorageError> {
        let id = entity_id(key);
        match self.write_mode {
            CacheWriteMode::CompareAndSwap => self.compare_and_swap(
                self.entities.as_ref(),
                &id,
                || entity_key_columns(key),
                |columns| apply_tuple_operations(columns, tuple),
            )?,
            CacheWriteMode::Delta => self
                .entities
                .apply_delta(&id, &Self::tuple_delta(tuple, key))?,
        }
        debug!(%key, mode = ?self.write_mode, "updated tuple");
        Ok(())
    }

    fn remove_tuple(&self, key: &EntityKey) -> Result<(), StorageError> {
        self.entities.remove(&entity_id(key))?;
        let owned = self
            .associations
            .keys_with_prefix(&owned_association_prefix(key))?;
        for association in &owned {
            self.associations.remove(association)?;
        }
        debug!(%key, associations = owned.len(), "removed tuple");
        Ok(())
    }

    fn get_association(&self, key: &AssociationKey) -> Result<Option<Association>, StorageError> {
        Ok(self
            .associations
            .get(&association_id(key))?
            .map(|rows: RowMap| Association::from_snapshot(MapAssociationSnapshot::new(rows))))
    }

    fn create_association(&self, _key: &AssociationKey) -> Association {
        Association::new()
    }

    fn create_tuple_association(&self, _key: &AssociationKey, _row_key: &RowKey) -> Tuple {
        Tuple::new()
    }

    fn update_association(
        &self,
        association: &Association,
        key: &AssociationKey,
    ) -> Result<(), StorageError> {
        check_row_keys(association, key)?;
        let id = association_id(key);
        match self.write_mode {
            CacheWriteMode::CompareAndSwap => self.compare_and_swap(
                self.associations.as_ref(),
                &id,
                RowMap::new,
                |rows| apply_association_operations(rows, association),
            )?,
            CacheWriteMode::Delta => self
                .associations
                .apply_delta(&id, &Self::association_delta(association))?,
        }
        debug!(%key, mode = ?self.write_mode, "updated association");
        Ok(())
    }

    fn remove_association(&self, key: &AssociationKey) -> Result<(), StorageError> {
        let removed = self.associations.remove(&association_id(key))?;
        debug!(%key, removed, "removed association");
        Ok(())
    }

    fn next_value(&self, key: &RowKey, increment: i64, initial: i64) -> Result<i64, StorageError> {
        let counters = IdentifierCounters {
            cache: self.identifiers.as_ref(),
        };
        self.sequences.next_value(&counters, key, increment, initial)
    }

    fn for_each_tuple(
        &self,
        consumer: &mut TupleConsumer<'_>,
        tables: &[EntityKeyMetadata],
    ) -> Result<(), StorageError> {
        for table in tables {
            for id in self.entities.keys_with_prefix(&table_prefix(table.table()))? {
                if let Some(columns) = self.entities.get(&id)? {
                    consumer(Tuple::from_columns(columns))?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::AssociationKeyMetadata;

    fn store(mode: CacheWriteMode) -> (Arc<CacheManager>, CacheStore) {
        let manager = Arc::new(CacheManager::new("entities", "associations", "ids"));
        let store = CacheStore::new(&manager, mode, 8, SequenceGenerator::default());
        (manager, store)
    }

    fn actor(id: i64) -> EntityKey {
        EntityKey::new("Actor", ["id"], [id])
    }

    #[test]
    fn test_entity_is_stored_under_its_identifier() {
        for mode in [CacheWriteMode::CompareAndSwap, CacheWriteMode::Delta] {
            let (manager, store) = store(mode);
            let mut tuple = Tuple::new();
            tuple.put("name", "Hamlet");
            store.update_tuple(&tuple, &actor(42)).unwrap();

            let raw = manager.entities().get("Actor:id_:i42_").unwrap().unwrap();
            assert_eq!(raw.get("name"), Some(&Value::from("Hamlet")));
            assert_eq!(raw.get("id"), Some(&Value::Int(42)));
        }
    }

    #[test]
    fn test_delta_and_cas_agree() {
        let (_, cas) = store(CacheWriteMode::CompareAndSwap);
        let (_, delta) = store(CacheWriteMode::Delta);
        for store in [&cas, &delta] {
            let mut tuple = Tuple::new();
            tuple.put("a", 1);
            tuple.put("b", 2);
            store.update_tuple(&tuple, &actor(1)).unwrap();
            let mut tuple = store.get_tuple(&actor(1)).unwrap().unwrap();
            tuple.remove("a");
            tuple.remove("never");
            store.update_tuple(&tuple, &actor(1)).unwrap();
        }
        assert_eq!(
            cas.get_tuple(&actor(1)).unwrap().unwrap().to_map(),
            delta.get_tuple(&actor(1)).unwrap().unwrap().to_map()
        );
    }

    #[test]
    fn test_remove_tuple_scans_owned_associations() {
        let (manager, store) = store(CacheWriteMode::CompareAndSwap);
        let meta = AssociationKeyMetadata::new("Actor_Film", ["film_id"]);
        for (owner, role) in [(4, "films"), (4, "awards"), (45, "films")] {
            let key = AssociationKey::new(actor(owner), role, meta.clone());
            let mut association = Association::new();
            association.put(RowKey::new("Actor_Film", ["film_id"], [1i64]), Tuple::new());
            store.update_association(&association, &key).unwrap();
        }
        assert_eq!(manager.associations().len(), 3);

        store.remove_tuple(&actor(4)).unwrap();
        assert_eq!(manager.associations().len(), 1);
        assert!(store
            .get_association(&AssociationKey::new(actor(45), "films", meta))
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_sequence_lives_in_identifier_cache() {
        let (manager, store) = store(CacheWriteMode::Delta);
        let key = RowKey::sequence("seq");
        assert_eq!(store.next_value(&key, 1, 5).unwrap(), 5);
        assert_eq!(store.next_value(&key, 1, 5).unwrap(), 6);
        assert_eq!(manager.identifiers().get("seq::").unwrap(), Some(7));
    }

    #[test]
    fn test_stopped_caches_are_unavailable() {
        let (manager, store) = store(CacheWriteMode::CompareAndSwap);
        manager.stop();
        assert!(matches!(
            store.next_value(&RowKey::sequence("seq"), 1, 0),
            Err(StorageError::BackendUnavailable(_))
        ));
    }
}
