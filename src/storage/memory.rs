//! In-memory map backend.
//!
//! [`MapDatastore`] keeps entities, associations and counters in sharded
//! concurrent maps; [`MapStore`] is the adapter over it. Writes to
//! different keys land in independent shards and never contend. This is
//! the reference backend used for embedded usage and tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info};

use crate::association::{Association, MapAssociationSnapshot, RowMap};
use crate::key::{AssociationKey, EntityKey, EntityKeyMetadata, RowKey};
use crate::storage::columns::{
    apply_association_operations, apply_tuple_operations, check_row_keys, entity_key_columns,
};
use crate::storage::traits::{StorageError, TupleConsumer, TupleStore};
use crate::tuple::Tuple;
use crate::value::Value;

/// Process-local map-of-maps store.
#[derive(Debug)]
pub struct MapDatastore {
    entities: DashMap<EntityKey, HashMap<String, Value>>,
    associations: DashMap<AssociationKey, RowMap>,
    sequences: DashMap<RowKey, i64>,
    running: AtomicBool,
}

impl Default for MapDatastore {
    fn default() -> Self {
        Self::new()
    }
}

impl MapDatastore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entities: DashMap::new(),
            associations: DashMap::new(),
            sequences: DashMap::new(),
            running: AtomicBool::new(true),
        }
    }

    /// Stops the store. Every later call fails with `BackendUnavailable`.
    pub fn shutdown(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            info!("map datastore stopped");
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn ensure_running(&self) -> Result<(), StorageError> {
        if self.is_running() {
            Ok(())
        } else {
            Err(StorageError::BackendUnavailable(
                "map datastore has been shut down".to_string(),
            ))
        }
    }

    /// Number of stored entities, across all tables.
    #[must_use]
    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    /// Number of stored associations, across all owners.
    #[must_use]
    pub fn association_count(&self) -> usize {
        self.associations.len()
    }
}

/// Adapter over a shared [`MapDatastore`].
#[derive(Debug, Clone)]
pub struct MapStore {
    datastore: Arc<MapDatastore>,
}

impl MapStore {
    #[must_use]
    pub fn new(datastore: Arc<MapDatastore>) -> Self {
        Self { datastore }
    }

    #[must_use]
    pub fn datastore(&self) -> &Arc<MapDatastore> {
        &self.datastore
    }
}

impl TupleStore for MapStore {
    fn backend_name(&self) -> &'static str {
        "map"
    }

    fn get_tuple(&self, key: &EntityKey) -> Result<Option<Tuple>, StorageError> {
        self.datastore.ensure_running()?;
        Ok(self
            .datastore
            .entities
            .get(key)
            .map(|columns| Tuple::from_columns(columns.clone())))
    }

    fn create_tuple(&self, _key: &EntityKey) -> Tuple {
        Tuple::new()
    }

    fn update_tuple(&self, tuple: &Tuple, key: &EntityKey) -> Result<(), StorageError> {
        self.datastore.ensure_running()?;
        let mut record = self
            .datastore
            .entities
            .entry(key.clone())
            .or_insert_with(|| entity_key_columns(key));
        apply_tuple_operations(record.value_mut(), tuple);
        debug!(%key, operations = tuple.operations().len(), "updated tuple");
        Ok(())
    }

    fn remove_tuple(&self, key: &EntityKey) -> Result<(), StorageError> {
        self.datastore.ensure_running()?;
        self.datastore.entities.remove(key);
        self.datastore
            .associations
            .retain(|association, _| association.entity_key() != key);
        debug!(%key, "removed tuple");
        Ok(())
    }

    fn get_association(&self, key: &AssociationKey) -> Result<Option<Association>, StorageError> {
        self.datastore.ensure_running()?;
        Ok(self.datastore.associations.get(key).map(|rows| {
            Association::from_snapshot(MapAssociationSnapshot::new(rows.clone()))
        }))
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
        self.datastore.ensure_running()?;
        check_row_keys(association, key)?;
        let mut rows = self.datastore.associations.entry(key.clone()).or_default();
        apply_association_operations(rows.value_mut(), association);
        debug!(%key, operations = association.operations().len(), "updated association");
        Ok(())
    }

    fn remove_association(&self, key: &AssociationKey) -> Result<(), StorageError> {
        self.datastore.ensure_running()?;
        self.datastore.associations.remove(key);
        debug!(%key, "removed association");
        Ok(())
    }

    fn next_value(&self, key: &RowKey, increment: i64, initial: i64) -> Result<i64, StorageError> {
        self.datastore.ensure_running()?;
        let overflow = |current: i64| {
            StorageError::BackendError(format!(
                "sequence {key} overflows adding {increment} to {current}"
            ))
        };
        match self.datastore.sequences.entry(key.clone()) {
            Entry::Occupied(mut counter) => {
                let current = *counter.get();
                counter.insert(current.checked_add(increment).ok_or_else(|| overflow(current))?);
                Ok(current)
            }
            Entry::Vacant(counter) => {
                counter.insert(initial.checked_add(increment).ok_or_else(|| overflow(initial))?);
                Ok(initial)
            }
        }
    }

    fn for_each_tuple(
        &self,
        consumer: &mut TupleConsumer<'_>,
        tables: &[EntityKeyMetadata],
    ) -> Result<(), StorageError> {
        for table in tables {
            self.datastore.ensure_running()?;
            // Shard guards must not be held while the consumer runs.
            let keys: Vec<EntityKey> = self
                .datastore
                .entities
                .iter()
                .filter(|entry| entry.key().table() == table.table())
                .map(|entry| entry.key().clone())
                .collect();
            for key in keys {
                let tuple = self
                    .datastore
                    .entities
                    .get(&key)
                    .map(|columns| Tuple::from_columns(columns.clone()));
                if let Some(tuple) = tuple {
                    consumer(tuple)?;
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

    fn store() -> MapStore {
        MapStore::new(Arc::new(MapDatastore::new()))
    }

    fn actor(id: i64) -> EntityKey {
        EntityKey::new("Actor", ["id"], [id])
    }

    #[test]
    fn test_update_creates_record_with_key_columns() {
        let store = store();
        let mut tuple = store.create_tuple(&actor(42));
        tuple.put("name", "Hamlet");
        store.update_tuple(&tuple, &actor(42)).unwrap();

        let loaded = store.get_tuple(&actor(42)).unwrap().unwrap();
        assert_eq!(loaded.get("id"), Some(&Value::Int(42)));
        assert_eq!(loaded.get("name"), Some(&Value::from("Hamlet")));
        assert_eq!(store.datastore().entity_count(), 1);
    }

    #[test]
    fn test_remove_tuple_drops_owned_associations_only() {
        let store = store();
        let meta = AssociationKeyMetadata::new("Actor_Film", ["film_id"]);
        let mine = AssociationKey::new(actor(1), "films", meta.clone());
        let theirs = AssociationKey::new(actor(2), "films", meta);

        for key in [&mine, &theirs] {
            let mut association = store.create_association(key);
            let row = RowKey::new("Actor_Film", ["film_id"], [7i64]);
            association.put(row.clone(), store.create_tuple_association(key, &row));
            store.update_association(&association, key).unwrap();
        }

        store.remove_tuple(&actor(1)).unwrap();
        assert!(store.get_association(&mine).unwrap().is_none());
        assert!(store.get_association(&theirs).unwrap().is_some());
        assert_eq!(store.datastore().association_count(), 1);
    }

    #[test]
    fn test_sequence_uses_atomic_entry() {
        let store = store();
        let key = RowKey::sequence("seq");
        assert_eq!(store.next_value(&key, 2, 10).unwrap(), 10);
        assert_eq!(store.next_value(&key, 2, 10).unwrap(), 12);
    }

    #[test]
    fn test_shutdown_rejects_calls() {
        let store = store();
        store.datastore().shutdown();
        assert!(matches!(
            store.get_tuple(&actor(1)),
            Err(StorageError::BackendUnavailable(_))
        ));
    }
}
