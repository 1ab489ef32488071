//! Graph-shaped mapping of tuples and associations.
//!
//! An entity is a vertex whose properties are its columns, registered in
//! the vertex index under its table and key columns. Every row of a
//! to-many association is an edge from the owner vertex to a per-row target
//! vertex: the edge carries the row-key columns and is labeled
//! `table:role`, the target vertex carries the row's columns. Counters are
//! vertices of their own in the sequence index, advanced inside a native
//! transaction.
//!
//! Column names are escaped with
//! [`GRAPH_RESERVED_WORDS`](crate::storage::graph::index::GRAPH_RESERVED_WORDS) on write and
//! unescaped on read.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::association::{Association, MapAssociationSnapshot, RowMap};
use crate::key::{AssociationKey, EntityKey, EntityKeyMetadata, RowKey};
use crate::operation::{AssociationOperation, TupleOperation};
use crate::storage::columns::{check_row_keys, row_columns};
use crate::storage::graph::database::{
    EdgeId, GraphDatabase, GraphState, GraphTransaction, Properties, VertexId,
};
use crate::storage::graph::index::{IndexManager, SEQUENCE_VALUE_PROPERTY, TABLE_PROPERTY};
use crate::storage::traits::{NativeQuery, StorageError, TupleConsumer, TupleStore};
use crate::tuple::Tuple;
use crate::value::Value;

/// Adapter over a shared [`GraphDatabase`].
#[derive(Debug, Clone)]
pub struct GraphStore {
    database: Arc<GraphDatabase>,
    index: IndexManager,
}

impl GraphStore {
    /// Creates the adapter, creating its indexes if they are missing.
    pub fn new(database: Arc<GraphDatabase>, index: IndexManager) -> Result<Self, StorageError> {
        database.create_vertex_index(index.vertex_index())?;
        database.create_edge_index(index.edge_index())?;
        database.create_vertex_index(index.sequence_index())?;
        Ok(Self { database, index })
    }

    #[must_use]
    pub fn database(&self) -> &Arc<GraphDatabase> {
        &self.database
    }

    fn label(key: &AssociationKey) -> String {
        format!("{}:{}", key.table(), key.collection_role())
    }

    /// Application columns of a stored property map.
    fn columns_of(&self, properties: &Properties) -> HashMap<String, Value> {
        let words = self.index.words();
        properties
            .iter()
            .filter(|(name, _)| name.as_str() != TABLE_PROPERTY)
            .map(|(name, value)| (words.unescape(name), value.clone()))
            .collect()
    }

    fn find_or_create_vertex(
        &self,
        tx: &mut GraphTransaction<'_>,
        key: &EntityKey,
    ) -> Result<VertexId, StorageError> {
        if let Some(vertex) = self.index.find_vertex(tx, key)? {
            return Ok(vertex);
        }
        let vertex = tx.add_vertex();
        tx.set_vertex_property(vertex, TABLE_PROPERTY, Value::from(key.table()))?;
        for (name, value) in self.index.escaped_columns(key.columns()) {
            if !value.is_null() {
                tx.set_vertex_property(vertex, &name, value)?;
            }
        }
        self.index.index_vertex(tx, vertex, key)?;
        debug!(%key, %vertex, "created vertex");
        Ok(vertex)
    }

    /// Deindexes a row edge and removes its target vertex, which removes
    /// the edge with it.
    fn remove_row(&self, tx: &mut GraphTransaction<'_>, edge: EdgeId) -> Result<(), StorageError> {
        let target = tx
            .edge(edge)
            .map(|stored| stored.in_vertex())
            .ok_or_else(|| StorageError::BackendError(format!("no such edge {edge}")))?;
        self.index.remove_edge(tx, edge)?;
        tx.remove_vertex(target)
    }

    fn remove_rows(
        &self,
        tx: &mut GraphTransaction<'_>,
        owner: VertexId,
        label: Option<&str>,
    ) -> Result<usize, StorageError> {
        let edges = tx.out_edges(owner, label);
        for &edge in &edges {
            self.remove_row(tx, edge)?;
        }
        Ok(edges.len())
    }

    fn put_row(
        &self,
        tx: &mut GraphTransaction<'_>,
        owner: VertexId,
        label: &str,
        row_key: &RowKey,
        row: &Tuple,
    ) -> Result<(), StorageError> {
        let target = match self.index.find_edge(tx, owner, label, row_key)? {
            Some(edge) => tx
                .edge(edge)
                .map(|stored| stored.in_vertex())
                .ok_or_else(|| StorageError::BackendError(format!("no such edge {edge}")))?,
            None => {
                let target = tx.add_vertex();
                let edge = tx.add_edge(owner, target, label)?;
                for (name, value) in self.index.escaped_columns(row_key.columns()) {
                    tx.set_edge_property(edge, &name, value)?;
                }
                self.index.index_edge(tx, edge, owner, label, row_key)?;
                target
            }
        };

        let stale: Vec<String> = tx
            .vertex(target)
            .map(|properties| properties.keys().cloned().collect())
            .unwrap_or_default();
        for name in stale {
            tx.remove_vertex_property(target, &name)?;
        }
        let words = self.index.words();
        for (name, value) in row_columns(row_key, row) {
            tx.set_vertex_property(target, &words.escape(&name), value)?;
        }
        Ok(())
    }

    fn load_rows(
        &self,
        state: &GraphState,
        owner: VertexId,
        key: &AssociationKey,
    ) -> Result<RowMap, StorageError> {
        let label = Self::label(key);
        let mut rows = RowMap::new();
        for edge in state.out_edges(owner, Some(&label)) {
            let Some(stored) = state.edge(edge) else {
                continue;
            };
            let edge_columns = self.columns_of(stored.properties());
            let row_key = key.row_key_from(|c| edge_columns.get(c));
            let columns = state
                .vertex(stored.in_vertex())
                .map(|properties| self.columns_of(properties))
                .unwrap_or_default();
            rows.insert(row_key, columns);
        }
        Ok(rows)
    }
}

impl TupleStore for GraphStore {
    fn backend_name(&self) -> &'static str {
        "graph"
    }

    fn get_tuple(&self, key: &EntityKey) -> Result<Option<Tuple>, StorageError> {
        self.database.read(|state| {
            Ok(self
                .index
                .find_vertex(state, key)?
                .and_then(|vertex| state.vertex(vertex))
                .map(|properties| Tuple::from_columns(self.columns_of(properties))))
        })
    }

    fn create_tuple(&self, _key: &EntityKey) -> Tuple {
        Tuple::new()
    }

    fn update_tuple(&self, tuple: &Tuple, key: &EntityKey) -> Result<(), StorageError> {
        let words = self.index.words();
        self.database.transaction(|tx| {
            let vertex = self.find_or_create_vertex(tx, key)?;
            for operation in tuple.operations() {
                match operation {
                    TupleOperation::Put { column, value } => {
                        tx.set_vertex_property(vertex, &words.escape(column), value.clone())?;
                    }
                    TupleOperation::PutNull { column } | TupleOperation::Remove { column } => {
                        tx.remove_vertex_property(vertex, &words.escape(column))?;
                    }
                }
            }
            Ok(())
        })?;
        debug!(%key, operations = tuple.operations().len(), "updated tuple");
        Ok(())
    }

    fn remove_tuple(&self, key: &EntityKey) -> Result<(), StorageError> {
        let removed = self.database.transaction(|tx| {
            let Some(vertex) = self.index.find_vertex(tx, key)? else {
                return Ok(false);
            };
            self.remove_rows(tx, vertex, None)?;
            self.index.remove_vertex(tx, vertex, key)?;
            tx.remove_vertex(vertex)?;
            Ok(true)
        })?;
        debug!(%key, removed, "removed tuple");
        Ok(())
    }

    fn get_association(&self, key: &AssociationKey) -> Result<Option<Association>, StorageError> {
        self.database.read(|state| {
            let Some(owner) = self.index.find_vertex(state, key.entity_key())? else {
                return Ok(None);
            };
            let rows = self.load_rows(state, owner, key)?;
            if rows.is_empty() {
                return Ok(None);
            }
            Ok(Some(Association::from_snapshot(MapAssociationSnapshot::new(
                rows,
            ))))
        })
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
        let label = Self::label(key);
        self.database.transaction(|tx| {
            let owner = self.find_or_create_vertex(tx, key.entity_key())?;
            for operation in association.operations() {
                match operation {
                    AssociationOperation::Clear => {
                        self.remove_rows(tx, owner, Some(&label))?;
                    }
                    AssociationOperation::Put { key: row_key, value } => {
                        self.put_row(tx, owner, &label, row_key, value)?;
                    }
                    AssociationOperation::PutNull { key: row_key }
                    | AssociationOperation::Remove { key: row_key } => {
                        if let Some(edge) = self.index.find_edge(tx, owner, &label, row_key)? {
                            self.remove_row(tx, edge)?;
                        }
                    }
                }
            }
            Ok(())
        })?;
        debug!(%key, operations = association.operations().len(), "updated association");
        Ok(())
    }

    fn remove_association(&self, key: &AssociationKey) -> Result<(), StorageError> {
        let label = Self::label(key);
        let removed = self.database.transaction(|tx| {
            match self.index.find_vertex(tx, key.entity_key())? {
                Some(owner) => self.remove_rows(tx, owner, Some(&label)),
                None => Ok(0),
            }
        })?;
        debug!(%key, rows = removed, "removed association");
        Ok(())
    }

    fn next_value(&self, key: &RowKey, increment: i64, initial: i64) -> Result<i64, StorageError> {
        let overflow = |current: i64| {
            StorageError::BackendError(format!(
                "sequence {key} overflows adding {increment} to {current}"
            ))
        };
        self.database.transaction(|tx| match self.index.find_sequence(tx, key)? {
            Some(vertex) => {
                let current = tx
                    .vertex(vertex)
                    .and_then(|properties| properties.get(SEQUENCE_VALUE_PROPERTY))
                    .and_then(Value::as_int)
                    .ok_or_else(|| {
                        StorageError::BackendError(format!("counter vertex of {key} has no value"))
                    })?;
                let next = current.checked_add(increment).ok_or_else(|| overflow(current))?;
                tx.set_vertex_property(vertex, SEQUENCE_VALUE_PROPERTY, Value::Int(next))?;
                Ok(current)
            }
            None => {
                let next = initial.checked_add(increment).ok_or_else(|| overflow(initial))?;
                let vertex = tx.add_vertex();
                tx.set_vertex_property(vertex, SEQUENCE_VALUE_PROPERTY, Value::Int(next))?;
                self.index.index_sequence(tx, vertex, key)?;
                Ok(initial)
            }
        })
    }

    fn for_each_tuple(
        &self,
        consumer: &mut TupleConsumer<'_>,
        tables: &[EntityKeyMetadata],
    ) -> Result<(), StorageError> {
        for table in tables {
            let vertices = self
                .database
                .read(|state| self.index.find_vertices(state, table.table()))?;
            for vertex in vertices {
                let tuple = self.database.read(|state| {
                    Ok(state
                        .vertex(vertex)
                        .map(|properties| Tuple::from_columns(self.columns_of(properties))))
                })?;
                if let Some(tuple) = tuple {
                    consumer(tuple)?;
                }
            }
        }
        Ok(())
    }

    fn execute_native_query(&self, query: &NativeQuery) -> Result<Vec<Tuple>, StorageError> {
        let words = self.index.words();
        let terms: Vec<(String, &Value)> = query
            .terms
            .iter()
            .map(|(column, value)| (words.escape(column), value))
            .collect();
        self.database.read(|state| {
            let mut tuples = Vec::new();
            for vertex in self.index.find_vertices(state, &query.table)? {
                let Some(properties) = state.vertex(vertex) else {
                    continue;
                };
                let matches = terms
                    .iter()
                    .all(|(name, value)| properties.get(name) == Some(*value));
                if matches {
                    tuples.push(Tuple::from_columns(self.columns_of(properties)));
                }
            }
            Ok(tuples)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::AssociationKeyMetadata;

    fn store() -> GraphStore {
        GraphStore::new(
            Arc::new(GraphDatabase::new()),
            IndexManager::new("vertices", "edges", "sequences"),
        )
        .unwrap()
    }

    fn actor(id: i64) -> EntityKey {
        EntityKey::new("Actor", ["id"], [id])
    }

    fn films(owner: EntityKey) -> AssociationKey {
        AssociationKey::new(
            owner,
            "films",
            AssociationKeyMetadata::new("Actor_Film", ["film_id"]),
        )
    }

    fn film(id: i64) -> RowKey {
        RowKey::new("Actor_Film", ["film_id"], [id])
    }

    #[test]
    fn test_reserved_columns_are_stored_escaped() {
        let store = store();
        let mut tuple = store.create_tuple(&actor(1));
        tuple.put("_table", "shadow");
        store.update_tuple(&tuple, &actor(1)).unwrap();

        let loaded = store.get_tuple(&actor(1)).unwrap().unwrap();
        assert_eq!(loaded.get("id"), Some(&Value::Int(1)));
        assert_eq!(loaded.get("_table"), Some(&Value::from("shadow")));

        store
            .database()
            .read(|state| {
                let vertex = store.index.find_vertex(state, &actor(1))?.unwrap();
                let properties = state.vertex(vertex).unwrap();
                assert_eq!(properties.get("ogm_id"), Some(&Value::Int(1)));
                assert_eq!(properties.get("ogm__table"), Some(&Value::from("shadow")));
                assert_eq!(properties.get(TABLE_PROPERTY), Some(&Value::from("Actor")));
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_rows_become_edges_with_target_vertices() {
        let store = store();
        let key = films(actor(1));
        let mut association = store.create_association(&key);
        let mut row = store.create_tuple_association(&key, &film(7));
        row.put("role", "lead");
        association.put(film(7), row);
        association.put(film(8), Tuple::new());
        store.update_association(&association, &key).unwrap();

        store
            .database()
            .read(|state| {
                assert_eq!(state.vertex_count(), 3);
                assert_eq!(state.edge_count(), 2);
                Ok(())
            })
            .unwrap();

        let loaded = store.get_association(&key).unwrap().unwrap();
        assert_eq!(loaded.size(), 2);
        let lead = loaded.get(&film(7)).unwrap();
        assert_eq!(lead.get("role"), Some(&Value::from("lead")));
        assert_eq!(lead.get("film_id"), Some(&Value::Int(7)));
    }

    #[test]
    fn test_put_replaces_row_columns() {
        let store = store();
        let key = films(actor(1));
        let mut association = store.create_association(&key);
        let mut row = Tuple::new();
        row.put("role", "lead");
        row.put("year", 1990);
        association.put(film(7), row);
        store.update_association(&association, &key).unwrap();

        let mut association = store.create_association(&key);
        let mut row = Tuple::new();
        row.put("role", "extra");
        association.put(film(7), row);
        store.update_association(&association, &key).unwrap();

        let loaded = store.get_association(&key).unwrap().unwrap();
        let row = loaded.get(&film(7)).unwrap();
        assert_eq!(row.get("role"), Some(&Value::from("extra")));
        assert!(row.get("year").is_none());
        store
            .database()
            .read(|state| {
                assert_eq!(state.edge_count(), 1);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_remove_tuple_cleans_graph_and_indexes() {
        let store = store();
        let key = films(actor(1));
        let mut association = store.create_association(&key);
        association.put(film(7), Tuple::new());
        association.put(film(8), Tuple::new());
        store.update_association(&association, &key).unwrap();

        store.remove_tuple(&actor(1)).unwrap();
        store.remove_tuple(&actor(1)).unwrap();
        assert!(store.get_association(&key).unwrap().is_none());
        store
            .database()
            .read(|state| {
                assert_eq!(state.vertex_count(), 0);
                assert_eq!(state.edge_count(), 0);
                assert_eq!(state.index_entry_count("vertices")?, 0);
                assert_eq!(state.index_entry_count("edges")?, 0);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_invalid_row_key_leaves_graph_untouched() {
        let store = store();
        let key = films(actor(1));
        let mut association = store.create_association(&key);
        association.put(RowKey::new("Actor_Film", ["wrong"], [1i64]), Tuple::new());
        assert!(matches!(
            store.update_association(&association, &key),
            Err(StorageError::InvalidKey(_))
        ));
        store
            .database()
            .read(|state| {
                assert_eq!(state.vertex_count(), 0);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_native_query_matches_columns() {
        let store = store();
        for (id, name) in [(1, "Hamlet"), (2, "Ophelia"), (3, "Hamlet")] {
            let mut tuple = Tuple::new();
            tuple.put("name", name);
            store.update_tuple(&tuple, &actor(id)).unwrap();
        }

        let hamlets = store
            .execute_native_query(&NativeQuery::new("Actor").with_term("name", "Hamlet"))
            .unwrap();
        assert_eq!(hamlets.len(), 2);

        let by_id = store
            .execute_native_query(&NativeQuery::new("Actor").with_term("id", 2))
            .unwrap();
        assert_eq!(by_id.len(), 1);
        assert_eq!(by_id[0].get("name"), Some(&Value::from("Ophelia")));
    }

    #[test]
    fn test_sequence_runs_in_transaction() {
        let store = store();
        let key = RowKey::new("sequences", ["name"], ["actor_seq"]);
        assert_eq!(store.next_value(&key, 1, 5).unwrap(), 5);
        assert_eq!(store.next_value(&key, 1, 5).unwrap(), 6);
        assert!(store
            .get_tuple(&EntityKey::new("sequences", ["name"], ["actor_seq"]))
            .unwrap()
            .is_none());
    }
}
