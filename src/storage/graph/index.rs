//! Secondary index maintenance for the graph backend.
//!
//! The graph has no lookup by composite business key, so every entity
//! vertex and association edge is registered in a named property index
//! under each of its key columns plus a marker naming its table (vertices)
//! or relationship type and owner (edges). Lookups are conjunctive queries
//! over all of those terms; deregistration removes exactly the entries
//! that registration added.

use tracing::trace;

use crate::escape::ReservedWords;
use crate::key::{EntityKey, RowKey};
use crate::storage::graph::database::{EdgeId, GraphState, GraphTransaction, VertexId};
use crate::storage::StorageError;
use crate::value::Value;

/// Vertex property and index term naming the entity's table.
pub const TABLE_PROPERTY: &str = "_table";
/// Edge index term naming the association's relationship type.
pub const RELATIONSHIP_TYPE_PROPERTY: &str = "_relationship_type";
/// Edge index term naming the owning vertex.
pub const OWNER_PROPERTY: &str = "_owner";
/// Sequence index term naming the counter.
pub const SEQUENCE_PROPERTY: &str = "_sequence";
/// Vertex property holding a counter's next value.
pub const SEQUENCE_VALUE_PROPERTY: &str = "_value";

/// Names the graph reserves for itself. Application columns with these
/// names are stored under an `ogm_` prefix.
pub const GRAPH_RESERVED_WORDS: ReservedWords = ReservedWords::new(
    "ogm_",
    &[
        "id",
        TABLE_PROPERTY,
        RELATIONSHIP_TYPE_PROPERTY,
        OWNER_PROPERTY,
        SEQUENCE_PROPERTY,
        SEQUENCE_VALUE_PROPERTY,
    ],
);

fn term(name: &str, value: impl Into<Value>) -> (String, Value) {
    (name.to_string(), value.into())
}

/// Registers and resolves graph elements by key.
#[derive(Debug, Clone)]
pub struct IndexManager {
    vertex_index: String,
    edge_index: String,
    sequence_index: String,
    words: ReservedWords,
}

impl IndexManager {
    #[must_use]
    pub fn new(
        vertex_index: impl Into<String>,
        edge_index: impl Into<String>,
        sequence_index: impl Into<String>,
    ) -> Self {
        Self {
            vertex_index: vertex_index.into(),
            edge_index: edge_index.into(),
            sequence_index: sequence_index.into(),
            words: GRAPH_RESERVED_WORDS,
        }
    }

    #[must_use]
    pub fn vertex_index(&self) -> &str {
        &self.vertex_index
    }

    #[must_use]
    pub fn edge_index(&self) -> &str {
        &self.edge_index
    }

    #[must_use]
    pub fn sequence_index(&self) -> &str {
        &self.sequence_index
    }

    #[must_use]
    pub const fn words(&self) -> ReservedWords {
        self.words
    }

    /// Escaped `(name, value)` pairs of key columns.
    ///
    /// Null key values are kept so that `[1, null]` and `[1, 2]` index
    /// under different terms.
    pub fn escaped_columns<'a>(
        &self,
        columns: impl Iterator<Item = (&'a str, &'a Value)>,
    ) -> Vec<(String, Value)> {
        columns
            .map(|(name, value)| (self.words.escape(name), value.clone()))
            .collect()
    }

    fn entity_terms(&self, key: &EntityKey) -> Vec<(String, Value)> {
        let mut terms = vec![term(TABLE_PROPERTY, key.table())];
        terms.extend(self.escaped_columns(key.columns()));
        terms
    }

    fn edge_terms(&self, owner: VertexId, label: &str, row_key: &RowKey) -> Vec<(String, Value)> {
        let mut terms = vec![
            term(RELATIONSHIP_TYPE_PROPERTY, label),
            term(OWNER_PROPERTY, owner.to_string()),
        ];
        terms.extend(self.escaped_columns(row_key.columns()));
        terms
    }

    fn sequence_terms(&self, key: &RowKey) -> Vec<(String, Value)> {
        let mut terms = vec![term(SEQUENCE_PROPERTY, key.table())];
        terms.extend(self.escaped_columns(key.columns()));
        terms
    }

    /// Registers an entity vertex under its key.
    pub fn index_vertex(
        &self,
        tx: &mut GraphTransaction<'_>,
        vertex: VertexId,
        key: &EntityKey,
    ) -> Result<(), StorageError> {
        for (name, value) in self.entity_terms(key) {
            tx.index_vertex(&self.vertex_index, &name, &value, vertex)?;
        }
        trace!(%key, %vertex, "indexed vertex");
        Ok(())
    }

    /// Deregisters an entity vertex previously registered under `key`.
    pub fn remove_vertex(
        &self,
        tx: &mut GraphTransaction<'_>,
        vertex: VertexId,
        key: &EntityKey,
    ) -> Result<(), StorageError> {
        for (name, value) in self.entity_terms(key) {
            tx.unindex_vertex(&self.vertex_index, &name, &value, vertex)?;
        }
        trace!(%key, %vertex, "deindexed vertex");
        Ok(())
    }

    /// The unique vertex registered under `key`.
    pub fn find_vertex(
        &self,
        state: &GraphState,
        key: &EntityKey,
    ) -> Result<Option<VertexId>, StorageError> {
        let matches = state.query_vertices(&self.vertex_index, &self.entity_terms(key))?;
        unique(matches, || format!("{key}"))
    }

    /// Every vertex registered for `table`.
    pub fn find_vertices(
        &self,
        state: &GraphState,
        table: &str,
    ) -> Result<Vec<VertexId>, StorageError> {
        let mut vertices: Vec<VertexId> = state
            .query_vertices(&self.vertex_index, &[term(TABLE_PROPERTY, table)])?
            .into_iter()
            .collect();
        vertices.sort_unstable();
        Ok(vertices)
    }

    /// Registers an association edge under its owner, label and row key.
    pub fn index_edge(
        &self,
        tx: &mut GraphTransaction<'_>,
        edge: EdgeId,
        owner: VertexId,
        label: &str,
        row_key: &RowKey,
    ) -> Result<(), StorageError> {
        for (name, value) in self.edge_terms(owner, label, row_key) {
            tx.index_edge(&self.edge_index, &name, &value, edge)?;
        }
        trace!(%row_key, %edge, "indexed edge");
        Ok(())
    }

    /// Deregisters an association edge.
    ///
    /// The terms are rebuilt from the edge itself: its label, its tail
    /// vertex and its row-key properties.
    pub fn remove_edge(
        &self,
        tx: &mut GraphTransaction<'_>,
        edge: EdgeId,
    ) -> Result<(), StorageError> {
        let terms = {
            let stored = tx
                .edge(edge)
                .ok_or_else(|| StorageError::BackendError(format!("no such edge {edge}")))?;
            let mut terms = vec![
                term(RELATIONSHIP_TYPE_PROPERTY, stored.label()),
                term(OWNER_PROPERTY, stored.out_vertex().to_string()),
            ];
            terms.extend(
                stored
                    .properties()
                    .iter()
                    .map(|(name, value)| (name.clone(), value.clone())),
            );
            terms
        };
        for (name, value) in terms {
            tx.unindex_edge(&self.edge_index, &name, &value, edge)?;
        }
        trace!(%edge, "deindexed edge");
        Ok(())
    }

    /// The unique edge of `owner` labeled `label` for `row_key`.
    pub fn find_edge(
        &self,
        state: &GraphState,
        owner: VertexId,
        label: &str,
        row_key: &RowKey,
    ) -> Result<Option<EdgeId>, StorageError> {
        let matches = state.query_edges(&self.edge_index, &self.edge_terms(owner, label, row_key))?;
        unique(matches, || format!("{row_key} of {owner} via {label}"))
    }

    /// Registers a counter vertex.
    pub fn index_sequence(
        &self,
        tx: &mut GraphTransaction<'_>,
        vertex: VertexId,
        key: &RowKey,
    ) -> Result<(), StorageError> {
        for (name, value) in self.sequence_terms(key) {
            tx.index_vertex(&self.sequence_index, &name, &value, vertex)?;
        }
        Ok(())
    }

    /// The counter vertex for `key`.
    pub fn find_sequence(
        &self,
        state: &GraphState,
        key: &RowKey,
    ) -> Result<Option<VertexId>, StorageError> {
        let matches = state.query_vertices(&self.sequence_index, &self.sequence_terms(key))?;
        unique(matches, || format!("{key}"))
    }
}

fn unique<Id: Copy>(
    matches: std::collections::HashSet<Id>,
    describe: impl FnOnce() -> String,
) -> Result<Option<Id>, StorageError> {
    match matches.len() {
        0 => Ok(None),
        1 => Ok(matches.into_iter().next()),
        n => Err(StorageError::BackendError(format!(
            "index holds {n} elements for {}",
            describe()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::graph::database::GraphDatabase;

    fn setup() -> (GraphDatabase, IndexManager) {
        let db = GraphDatabase::new();
        db.create_vertex_index("vertices").unwrap();
        db.create_edge_index("edges").unwrap();
        db.create_vertex_index("sequences").unwrap();
        (db, IndexManager::new("vertices", "edges", "sequences"))
    }

    #[test]
    fn test_vertex_lookup_by_composite_key() {
        let (db, index) = setup();
        let key = EntityKey::new("Pair", ["a", "b"], [1i64, 2]);
        let other = EntityKey::new("Pair", ["a", "b"], [1i64, 3]);

        let vertex = db
            .transaction(|tx| {
                let vertex = tx.add_vertex();
                index.index_vertex(tx, vertex, &key)?;
                let v2 = tx.add_vertex();
                index.index_vertex(tx, v2, &other)?;
                Ok(vertex)
            })
            .unwrap();

        let found = db.read(|state| index.find_vertex(state, &key)).unwrap();
        assert_eq!(found, Some(vertex));
        assert_eq!(db.read(|state| index.find_vertices(state, "Pair")).unwrap().len(), 2);
    }

    #[test]
    fn test_reserved_column_does_not_alias_table_marker() {
        let (db, index) = setup();
        let key = EntityKey::new("Actor", ["_table"], ["Film"]);
        db.transaction(|tx| {
            let vertex = tx.add_vertex();
            index.index_vertex(tx, vertex, &key)
        })
        .unwrap();
        assert!(db
            .read(|state| index.find_vertices(state, "Film"))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_deindex_leaves_no_stale_entries() {
        let (db, index) = setup();
        let owner_key = EntityKey::new("Actor", ["id"], [1i64]);
        let row = RowKey::new("Actor_Film", ["film_id"], [9i64]);

        db.transaction(|tx| {
            let owner = tx.add_vertex();
            index.index_vertex(tx, owner, &owner_key)?;
            let target = tx.add_vertex();
            let edge = tx.add_edge(owner, target, "Actor_Film:films")?;
            for (name, value) in index.escaped_columns(row.columns()) {
                tx.set_edge_property(edge, &name, value)?;
            }
            index.index_edge(tx, edge, owner, "Actor_Film:films", &row)?;
            assert_eq!(
                index.find_edge(tx, owner, "Actor_Film:films", &row)?,
                Some(edge)
            );

            index.remove_edge(tx, edge)?;
            index.remove_vertex(tx, owner, &owner_key)?;
            Ok(())
        })
        .unwrap();

        db.read(|state| {
            assert_eq!(state.index_entry_count("vertices")?, 0);
            assert_eq!(state.index_entry_count("edges")?, 0);
            assert!(index.find_vertex(state, &owner_key)?.is_none());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_edges_of_different_owners_do_not_alias() {
        let (db, index) = setup();
        let row = RowKey::new("Link", ["target"], [1i64]);
        db.transaction(|tx| {
            let a = tx.add_vertex();
            let b = tx.add_vertex();
            let target = tx.add_vertex();
            let edge = tx.add_edge(a, target, "Link:friends")?;
            index.index_edge(tx, edge, a, "Link:friends", &row)?;
            assert!(index.find_edge(tx, b, "Link:friends", &row)?.is_none());
            assert!(index.find_edge(tx, a, "Link:enemies", &row)?.is_none());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_null_key_component_is_its_own_term() {
        let (db, index) = setup();
        let with_null = RowKey::new("Pair", ["a", "b"], [Value::Int(1), Value::Null]);
        let full = RowKey::new("Pair", ["a", "b"], [1i64, 2]);
        db.transaction(|tx| {
            let owner = tx.add_vertex();
            let mut edges = Vec::new();
            for row in [&with_null, &full] {
                let target = tx.add_vertex();
                let edge = tx.add_edge(owner, target, "Pair:pairs")?;
                index.index_edge(tx, edge, owner, "Pair:pairs", row)?;
                edges.push(edge);
            }
            assert_eq!(index.find_edge(tx, owner, "Pair:pairs", &with_null)?, Some(edges[0]));
            assert_eq!(index.find_edge(tx, owner, "Pair:pairs", &full)?, Some(edges[1]));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_duplicate_registration_is_reported() {
        let (db, index) = setup();
        let key = EntityKey::new("Actor", ["id"], [1i64]);
        db.transaction(|tx| {
            for _ in 0..2 {
                let vertex = tx.add_vertex();
                index.index_vertex(tx, vertex, &key)?;
            }
            Ok(())
        })
        .unwrap();
        assert!(matches!(
            db.read(|state| index.find_vertex(state, &key)),
            Err(StorageError::BackendError(_))
        ));
    }
}
