//! Embedded property graph with named property indexes and transactions.
//!
//! Vertices and edges carry a flat property map. Lookups by property go
//! through named indexes that are maintained explicitly by the caller; the
//! graph never indexes anything on its own, and removing an element does
//! not clean up index entries that still point at it.
//!
//! Writes run inside [`GraphDatabase::transaction`]. Every mutation made
//! through a [`GraphTransaction`] records its inverse; if the closure
//! returns an error the inverse log is replayed and the graph is left as it
//! was before the transaction started.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::storage::StorageError;
use crate::value::Value;

fn lock_err(context: &'static str) -> StorageError {
    StorageError::BackendError(format!("poisoned lock: {context}"))
}

/// Vertex identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VertexId(Uuid);

impl VertexId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for VertexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v:{}", self.0)
    }
}

/// Edge identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EdgeId(Uuid);

impl EdgeId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for EdgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "e:{}", self.0)
    }
}

pub type Properties = HashMap<String, Value>;

/// A directed, labeled edge.
#[derive(Debug, Clone, PartialEq)]
pub struct Edge {
    label: String,
    out_vertex: VertexId,
    in_vertex: VertexId,
    properties: Properties,
}

impl Edge {
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Tail vertex.
    #[must_use]
    pub const fn out_vertex(&self) -> VertexId {
        self.out_vertex
    }

    /// Head vertex.
    #[must_use]
    pub const fn in_vertex(&self) -> VertexId {
        self.in_vertex
    }

    #[must_use]
    pub fn properties(&self) -> &Properties {
        &self.properties
    }
}

/// Exact-match index from `(property, value)` to element ids.
#[derive(Debug, Clone)]
struct PropertyIndex<Id> {
    entries: HashMap<(String, Value), HashSet<Id>>,
}

impl<Id> Default for PropertyIndex<Id> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<Id: Copy + Eq + std::hash::Hash> PropertyIndex<Id> {
    fn put(&mut self, name: &str, value: &Value, id: Id) -> bool {
        self.entries
            .entry((name.to_string(), value.clone()))
            .or_default()
            .insert(id)
    }

    fn remove(&mut self, name: &str, value: &Value, id: Id) -> bool {
        let key = (name.to_string(), value.clone());
        let Some(ids) = self.entries.get_mut(&key) else {
            return false;
        };
        let removed = ids.remove(&id);
        if ids.is_empty() {
            self.entries.remove(&key);
        }
        removed
    }

    /// Ids registered under every one of `terms`.
    fn query(&self, terms: &[(String, Value)]) -> HashSet<Id> {
        let mut matches: Option<HashSet<Id>> = None;
        for (name, value) in terms {
            let Some(ids) = self.entries.get(&(name.clone(), value.clone())) else {
                return HashSet::new();
            };
            matches = Some(match matches {
                None => ids.clone(),
                Some(acc) => acc.intersection(ids).copied().collect(),
            });
            if matches.as_ref().is_some_and(HashSet::is_empty) {
                break;
            }
        }
        matches.unwrap_or_default()
    }

    fn len(&self) -> usize {
        self.entries.values().map(HashSet::len).sum()
    }
}

/// Full graph state. Read access is shared; writes go through a
/// [`GraphTransaction`].
#[derive(Debug, Default)]
pub struct GraphState {
    vertices: HashMap<VertexId, Properties>,
    edges: HashMap<EdgeId, Edge>,
    out_edges: HashMap<VertexId, HashSet<EdgeId>>,
    in_edges: HashMap<VertexId, HashSet<EdgeId>>,
    vertex_indexes: HashMap<String, PropertyIndex<VertexId>>,
    edge_indexes: HashMap<String, PropertyIndex<EdgeId>>,
}

impl GraphState {
    /// Properties of a vertex, or `None` if it does not exist.
    #[must_use]
    pub fn vertex(&self, id: VertexId) -> Option<&Properties> {
        self.vertices.get(&id)
    }

    #[must_use]
    pub fn edge(&self, id: EdgeId) -> Option<&Edge> {
        self.edges.get(&id)
    }

    /// Outgoing edges of `vertex`, optionally restricted to one label.
    #[must_use]
    pub fn out_edges(&self, vertex: VertexId, label: Option<&str>) -> Vec<EdgeId> {
        self.out_edges
            .get(&vertex)
            .into_iter()
            .flatten()
            .filter(|id| {
                label.map_or(true, |label| {
                    self.edges.get(id).is_some_and(|edge| edge.label == label)
                })
            })
            .copied()
            .collect()
    }

    #[must_use]
    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Vertices registered in `index` under every one of `terms`.
    pub fn query_vertices(
        &self,
        index: &str,
        terms: &[(String, Value)],
    ) -> Result<HashSet<VertexId>, StorageError> {
        Ok(self.vertex_index(index)?.query(terms))
    }

    /// Edges registered in `index` under every one of `terms`.
    pub fn query_edges(
        &self,
        index: &str,
        terms: &[(String, Value)],
    ) -> Result<HashSet<EdgeId>, StorageError> {
        Ok(self.edge_index(index)?.query(terms))
    }

    /// Number of `(property, value, element)` entries held by an index.
    pub fn index_entry_count(&self, index: &str) -> Result<usize, StorageError> {
        match (self.vertex_indexes.get(index), self.edge_indexes.get(index)) {
            (Some(vertices), _) => Ok(vertices.len()),
            (None, Some(edges)) => Ok(edges.len()),
            (None, None) => Err(missing_index(index)),
        }
    }

    fn vertex_index(&self, name: &str) -> Result<&PropertyIndex<VertexId>, StorageError> {
        self.vertex_indexes.get(name).ok_or_else(|| missing_index(name))
    }

    fn edge_index(&self, name: &str) -> Result<&PropertyIndex<EdgeId>, StorageError> {
        self.edge_indexes.get(name).ok_or_else(|| missing_index(name))
    }

    fn vertex_mut(&mut self, id: VertexId) -> Result<&mut Properties, StorageError> {
        self.vertices
            .get_mut(&id)
            .ok_or_else(|| StorageError::BackendError(format!("no such vertex {id}")))
    }

    fn edge_mut(&mut self, id: EdgeId) -> Result<&mut Edge, StorageError> {
        self.edges
            .get_mut(&id)
            .ok_or_else(|| StorageError::BackendError(format!("no such edge {id}")))
    }

    fn insert_edge(&mut self, id: EdgeId, edge: Edge) {
        self.out_edges.entry(edge.out_vertex).or_default().insert(id);
        self.in_edges.entry(edge.in_vertex).or_default().insert(id);
        self.edges.insert(id, edge);
    }

    fn detach_edge(&mut self, id: EdgeId) -> Option<Edge> {
        let edge = self.edges.remove(&id)?;
        if let Some(out) = self.out_edges.get_mut(&edge.out_vertex) {
            out.remove(&id);
        }
        if let Some(incoming) = self.in_edges.get_mut(&edge.in_vertex) {
            incoming.remove(&id);
        }
        Some(edge)
    }
}

fn missing_index(name: &str) -> StorageError {
    StorageError::BackendError(format!("no such index {name:?}"))
}

/// Inverse of one mutation, replayed on rollback.
#[derive(Debug)]
enum Undo {
    AddVertex(VertexId),
    RemoveVertex(VertexId, Properties),
    VertexProperty(VertexId, String, Option<Value>),
    AddEdge(EdgeId),
    RemoveEdge(EdgeId, Edge),
    EdgeProperty(EdgeId, String, Option<Value>),
    VertexIndexed(String, String, Value, VertexId),
    VertexUnindexed(String, String, Value, VertexId),
    EdgeIndexed(String, String, Value, EdgeId),
    EdgeUnindexed(String, String, Value, EdgeId),
}

fn restore(properties: &mut Properties, name: String, previous: Option<Value>) {
    match previous {
        Some(value) => {
            properties.insert(name, value);
        }
        None => {
            properties.remove(&name);
        }
    }
}

impl Undo {
    fn revert(self, state: &mut GraphState) {
        match self {
            Self::AddVertex(id) => {
                state.vertices.remove(&id);
                state.out_edges.remove(&id);
                state.in_edges.remove(&id);
            }
            Self::RemoveVertex(id, properties) => {
                state.vertices.insert(id, properties);
            }
            Self::VertexProperty(id, name, previous) => {
                if let Some(properties) = state.vertices.get_mut(&id) {
                    restore(properties, name, previous);
                }
            }
            Self::AddEdge(id) => {
                state.detach_edge(id);
            }
            Self::RemoveEdge(id, edge) => state.insert_edge(id, edge),
            Self::EdgeProperty(id, name, previous) => {
                if let Some(edge) = state.edges.get_mut(&id) {
                    restore(&mut edge.properties, name, previous);
                }
            }
            Self::VertexIndexed(index, name, value, id) => {
                if let Some(index) = state.vertex_indexes.get_mut(&index) {
                    index.remove(&name, &value, id);
                }
            }
            Self::VertexUnindexed(index, name, value, id) => {
                if let Some(index) = state.vertex_indexes.get_mut(&index) {
                    index.put(&name, &value, id);
                }
            }
            Self::EdgeIndexed(index, name, value, id) => {
                if let Some(index) = state.edge_indexes.get_mut(&index) {
                    index.remove(&name, &value, id);
                }
            }
            Self::EdgeUnindexed(index, name, value, id) => {
                if let Some(index) = state.edge_indexes.get_mut(&index) {
                    index.put(&name, &value, id);
                }
            }
        }
    }
}

/// Write access to the graph for the duration of one transaction.
///
/// Reads see the transaction's own uncommitted writes.
pub struct GraphTransaction<'a> {
    state: &'a mut GraphState,
    undo: Vec<Undo>,
}

impl Deref for GraphTransaction<'_> {
    type Target = GraphState;

    fn deref(&self) -> &GraphState {
        self.state
    }
}

impl GraphTransaction<'_> {
    pub fn add_vertex(&mut self) -> VertexId {
        let id = VertexId::new();
        self.state.vertices.insert(id, Properties::new());
        self.undo.push(Undo::AddVertex(id));
        id
    }

    pub fn set_vertex_property(
        &mut self,
        id: VertexId,
        name: &str,
        value: Value,
    ) -> Result<(), StorageError> {
        let previous = self.state.vertex_mut(id)?.insert(name.to_string(), value);
        self.undo
            .push(Undo::VertexProperty(id, name.to_string(), previous));
        Ok(())
    }

    /// Removes a vertex property, returning its previous value.
    pub fn remove_vertex_property(
        &mut self,
        id: VertexId,
        name: &str,
    ) -> Result<Option<Value>, StorageError> {
        let previous = self.state.vertex_mut(id)?.remove(name);
        if previous.is_some() {
            self.undo
                .push(Undo::VertexProperty(id, name.to_string(), previous.clone()));
        }
        Ok(previous)
    }

    /// Removes a vertex together with every edge incident to it.
    pub fn remove_vertex(&mut self, id: VertexId) -> Result<(), StorageError> {
        let incident: Vec<EdgeId> = self
            .state
            .out_edges
            .get(&id)
            .into_iter()
            .chain(self.state.in_edges.get(&id))
            .flatten()
            .copied()
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        for edge in incident {
            self.remove_edge(edge)?;
        }
        let properties = self
            .state
            .vertices
            .remove(&id)
            .ok_or_else(|| StorageError::BackendError(format!("no such vertex {id}")))?;
        self.state.out_edges.remove(&id);
        self.state.in_edges.remove(&id);
        self.undo.push(Undo::RemoveVertex(id, properties));
        Ok(())
    }

    pub fn add_edge(
        &mut self,
        out_vertex: VertexId,
        in_vertex: VertexId,
        label: &str,
    ) -> Result<EdgeId, StorageError> {
        for vertex in [out_vertex, in_vertex] {
            if !self.state.vertices.contains_key(&vertex) {
                return Err(StorageError::BackendError(format!("no such vertex {vertex}")));
            }
        }
        let id = EdgeId::new();
        self.state.insert_edge(
            id,
            Edge {
                label: label.to_string(),
                out_vertex,
                in_vertex,
                properties: Properties::new(),
            },
        );
        self.undo.push(Undo::AddEdge(id));
        Ok(id)
    }

    pub fn set_edge_property(
        &mut self,
        id: EdgeId,
        name: &str,
        value: Value,
    ) -> Result<(), StorageError> {
        let previous = self
            .state
            .edge_mut(id)?
            .properties
            .insert(name.to_string(), value);
        self.undo.push(Undo::EdgeProperty(id, name.to_string(), previous));
        Ok(())
    }

    pub fn remove_edge(&mut self, id: EdgeId) -> Result<(), StorageError> {
        let edge = self
            .state
            .detach_edge(id)
            .ok_or_else(|| StorageError::BackendError(format!("no such edge {id}")))?;
        self.undo.push(Undo::RemoveEdge(id, edge));
        Ok(())
    }

    pub fn index_vertex(
        &mut self,
        index: &str,
        name: &str,
        value: &Value,
        id: VertexId,
    ) -> Result<(), StorageError> {
        let added = self
            .state
            .vertex_indexes
            .get_mut(index)
            .ok_or_else(|| missing_index(index))?
            .put(name, value, id);
        if added {
            self.undo.push(Undo::VertexIndexed(
                index.to_string(),
                name.to_string(),
                value.clone(),
                id,
            ));
        }
        Ok(())
    }

    pub fn unindex_vertex(
        &mut self,
        index: &str,
        name: &str,
        value: &Value,
        id: VertexId,
    ) -> Result<(), StorageError> {
        let removed = self
            .state
            .vertex_indexes
            .get_mut(index)
            .ok_or_else(|| missing_index(index))?
            .remove(name, value, id);
        if removed {
            self.undo.push(Undo::VertexUnindexed(
                index.to_string(),
                name.to_string(),
                value.clone(),
                id,
            ));
        }
        Ok(())
    }

    pub fn index_edge(
        &mut self,
        index: &str,
        name: &str,
        value: &Value,
        id: EdgeId,
    ) -> Result<(), StorageError> {
        let added = self
            .state
            .edge_indexes
            .get_mut(index)
            .ok_or_else(|| missing_index(index))?
            .put(name, value, id);
        if added {
            self.undo.push(Undo::EdgeIndexed(
                index.to_string(),
                name.to_string(),
                value.clone(),
                id,
            ));
        }
        Ok(())
    }

    pub fn unindex_edge(
        &mut self,
        index: &str,
        name: &str,
        value: &Value,
        id: EdgeId,
    ) -> Result<(), StorageError> {
        let removed = self
            .state
            .edge_indexes
            .get_mut(index)
            .ok_or_else(|| missing_index(index))?
            .remove(name, value, id);
        if removed {
            self.undo.push(Undo::EdgeUnindexed(
                index.to_string(),
                name.to_string(),
                value.clone(),
                id,
            ));
        }
        Ok(())
    }

    fn rollback(self) {
        let Self { state, undo } = self;
        for entry in undo.into_iter().rev() {
            entry.revert(state);
        }
    }
}

/// Embedded graph database handle.
#[derive(Debug)]
pub struct GraphDatabase {
    state: RwLock<GraphState>,
    running: AtomicBool,
}

impl Default for GraphDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphDatabase {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: RwLock::new(GraphState::default()),
            running: AtomicBool::new(true),
        }
    }

    /// Creates a vertex index if it does not exist yet.
    pub fn create_vertex_index(&self, name: &str) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("graph state"))?;
        state.vertex_indexes.entry(name.to_string()).or_default();
        Ok(())
    }

    /// Creates an edge index if it does not exist yet.
    pub fn create_edge_index(&self, name: &str) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("graph state"))?;
        state.edge_indexes.entry(name.to_string()).or_default();
        Ok(())
    }

    /// Stops the database. Every later call fails with `BackendUnavailable`.
    pub fn shutdown(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            info!("graph database stopped");
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
                "graph database has been shut down".to_string(),
            ))
        }
    }

    /// Runs `f` against a consistent read view.
    pub fn read<T>(
        &self,
        f: impl FnOnce(&GraphState) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        self.ensure_running()?;
        let state = self.state.read().map_err(|_| lock_err("graph state"))?;
        f(&state)
    }

    /// Runs `f` as one atomic transaction; an `Err` rolls back every write.
    pub fn transaction<T>(
        &self,
        f: impl FnOnce(&mut GraphTransaction<'_>) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        self.ensure_running()?;
        let mut state = self.state.write().map_err(|_| lock_err("graph state"))?;
        let mut tx = GraphTransaction {
            state: &mut *state,
            undo: Vec::new(),
        };
        match f(&mut tx) {
            Ok(value) => Ok(value),
            Err(err) => {
                debug!(writes = tx.undo.len(), error = %err, "rolling back graph transaction");
                tx.rollback();
                Err(err)
            }
        }
    }
}
