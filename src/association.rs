//! Row-keyed view of one relationship collection.
//!
//! An [`Association`] pairs a read-only [`AssociationSnapshot`] with an
//! [`OperationLog`] of pending row operations, mirroring [`Tuple`].

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use crate::key::RowKey;
use crate::operation::{AssociationOperation, OperationLog};
use crate::tuple::Tuple;
use crate::value::Value;

/// Read-only projection of an association's persisted rows.
pub trait AssociationSnapshot: fmt::Debug + Send + Sync {
    /// The row stored under `key`, if any.
    fn get(&self, key: &RowKey) -> Option<Tuple>;

    fn contains_key(&self, key: &RowKey) -> bool;

    fn size(&self) -> usize;

    fn row_keys(&self) -> Vec<RowKey>;
}

/// Snapshot of an association that has never been persisted.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyAssociationSnapshot;

impl AssociationSnapshot for EmptyAssociationSnapshot {
    fn get(&self, _key: &RowKey) -> Option<Tuple> {
        None
    }

    fn contains_key(&self, _key: &RowKey) -> bool {
        false
    }

    fn size(&self) -> usize {
        0
    }

    fn row_keys(&self) -> Vec<RowKey> {
        Vec::new()
    }
}

/// Column map of every row, keyed by row key.
pub type RowMap = HashMap<RowKey, HashMap<String, Value>>;

/// Snapshot backed by an owned map of rows.
#[derive(Debug, Clone, Default)]
pub struct MapAssociationSnapshot {
    rows: RowMap,
}

impl MapAssociationSnapshot {
    #[must_use]
    pub fn new(rows: RowMap) -> Self {
        Self { rows }
    }

    #[must_use]
    pub fn rows(&self) -> &RowMap {
        &self.rows
    }
}

impl AssociationSnapshot for MapAssociationSnapshot {
    fn get(&self, key: &RowKey) -> Option<Tuple> {
        self.rows
            .get(key)
            .map(|columns| Tuple::from_columns(columns.clone()))
    }

    fn contains_key(&self, key: &RowKey) -> bool {
        self.rows.contains_key(key)
    }

    fn size(&self) -> usize {
        self.rows.len()
    }

    fn row_keys(&self) -> Vec<RowKey> {
        self.rows.keys().cloned().collect()
    }
}

/// A snapshot plus the pending row operations against it.
#[derive(Debug, Clone)]
pub struct Association {
    snapshot: Arc<dyn AssociationSnapshot>,
    operations: OperationLog<AssociationOperation>,
    cleared: bool,
}

impl Default for Association {
    fn default() -> Self {
        Self::new()
    }
}

impl Association {
    /// An empty, unpersisted association.
    #[must_use]
    pub fn new() -> Self {
        Self::from_snapshot(EmptyAssociationSnapshot)
    }

    #[must_use]
    pub fn from_snapshot(snapshot: impl AssociationSnapshot + 'static) -> Self {
        Self {
            snapshot: Arc::new(snapshot),
            operations: OperationLog::new(),
            cleared: false,
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> &dyn AssociationSnapshot {
        self.snapshot.as_ref()
    }

    /// Current row under `key`, pending operations included.
    #[must_use]
    pub fn get(&self, key: &RowKey) -> Option<Tuple> {
        match self.operations.pending(key) {
            Some(AssociationOperation::Put { value, .. }) => Some(value.clone()),
            Some(_) => None,
            None if self.cleared => None,
            None => self.snapshot.get(key),
        }
    }

    #[must_use]
    pub fn contains_key(&self, key: &RowKey) -> bool {
        match self.operations.pending(key) {
            Some(AssociationOperation::Put { .. }) => true,
            Some(_) => false,
            None => !self.cleared && self.snapshot.contains_key(key),
        }
    }

    /// Creates or replaces the row under `key`.
    pub fn put(&mut self, key: RowKey, value: Tuple) {
        self.operations
            .record(AssociationOperation::Put { key, value });
    }

    pub fn remove(&mut self, key: RowKey) {
        self.operations.record(AssociationOperation::Remove { key });
    }

    /// Drops every row, persisted or pending.
    pub fn clear(&mut self) {
        self.cleared = true;
        self.operations.record(AssociationOperation::Clear);
    }

    /// Row keys, pending operations included.
    #[must_use]
    pub fn row_keys(&self) -> Vec<RowKey> {
        let mut keys: Vec<RowKey> = if self.cleared {
            Vec::new()
        } else {
            self.snapshot.row_keys()
        };
        let mut seen: HashSet<RowKey> = keys.iter().cloned().collect();
        for operation in &self.operations {
            match operation {
                AssociationOperation::Put { key, .. } => {
                    if seen.insert(key.clone()) {
                        keys.push(key.clone());
                    }
                }
                AssociationOperation::PutNull { key } | AssociationOperation::Remove { key } => {
                    if seen.remove(key) {
                        keys.retain(|k| k != key);
                    }
                }
                AssociationOperation::Clear => {}
            }
        }
        keys
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.row_keys().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    #[must_use]
    pub fn operations(&self) -> &OperationLog<AssociationOperation> {
        &self.operations
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(id: i64) -> RowKey {
        RowKey::new("Actor_Film", ["film_id"], [id])
    }

    fn persisted() -> Association {
        let mut rows = RowMap::new();
        rows.insert(
            row(1),
            HashMap::from([("film_id".to_string(), Value::Int(1))]),
        );
        rows.insert(
            row(2),
            HashMap::from([("film_id".to_string(), Value::Int(2))]),
        );
        Association::from_snapshot(MapAssociationSnapshot::new(rows))
    }

    #[test]
    fn empty_association() {
        let assoc = Association::new();
        assert!(assoc.is_empty());
        assert!(assoc.get(&row(1)).is_none());
        assert!(!assoc.contains_key(&row(1)));
    }

    #[test]
    fn pending_rows_are_visible() {
        let mut assoc = persisted();
        let mut tuple = Tuple::new();
        tuple.put("film_id", 3);
        assoc.put(row(3), tuple);
        assoc.remove(row(1));

        assert_eq!(assoc.size(), 2);
        assert!(assoc.contains_key(&row(3)));
        assert!(!assoc.contains_key(&row(1)));
        assert_eq!(
            assoc.get(&row(3)).and_then(|t| t.get("film_id").cloned()),
            Some(Value::Int(3))
        );
        assert_eq!(assoc.snapshot().size(), 2);
    }

    #[test]
    fn clear_hides_persisted_rows() {
        let mut assoc = persisted();
        assoc.clear();
        assert!(assoc.is_empty());
        assert!(assoc.get(&row(2)).is_none());

        assoc.put(row(2), Tuple::new());
        assert_eq!(assoc.row_keys(), vec![row(2)]);
    }
}
