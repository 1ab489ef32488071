//! Column-oriented view of one persisted record.
//!
//! A [`Tuple`] pairs a read-only [`TupleSnapshot`] of the persisted state
//! with an [`OperationLog`] of pending changes. Reads through the tuple see
//! pending changes layered over the snapshot; the snapshot itself is never
//! mutated.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use crate::operation::{OperationLog, TupleOperation};
use crate::value::Value;

/// Read-only projection of a record's persisted columns.
pub trait TupleSnapshot: fmt::Debug + Send + Sync {
    /// Value of `column`, or `None` if the record has no such column.
    fn get(&self, column: &str) -> Option<&Value>;

    /// Returns true if the record has no columns.
    fn is_empty(&self) -> bool;

    /// Names of every stored column.
    fn column_names(&self) -> BTreeSet<String>;
}

/// Snapshot of a record that has never been persisted.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyTupleSnapshot;

impl TupleSnapshot for EmptyTupleSnapshot {
    fn get(&self, _column: &str) -> Option<&Value> {
        None
    }

    fn is_empty(&self) -> bool {
        true
    }

    fn column_names(&self) -> BTreeSet<String> {
        BTreeSet::new()
    }
}

/// Snapshot backed by an owned column map.
#[derive(Debug, Clone, Default)]
pub struct MapTupleSnapshot {
    columns: HashMap<String, Value>,
}

impl MapTupleSnapshot {
    #[must_use]
    pub fn new(columns: HashMap<String, Value>) -> Self {
        Self { columns }
    }

    #[must_use]
    pub fn columns(&self) -> &HashMap<String, Value> {
        &self.columns
    }
}

impl TupleSnapshot for MapTupleSnapshot {
    fn get(&self, column: &str) -> Option<&Value> {
        self.columns.get(column)
    }

    fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    fn column_names(&self) -> BTreeSet<String> {
        self.columns.keys().cloned().collect()
    }
}

/// A snapshot plus the pending column operations against it.
///
/// # Examples
///
/// ```
/// use tuplegrid::{Tuple, Value};
///
/// let mut tuple = Tuple::new();
/// tuple.put("name", "Hamlet");
/// assert_eq!(tuple.get("name"), Some(&Value::from("Hamlet")));
/// assert_eq!(tuple.operations().len(), 1);
/// ```
#[derive(Debug, Clone)]
pub struct Tuple {
    snapshot: Arc<dyn TupleSnapshot>,
    operations: OperationLog<TupleOperation>,
}

impl Default for Tuple {
    fn default() -> Self {
        Self::new()
    }
}

impl Tuple {
    /// An empty, unpersisted tuple.
    #[must_use]
    pub fn new() -> Self {
        Self::from_snapshot(EmptyTupleSnapshot)
    }

    #[must_use]
    pub fn from_snapshot(snapshot: impl TupleSnapshot + 'static) -> Self {
        Self {
            snapshot: Arc::new(snapshot),
            operations: OperationLog::new(),
        }
    }

    /// Convenience for a tuple over an owned column map.
    #[must_use]
    pub fn from_columns(columns: HashMap<String, Value>) -> Self {
        Self::from_snapshot(MapTupleSnapshot::new(columns))
    }

    #[must_use]
    pub fn snapshot(&self) -> &dyn TupleSnapshot {
        self.snapshot.as_ref()
    }

    /// Current value of `column`, pending operations included.
    #[must_use]
    pub fn get(&self, column: &str) -> Option<&Value> {
        match self.operations.pending(column) {
            Some(TupleOperation::Put { value, .. }) => Some(value),
            Some(_) => None,
            None => self.snapshot.get(column),
        }
    }

    /// Sets `column`. A `Value::Null` is recorded as a put-null.
    pub fn put(&mut self, column: impl Into<String>, value: impl Into<Value>) {
        let column = column.into();
        let value = value.into();
        let operation = if value.is_null() {
            TupleOperation::PutNull { column }
        } else {
            TupleOperation::Put { column, value }
        };
        self.operations.record(operation);
    }

    pub fn remove(&mut self, column: impl Into<String>) {
        self.operations.record(TupleOperation::Remove {
            column: column.into(),
        });
    }

    /// Column names, pending operations included.
    #[must_use]
    pub fn column_names(&self) -> BTreeSet<String> {
        let mut names = self.snapshot.column_names();
        for operation in &self.operations {
            match operation {
                TupleOperation::Put { column, .. } => {
                    names.insert(column.clone());
                }
                TupleOperation::PutNull { column } | TupleOperation::Remove { column } => {
                    names.remove(column);
                }
            }
        }
        names
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.column_names().is_empty()
    }

    #[must_use]
    pub fn operations(&self) -> &OperationLog<TupleOperation> {
        &self.operations
    }

    #[must_use]
    pub fn has_pending_operations(&self) -> bool {
        !self.operations.is_empty()
    }

    /// Resolved column map, pending operations included.
    #[must_use]
    pub fn to_map(&self) -> HashMap<String, Value> {
        self.column_names()
            .into_iter()
            .filter_map(|name| {
                let value = self.get(&name)?.clone();
                Some((name, value))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn persisted() -> Tuple {
        Tuple::from_columns(HashMap::from([
            ("id".to_string(), Value::Int(42)),
            ("name".to_string(), Value::from("Hamlet")),
        ]))
    }

    #[test]
    fn empty_tuple_has_no_columns() {
        let tuple = Tuple::new();
        assert!(tuple.is_empty());
        assert!(tuple.snapshot().is_empty());
        assert!(tuple.column_names().is_empty());
        assert!(tuple.get("anything").is_none());
    }

    #[test]
    fn pending_put_overrides_snapshot() {
        let mut tuple = persisted();
        tuple.put("name", "Ophelia");
        assert_eq!(tuple.get("name"), Some(&Value::from("Ophelia")));
        assert_eq!(tuple.snapshot().get("name"), Some(&Value::from("Hamlet")));
    }

    #[test]
    fn put_null_and_remove_hide_columns() {
        let mut tuple = persisted();
        tuple.put("name", Value::Null);
        assert!(tuple.get("name").is_none());
        assert!(matches!(
            tuple.operations().pending("name"),
            Some(TupleOperation::PutNull { .. })
        ));

        tuple.remove("id");
        assert!(tuple.column_names().is_empty());
        assert!(tuple.is_empty());
    }

    #[test]
    fn to_map_resolves_operations() {
        let mut tuple = persisted();
        tuple.put("year", 1603);
        tuple.remove("name");
        let map = tuple.to_map();
        assert_eq!(map.len(), 2);
        assert_eq!(map.get("year"), Some(&Value::Int(1603)));
        assert!(!map.contains_key("name"));
    }
}
