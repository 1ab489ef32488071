//! Pending mutations accumulated before a single flush to the backend.
//!
//! A [`Tuple`] records [`TupleOperation`]s per column; an
//! [`Association`](crate::Association) records [`AssociationOperation`]s per
//! row, each `Put` carrying the row's own tuple with its column operations.
//! Both use [`OperationLog`], which keeps at most one pending operation per
//! target: a later operation on the same column or row supersedes the
//! earlier one and moves to the end of the log.

use crate::key::RowKey;
use crate::tuple::Tuple;
use crate::value::Value;

/// An operation that targets a column or row, or the whole collection.
pub trait LoggedOperation {
    type Target: PartialEq + ?Sized;

    /// The column or row this operation affects; `None` for whole-collection
    /// operations such as a clear.
    fn target(&self) -> Option<&Self::Target>;
}

/// Ordered set of pending operations.
#[derive(Debug, Clone)]
pub struct OperationLog<O> {
    operations: Vec<O>,
}

impl<O> Default for OperationLog<O> {
    fn default() -> Self {
        Self {
            operations: Vec::new(),
        }
    }
}

impl<O: LoggedOperation> OperationLog<O> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `operation`, superseding any pending operation on the same
    /// target. A whole-collection operation discards everything before it.
    pub fn record(&mut self, operation: O) {
        match operation.target() {
            Some(target) => self.operations.retain(|op| op.target() != Some(target)),
            None => self.operations.clear(),
        }
        self.operations.push(operation);
    }

    /// The pending operation on `target`, if any.
    pub fn pending(&self, target: &O::Target) -> Option<&O> {
        self.operations
            .iter()
            .rev()
            .find(|op| op.target() == Some(target))
    }

    pub fn iter(&self) -> std::slice::Iter<'_, O> {
        self.operations.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

impl<'a, O> IntoIterator for &'a OperationLog<O> {
    type Item = &'a O;
    type IntoIter = std::slice::Iter<'a, O>;

    fn into_iter(self) -> Self::IntoIter {
        self.operations.iter()
    }
}

/// A pending change to one column of a tuple.
#[derive(Debug, Clone, PartialEq)]
pub enum TupleOperation {
    /// Set the column to a non-null value.
    Put { column: String, value: Value },
    /// Set the column to null; the backend drops the column.
    PutNull { column: String },
    /// Drop the column.
    Remove { column: String },
}

impl TupleOperation {
    #[must_use]
    pub fn column(&self) -> &str {
        match self {
            Self::Put { column, .. } | Self::PutNull { column } | Self::Remove { column } => column,
        }
    }

    /// The value written by a `Put`.
    #[must_use]
    pub fn value(&self) -> Option<&Value> {
        match self {
            Self::Put { value, .. } => Some(value),
            Self::PutNull { .. } | Self::Remove { .. } => None,
        }
    }
}

impl LoggedOperation for TupleOperation {
    type Target = str;

    fn target(&self) -> Option<&str> {
        Some(self.column())
    }
}

/// A pending change to an association.
#[derive(Debug, Clone)]
pub enum AssociationOperation {
    /// Drop every row.
    Clear,
    /// Create or update a row; the tuple carries the row's column operations.
    Put { key: RowKey, value: Tuple },
    /// Null out a row; the backend removes it.
    PutNull { key: RowKey },
    /// Remove a row.
    Remove { key: RowKey },
}

impl AssociationOperation {
    #[must_use]
    pub fn row_key(&self) -> Option<&RowKey> {
        match self {
            Self::Clear => None,
            Self::Put { key, .. } | Self::PutNull { key } | Self::Remove { key } => Some(key),
        }
    }
}

impl LoggedOperation for AssociationOperation {
    type Target = RowKey;

    fn target(&self) -> Option<&RowKey> {
        self.row_key()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put(column: &str, value: i64) -> TupleOperation {
        TupleOperation::Put {
            column: column.to_string(),
            value: Value::Int(value),
        }
    }

    #[test]
    fn later_operation_supersedes_earlier_one() {
        let mut log = OperationLog::new();
        log.record(put("a", 1));
        log.record(put("b", 2));
        log.record(put("a", 3));

        let columns: Vec<_> = log.iter().map(TupleOperation::column).collect();
        assert_eq!(columns, ["b", "a"]);
        assert_eq!(log.pending("a").and_then(TupleOperation::value), Some(&Value::Int(3)));
    }

    #[test]
    fn remove_replaces_put() {
        let mut log = OperationLog::new();
        log.record(put("a", 1));
        log.record(TupleOperation::Remove {
            column: "a".to_string(),
        });
        assert_eq!(log.len(), 1);
        assert!(matches!(log.pending("a"), Some(TupleOperation::Remove { .. })));
    }

    #[test]
    fn clear_discards_earlier_row_operations() {
        let row = RowKey::new("T", ["id"], [1i64]);
        let mut log = OperationLog::new();
        log.record(AssociationOperation::Remove { key: row.clone() });
        log.record(AssociationOperation::Clear);
        log.record(AssociationOperation::Put {
            key: row.clone(),
            value: Tuple::new(),
        });

        let ops: Vec<_> = log.iter().collect();
        assert_eq!(ops.len(), 2);
        assert!(matches!(ops[0], AssociationOperation::Clear));
        assert_eq!(ops[1].row_key(), Some(&row));
    }
}
