//! Applying operation logs to plain column maps.
//!
//! Backends whose native record is a map of columns (map, remote cache)
//! share these helpers so the operation semantics stay identical.

use std::collections::HashMap;

use crate::association::{Association, RowMap};
use crate::key::{AssociationKey, EntityKey, RowKey};
use crate::operation::{AssociationOperation, TupleOperation};
use crate::storage::StorageError;
use crate::tuple::Tuple;
use crate::value::Value;

/// Column map of a freshly created entity record: its non-null key columns.
#[must_use]
pub fn entity_key_columns(key: &EntityKey) -> HashMap<String, Value> {
    key.columns()
        .filter(|(_, value)| !value.is_null())
        .map(|(name, value)| (name.to_string(), value.clone()))
        .collect()
}

/// Stored columns of an association row: its row-key columns plus every
/// non-null column of `row`.
#[must_use]
pub fn row_columns(row_key: &RowKey, row: &Tuple) -> HashMap<String, Value> {
    let mut columns = row.to_map();
    for (name, value) in row_key.columns() {
        if !value.is_null() {
            columns.insert(name.to_string(), value.clone());
        }
    }
    columns
}

/// Applies every pending column operation of `tuple` to `columns`.
pub fn apply_tuple_operations(columns: &mut HashMap<String, Value>, tuple: &Tuple) {
    for operation in tuple.operations() {
        match operation {
            TupleOperation::Put { column, value } => {
                columns.insert(column.clone(), value.clone());
            }
            TupleOperation::PutNull { column } | TupleOperation::Remove { column } => {
                columns.remove(column);
            }
        }
    }
}

/// Rejects any pending row whose key does not belong to `key`.
pub fn check_row_keys(association: &Association, key: &AssociationKey) -> Result<(), StorageError> {
    association
        .operations()
        .iter()
        .filter_map(AssociationOperation::row_key)
        .try_for_each(|row_key| key.check_row_key(row_key))
}

/// Applies every pending row operation of `association` to `rows`.
///
/// Row keys must already have been checked with [`check_row_keys`].
pub fn apply_association_operations(rows: &mut RowMap, association: &Association) {
    for operation in association.operations() {
        match operation {
            AssociationOperation::Clear => rows.clear(),
            AssociationOperation::Put { key, value } => {
                rows.insert(key.clone(), row_columns(key, value));
            }
            AssociationOperation::PutNull { key } | AssociationOperation::Remove { key } => {
                rows.remove(key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::AssociationKeyMetadata;

    fn films() -> AssociationKey {
        AssociationKey::new(
            EntityKey::new("Actor", ["id"], [1i64]),
            "films",
            AssociationKeyMetadata::new("Actor_Film", ["film_id"]),
        )
    }

    #[test]
    fn test_key_columns_skip_nulls() {
        let key = EntityKey::new("T", ["a", "b"], [Value::Int(1), Value::Null]);
        let columns = entity_key_columns(&key);
        assert_eq!(columns.len(), 1);
        assert_eq!(columns.get("a"), Some(&Value::Int(1)));
    }

    #[test]
    fn test_remove_of_absent_column_is_noop() {
        let mut columns = HashMap::from([("a".to_string(), Value::Int(1))]);
        let mut tuple = Tuple::new();
        tuple.remove("missing");
        tuple.put("b", 2);
        apply_tuple_operations(&mut columns, &tuple);
        assert_eq!(columns.len(), 2);
    }

    #[test]
    fn test_rows_carry_row_key_columns() {
        let row_key = RowKey::new("Actor_Film", ["film_id"], [7i64]);
        let mut row = Tuple::new();
        row.put("role", "lead");

        let mut association = Association::new();
        association.put(row_key.clone(), row);

        let mut rows = RowMap::new();
        apply_association_operations(&mut rows, &association);
        let stored = &rows[&row_key];
        assert_eq!(stored.get("film_id"), Some(&Value::Int(7)));
        assert_eq!(stored.get("role"), Some(&Value::from("lead")));
    }

    #[test]
    fn test_foreign_row_keys_are_rejected() {
        let mut association = Association::new();
        association.put(RowKey::new("Actor_Film", ["other"], [1i64]), Tuple::new());
        assert!(matches!(
            check_row_keys(&association, &films()),
            Err(StorageError::InvalidKey(_))
        ));
    }
}
