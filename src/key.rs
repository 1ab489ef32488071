//! Keys identifying stored entities, associations and association rows.
//!
//! Keys are immutable values built by the caller from already-resolved
//! column values. Equality and hashing cover every component, so a key can
//! be used directly as a map key by in-process backends.

use std::fmt;

use crate::storage::StorageError;
use crate::value::Value;

fn check_columns(
    kind: &'static str,
    table: &str,
    names: &[String],
    values: &[Value],
) -> Result<(), StorageError> {
    if names.len() == values.len() {
        Ok(())
    } else {
        Err(StorageError::InvalidKey(format!(
            "{kind} for table {table:?} has {} column names but {} values",
            names.len(),
            values.len()
        )))
    }
}

fn owned_names<S: Into<String>>(names: impl IntoIterator<Item = S>) -> Vec<String> {
    names.into_iter().map(Into::into).collect()
}

fn write_columns(f: &mut fmt::Formatter<'_>, names: &[String], values: &[Value]) -> fmt::Result {
    f.write_str("{")?;
    for (i, (name, value)) in names.iter().zip(values).enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{name}={value}")?;
    }
    f.write_str("}")
}

/// Table name plus the columns that form an entity's key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityKeyMetadata {
    table: String,
    column_names: Vec<String>,
}

impl EntityKeyMetadata {
    #[must_use]
    pub fn new<S: Into<String>>(
        table: impl Into<String>,
        column_names: impl IntoIterator<Item = S>,
    ) -> Self {
        Self {
            table: table.into(),
            column_names: owned_names(column_names),
        }
    }

    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    #[must_use]
    pub fn column_names(&self) -> &[String] {
        &self.column_names
    }

    /// Returns true if `column` is one of the key columns.
    #[must_use]
    pub fn is_key_column(&self, column: &str) -> bool {
        self.column_names.iter().any(|c| c == column)
    }
}

/// Identifies one stored entity.
///
/// # Examples
///
/// ```
/// use tuplegrid::{EntityKey, Value};
///
/// let key = EntityKey::new("Actor", ["id"], [Value::Int(42)]);
/// assert_eq!(key.table(), "Actor");
/// assert_eq!(key.value_of("id"), Some(&Value::Int(42)));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityKey {
    metadata: EntityKeyMetadata,
    column_values: Vec<Value>,
}

impl EntityKey {
    /// Creates a key.
    ///
    /// # Panics
    /// If the number of names differs from the number of values. A
    /// malformed key is a programming error; use [`EntityKey::try_new`] to
    /// validate untrusted input.
    #[must_use]
    pub fn new<S: Into<String>, V: Into<Value>>(
        table: impl Into<String>,
        column_names: impl IntoIterator<Item = S>,
        column_values: impl IntoIterator<Item = V>,
    ) -> Self {
        match Self::try_new(table, column_names, column_values) {
            Ok(key) => key,
            Err(e) => panic!("{e}"),
        }
    }

    /// Creates a key, rejecting mismatched column arrays.
    pub fn try_new<S: Into<String>, V: Into<Value>>(
        table: impl Into<String>,
        column_names: impl IntoIterator<Item = S>,
        column_values: impl IntoIterator<Item = V>,
    ) -> Result<Self, StorageError> {
        let metadata = EntityKeyMetadata::new(table, column_names);
        let column_values: Vec<Value> = column_values.into_iter().map(Into::into).collect();
        check_columns(
            "entity key",
            &metadata.table,
            &metadata.column_names,
            &column_values,
        )?;
        Ok(Self {
            metadata,
            column_values,
        })
    }

    #[must_use]
    pub fn metadata(&self) -> &EntityKeyMetadata {
        &self.metadata
    }

    #[must_use]
    pub fn table(&self) -> &str {
        &self.metadata.table
    }

    #[must_use]
    pub fn column_names(&self) -> &[String] {
        &self.metadata.column_names
    }

    #[must_use]
    pub fn column_values(&self) -> &[Value] {
        &self.column_values
    }

    /// Iterates `(name, value)` pairs in key order.
    pub fn columns(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.metadata
            .column_names
            .iter()
            .map(String::as_str)
            .zip(&self.column_values)
    }

    /// Value of a key column, if `column` is part of the key.
    #[must_use]
    pub fn value_of(&self, column: &str) -> Option<&Value> {
        self.columns().find(|(n, _)| *n == column).map(|(_, v)| v)
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityKey({}", self.table())?;
        write_columns(f, self.column_names(), &self.column_values)?;
        f.write_str(")")
    }
}

/// Table backing an association plus the columns that identify its rows.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AssociationKeyMetadata {
    table: String,
    row_key_column_names: Vec<String>,
}

impl AssociationKeyMetadata {
    #[must_use]
    pub fn new<S: Into<String>>(
        table: impl Into<String>,
        row_key_column_names: impl IntoIterator<Item = S>,
    ) -> Self {
        Self {
            table: table.into(),
            row_key_column_names: owned_names(row_key_column_names),
        }
    }

    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    #[must_use]
    pub fn row_key_column_names(&self) -> &[String] {
        &self.row_key_column_names
    }
}

/// Identifies a relationship collection owned by one entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AssociationKey {
    entity_key: EntityKey,
    collection_role: String,
    metadata: AssociationKeyMetadata,
}

impl AssociationKey {
    #[must_use]
    pub fn new(
        entity_key: EntityKey,
        collection_role: impl Into<String>,
        metadata: AssociationKeyMetadata,
    ) -> Self {
        Self {
            entity_key,
            collection_role: collection_role.into(),
            metadata,
        }
    }

    /// The owning entity.
    #[must_use]
    pub fn entity_key(&self) -> &EntityKey {
        &self.entity_key
    }

    #[must_use]
    pub fn collection_role(&self) -> &str {
        &self.collection_role
    }

    #[must_use]
    pub fn metadata(&self) -> &AssociationKeyMetadata {
        &self.metadata
    }

    #[must_use]
    pub fn table(&self) -> &str {
        &self.metadata.table
    }

    #[must_use]
    pub fn row_key_column_names(&self) -> &[String] {
        &self.metadata.row_key_column_names
    }

    /// Verifies that `row_key` belongs to this association.
    ///
    /// The row key's columns must match the declared row-key columns
    /// exactly, in order.
    pub fn check_row_key(&self, row_key: &RowKey) -> Result<(), StorageError> {
        if row_key.column_names() == self.row_key_column_names() {
            Ok(())
        } else {
            Err(StorageError::InvalidKey(format!(
                "row key columns {:?} do not match association {}#{} row key columns {:?}",
                row_key.column_names(),
                self.entity_key.table(),
                self.collection_role,
                self.row_key_column_names()
            )))
        }
    }

    /// Builds the row key for this association from a row's column map.
    ///
    /// Null columns are never stored, so a missing row-key column reads
    /// back as `Value::Null`.
    #[must_use]
    pub fn row_key_from<'a>(&self, lookup: impl Fn(&str) -> Option<&'a Value>) -> RowKey {
        let column_values = self
            .row_key_column_names()
            .iter()
            .map(|c| lookup(c).cloned().unwrap_or(Value::Null))
            .collect();
        RowKey {
            table: self.metadata.table.clone(),
            column_names: self.metadata.row_key_column_names.clone(),
            column_values,
        }
    }
}

impl fmt::Display for AssociationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "AssociationKey({}#{} -> {} for {})",
            self.entity_key.table(),
            self.collection_role,
            self.metadata.table,
            self.entity_key
        )
    }
}

/// Identifies one row of an association, or a standalone sequence counter.
///
/// A sequence counter is a row key whose table is the sequence name; a
/// single global counter has no columns.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RowKey {
    table: String,
    column_names: Vec<String>,
    column_values: Vec<Value>,
}

impl RowKey {
    /// Creates a row key.
    ///
    /// # Panics
    /// If the number of names differs from the number of values.
    #[must_use]
    pub fn new<S: Into<String>, V: Into<Value>>(
        table: impl Into<String>,
        column_names: impl IntoIterator<Item = S>,
        column_values: impl IntoIterator<Item = V>,
    ) -> Self {
        match Self::try_new(table, column_names, column_values) {
            Ok(key) => key,
            Err(e) => panic!("{e}"),
        }
    }

    /// Creates a row key, rejecting mismatched column arrays.
    pub fn try_new<S: Into<String>, V: Into<Value>>(
        table: impl Into<String>,
        column_names: impl IntoIterator<Item = S>,
        column_values: impl IntoIterator<Item = V>,
    ) -> Result<Self, StorageError> {
        let table = table.into();
        let column_names = owned_names(column_names);
        let column_values: Vec<Value> = column_values.into_iter().map(Into::into).collect();
        check_columns("row key", &table, &column_names, &column_values)?;
        Ok(Self {
            table,
            column_names,
            column_values,
        })
    }

    /// A column-less key naming a single global counter.
    #[must_use]
    pub fn sequence(name: impl Into<String>) -> Self {
        Self {
            table: name.into(),
            column_names: Vec::new(),
            column_values: Vec::new(),
        }
    }

    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    #[must_use]
    pub fn column_names(&self) -> &[String] {
        &self.column_names
    }

    #[must_use]
    pub fn column_values(&self) -> &[Value] {
        &self.column_values
    }

    /// Iterates `(name, value)` pairs in key order.
    pub fn columns(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.column_names
            .iter()
            .map(String::as_str)
            .zip(&self.column_values)
    }
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RowKey({}", self.table)?;
        write_columns(f, &self.column_names, &self.column_values)?;
        f.write_str(")")
    }
}
