//! Abstract storage contract for tuplegrid.
//!
//! Every backend family implements [`TupleStore`]. Implementations hold no
//! client-side locks; all concurrency control is delegated to the backend's
//! own primitives (index queries, versioned replace, WATCH/EXEC, native
//! transactions).

use thiserror::Error;

use crate::association::Association;
use crate::key::{AssociationKey, EntityKey, EntityKeyMetadata, RowKey};
use crate::tuple::Tuple;
use crate::value::Value;

/// Errors that can occur during storage operations.
///
/// A missing tuple or association is not an error: lookups return
/// `Ok(None)`.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The backend cannot be reached or has been shut down.
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// A versioned write lost its race.
    #[error("Concurrent modification: {0}")]
    ConcurrentModification(String),

    /// An optimistic retry loop gave up.
    #[error("Contention exceeded on {key} after {attempts} attempts")]
    ContentionExceeded { key: String, attempts: u32 },

    /// A key is malformed or does not belong where it is used.
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// The backend cannot provide the requested capability.
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// Encoding or decoding a stored value failed.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Backend error.
    #[error("Storage backend error: {0}")]
    BackendError(String),
}

impl StorageError {
    /// Returns true if a higher orchestration layer may retry the call.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::BackendUnavailable(_)
                | Self::ConcurrentModification(_)
                | Self::ContentionExceeded { .. }
        )
    }
}

/// A backend-native query: every tuple of `table` whose columns equal all
/// of `terms`.
#[derive(Debug, Clone, PartialEq)]
pub struct NativeQuery {
    pub table: String,
    pub terms: Vec<(String, Value)>,
}

impl NativeQuery {
    #[must_use]
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            terms: Vec::new(),
        }
    }

    /// Adds an equality term.
    #[must_use]
    pub fn with_term(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.terms.push((column.into(), value.into()));
        self
    }
}

/// Receives tuples streamed by [`TupleStore::for_each_tuple`].
pub type TupleConsumer<'a> = dyn FnMut(Tuple) -> Result<(), StorageError> + 'a;

/// Storage contract shared by every backend.
///
/// # Semantics
/// - `get_*` never fail for a missing record; they return `Ok(None)`.
/// - `create_*` return empty, unpersisted values and never write.
/// - `update_*` resolve or create the backing record, then apply every
///   pending operation. Removing an absent column is a no-op.
/// - `remove_*` are idempotent. Removing an entity also removes every
///   association it owns.
pub trait TupleStore: Send + Sync {
    /// Short backend family name, for logs.
    fn backend_name(&self) -> &'static str;

    /// Get an entity tuple.
    fn get_tuple(&self, key: &EntityKey) -> Result<Option<Tuple>, StorageError>;

    /// An empty tuple for a new entity.
    fn create_tuple(&self, key: &EntityKey) -> Tuple;

    /// Apply the tuple's pending operations to the entity's record.
    fn update_tuple(&self, tuple: &Tuple, key: &EntityKey) -> Result<(), StorageError>;

    /// Delete an entity and every association it owns.
    fn remove_tuple(&self, key: &EntityKey) -> Result<(), StorageError>;

    /// Get an association.
    fn get_association(&self, key: &AssociationKey) -> Result<Option<Association>, StorageError>;

    /// An empty association.
    fn create_association(&self, key: &AssociationKey) -> Association;

    /// An empty tuple for a new association row.
    fn create_tuple_association(&self, key: &AssociationKey, row_key: &RowKey) -> Tuple;

    /// Apply the association's pending row operations.
    fn update_association(
        &self,
        association: &Association,
        key: &AssociationKey,
    ) -> Result<(), StorageError>;

    /// Delete an association and all of its rows.
    fn remove_association(&self, key: &AssociationKey) -> Result<(), StorageError>;

    /// Next value of the counter identified by `key`.
    ///
    /// The first call on an absent counter returns `initial`; every call
    /// returns the value assigned to the caller and advances the stored
    /// counter by `increment`.
    fn next_value(&self, key: &RowKey, increment: i64, initial: i64) -> Result<i64, StorageError>;

    /// Stream every tuple of the given tables to `consumer`, one at a time.
    fn for_each_tuple(
        &self,
        consumer: &mut TupleConsumer<'_>,
        tables: &[EntityKeyMetadata],
    ) -> Result<(), StorageError>;

    /// Run a backend-native query.
    fn execute_native_query(&self, query: &NativeQuery) -> Result<Vec<Tuple>, StorageError> {
        Err(StorageError::UnsupportedOperation(format!(
            "native queries are not supported by the {} backend (table {})",
            self.backend_name(),
            query.table
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Compile-time test: ensure the trait is object-safe
    fn _assert_tuple_store_object_safe(_: &dyn TupleStore) {}

    #[test]
    fn test_storage_error_display() {
        let err = StorageError::ContentionExceeded {
            key: "seq::".to_string(),
            attempts: 3,
        };
        let msg = err.to_string();
        assert!(msg.contains("seq::"));
        assert!(msg.contains('3'));

        let err = StorageError::BackendError("connection refused".to_string());
        assert!(err.to_string().contains("connection refused"));
    }

    #[test]
    fn test_storage_error_retryable() {
        assert!(StorageError::ConcurrentModification("x".into()).is_retryable());
        assert!(StorageError::BackendUnavailable("x".into()).is_retryable());
        assert!(!StorageError::InvalidKey("x".into()).is_retryable());
        assert!(!StorageError::UnsupportedOperation("x".into()).is_retryable());
    }

    #[test]
    fn test_native_query_builder() {
        let query = NativeQuery::new("Actor").with_term("name", "Hamlet");
        assert_eq!(query.terms, vec![("name".to_string(), Value::from("Hamlet"))]);
    }
}
