//! # tuplegrid - Tuple and association storage over heterogeneous datastores
//!
//! tuplegrid persists entity-shaped data in backends with very different
//! native models: sharded maps, a property graph, a whole-value remote cache
//! and a hash/set key-value server. Every backend sits behind the same
//! [`TupleStore`] contract, so callers read and write the same logical
//! records whichever engine holds them.
//!
//! ## Core Concepts
//!
//! - **Tuple**: the columns of one entity, plus a log of pending changes
//! - **Association**: the rows of one collection owned by an entity
//! - **Keys**: [`EntityKey`], [`AssociationKey`] and [`RowKey`] address
//!   entities, collections and rows by table plus ordered key columns
//! - **Sequences**: optimistic counters for identifier generation
//!
//! ## Usage
//!
//! ```rust
//! use tuplegrid::{Datastore, EntityKey, StoreConfig, Tuple, Value};
//!
//! let datastore = Datastore::start(&StoreConfig::default())?;
//! let store = datastore.store();
//!
//! let key = EntityKey::new("Actor", ["id"], [42i64]);
//! let mut tuple = Tuple::new();
//! tuple.put("name", "Uma");
//! store.update_tuple(&tuple, &key)?;
//!
//! let stored = store.get_tuple(&key)?.expect("just written");
//! assert_eq!(stored.get("name"), Some(&Value::from("Uma")));
//! assert_eq!(stored.get("id"), Some(&Value::Int(42)));
//!
//! datastore.stop();
//! # Ok::<(), tuplegrid::GridError>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Data model
pub mod association;
pub mod key;
pub mod operation;
pub mod tuple;
pub mod value;

// Identifiers and naming
pub mod escape;
pub mod identifier;

// Storage, sequences and lifecycle
pub mod config;
pub mod datastore;
pub mod error;
pub mod sequence;
pub mod storage;

// Re-export primary types at crate root for convenience
pub use association::{Association, AssociationSnapshot, RowMap};
pub use config::{BackendKind, LoggingConfig, StoreConfig};
pub use datastore::{BackendHandle, Datastore};
pub use error::{ConfigError, GridError, GridResult};
pub use key::{AssociationKey, AssociationKeyMetadata, EntityKey, EntityKeyMetadata, RowKey};
pub use operation::{AssociationOperation, TupleOperation};
pub use sequence::{CounterBackend, SequenceGenerator};
pub use storage::{NativeQuery, StorageError, TupleStore};
pub use tuple::{Tuple, TupleSnapshot};
pub use value::Value;
