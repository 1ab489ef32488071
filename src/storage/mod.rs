//! Storage contract and backend adapters.
//!
//! [`TupleStore`] is the contract every backend implements. Four backend
//! families are provided, each with its own engine and adapter:
//!
//! - [`memory`]: sharded map-of-maps, the reference backend
//! - [`graph`]: embedded property graph with explicit secondary indexes
//! - [`cache`]: whole-value remote cache with CAS or delta writes
//! - [`keyvalue`]: hash/set key-value server with WATCH/EXEC transactions

pub mod cache;
pub mod columns;
pub mod graph;
pub mod keyvalue;
pub mod memory;
pub mod scan;
mod traits;

pub use traits::{NativeQuery, StorageError, TupleConsumer, TupleStore};
