//! Remote distributed cache backend.

pub mod delta;
mod dialect;
pub mod remote;

pub use delta::{DeltaOperation, MapDelta};
pub use dialect::{CacheStore, CacheWriteMode};
pub use remote::{
    AssociationCache, CacheManager, DeltaAwareCache, EntityCache, IdentifierCache,
    InMemoryRemoteCache, RemoteCache, Versioned,
};
