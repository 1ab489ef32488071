//! Backend lifecycle.
//!
//! A [`Datastore`] owns one running backend engine and the adapter over
//! it. Callers borrow the adapter through [`Datastore::store`] and stop the
//! engine explicitly; nothing here is global.

use std::sync::Arc;

use tracing::info;

use crate::config::{BackendKind, StoreConfig};
use crate::error::GridResult;
use crate::storage::cache::{CacheManager, CacheStore};
use crate::storage::graph::{GraphDatabase, GraphStore, IndexManager};
use crate::storage::keyvalue::{InMemoryKeyValueServer, KeyValueConnection, KeyValueStore};
use crate::storage::memory::{MapDatastore, MapStore};
use crate::storage::TupleStore;

/// Handle to the running backend engine.
#[derive(Debug, Clone)]
pub enum BackendHandle {
    /// Sharded in-process maps.
    Map(Arc<MapDatastore>),
    /// Embedded property graph.
    Graph(Arc<GraphDatabase>),
    /// Named remote caches.
    Cache(Arc<CacheManager>),
    /// Key-value server.
    KeyValue(Arc<InMemoryKeyValueServer>),
}

impl BackendHandle {
    /// Backend family of this handle.
    #[must_use]
    pub const fn kind(&self) -> BackendKind {
        match self {
            Self::Map(_) => BackendKind::Map,
            Self::Graph(_) => BackendKind::Graph,
            Self::Cache(_) => BackendKind::Cache,
            Self::KeyValue(_) => BackendKind::KeyValue,
        }
    }

    /// Returns true until the engine is shut down.
    #[must_use]
    pub fn is_running(&self) -> bool {
        match self {
            Self::Map(handle) => handle.is_running(),
            Self::Graph(handle) => handle.is_running(),
            Self::Cache(handle) => handle.is_running(),
            Self::KeyValue(handle) => handle.is_running(),
        }
    }

    fn shutdown(&self) {
        match self {
            Self::Map(handle) => handle.shutdown(),
            Self::Graph(handle) => handle.shutdown(),
            Self::Cache(handle) => handle.stop(),
            Self::KeyValue(handle) => handle.shutdown(),
        }
    }
}

/// A started backend and its adapter.
pub struct Datastore {
    handle: BackendHandle,
    store: Arc<dyn TupleStore>,
}

impl std::fmt::Debug for Datastore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Datastore")
            .field("handle", &self.handle)
            .field("store", &self.store.backend_name())
            .finish()
    }
}

impl Datastore {
    /// Validates `config`, then starts the configured backend.
    ///
    /// # Errors
    /// `GridError::Config` for an invalid configuration, `GridError::Storage`
    /// if the backend cannot be prepared.
    pub fn start(config: &StoreConfig) -> GridResult<Self> {
        let config = config.clone().validate()?;
        let sequences = config.sequence_generator();

        let (handle, store): (BackendHandle, Arc<dyn TupleStore>) = match config.backend {
            BackendKind::Map => {
                let datastore = Arc::new(MapDatastore::new());
                let store = MapStore::new(Arc::clone(&datastore));
                (BackendHandle::Map(datastore), Arc::new(store))
            }
            BackendKind::Graph => {
                let database = Arc::new(GraphDatabase::new());
                let index = IndexManager::new(
                    config.graph.vertex_index.as_str(),
                    config.graph.edge_index.as_str(),
                    config.graph.sequence_index.as_str(),
                );
                let store = GraphStore::new(Arc::clone(&database), index)?;
                (BackendHandle::Graph(database), Arc::new(store))
            }
            BackendKind::Cache => {
                let manager = Arc::new(CacheManager::new(
                    &config.cache.entity_store,
                    &config.cache.association_store,
                    &config.cache.identifier_store,
                ));
                let store = CacheStore::new(
                    &manager,
                    config.cache.write_mode,
                    config.cache.max_cas_retries,
                    sequences,
                );
                (BackendHandle::Cache(manager), Arc::new(store))
            }
            BackendKind::KeyValue => {
                let server = Arc::new(InMemoryKeyValueServer::new());
                let connection: Arc<dyn KeyValueConnection> = Arc::clone(&server) as _;
                let store = KeyValueStore::new(
                    connection,
                    config.keyvalue.scan_batch_size,
                    config.keyvalue.max_transaction_retries,
                    sequences,
                );
                (BackendHandle::KeyValue(server), Arc::new(store))
            }
        };

        info!(backend = store.backend_name(), "datastore started");
        Ok(Self { handle, store })
    }

    /// Adapter over the running backend.
    #[must_use]
    pub fn store(&self) -> Arc<dyn TupleStore> {
        Arc::clone(&self.store)
    }

    /// Engine handle, for backend-specific inspection.
    #[must_use]
    pub const fn handle(&self) -> &BackendHandle {
        &self.handle
    }

    #[must_use]
    pub const fn backend(&self) -> BackendKind {
        self.handle.kind()
    }

    /// Shuts the backend down. Adapter calls made afterwards fail with
    /// `BackendUnavailable`.
    pub fn stop(&self) {
        self.handle.shutdown();
        info!(backend = self.store.backend_name(), "datastore stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GridError;
    use crate::key::EntityKey;
    use crate::storage::StorageError;
    use crate::tuple::Tuple;

    fn config(backend: BackendKind) -> StoreConfig {
        StoreConfig {
            backend,
            ..StoreConfig::default()
        }
    }

    #[test]
    fn test_start_each_backend() {
        for kind in [
            BackendKind::Map,
            BackendKind::Graph,
            BackendKind::Cache,
            BackendKind::KeyValue,
        ] {
            let datastore = Datastore::start(&config(kind)).unwrap();
            assert_eq!(datastore.backend(), kind);
            assert!(datastore.handle().is_running());

            let key = EntityKey::new("Actor", ["id"], [1i64]);
            let mut tuple = Tuple::new();
            tuple.put("name", "Uma");
            datastore.store().update_tuple(&tuple, &key).unwrap();
            assert!(datastore.store().get_tuple(&key).unwrap().is_some());
        }
    }

    #[test]
    fn test_stopped_backend_is_unavailable() {
        let datastore = Datastore::start(&config(BackendKind::KeyValue)).unwrap();
        let store = datastore.store();
        datastore.stop();
        assert!(!datastore.handle().is_running());
        assert!(matches!(
            store.get_tuple(&EntityKey::new("Actor", ["id"], [1i64])),
            Err(StorageError::BackendUnavailable(_))
        ));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut bad = config(BackendKind::Cache);
        bad.cache.max_cas_retries = 0;
        assert!(matches!(Datastore::start(&bad), Err(GridError::Config(_))));
    }
}
