//! Streaming full-table scans with back-pressure.
//!
//! [`TupleStream`] runs [`TupleStore::for_each_tuple`] on a worker thread
//! and hands tuples to the caller through a bounded channel, so a slow
//! consumer throttles the scan instead of buffering the table.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use tracing::debug;

use crate::key::EntityKeyMetadata;
use crate::storage::traits::{StorageError, TupleStore};
use crate::tuple::Tuple;

/// Iterator over the tuples of one or more tables.
///
/// Yields `Err` at most once, as the last item, if the scan failed.
/// Dropping the stream early stops the scan.
#[derive(Debug)]
pub struct TupleStream {
    rx: Option<Receiver<Result<Tuple, StorageError>>>,
    worker: Option<JoinHandle<()>>,
}

impl TupleStream {
    /// Starts scanning `tables`, buffering at most `capacity` tuples.
    pub fn spawn(
        store: Arc<dyn TupleStore>,
        tables: Vec<EntityKeyMetadata>,
        capacity: usize,
    ) -> Result<Self, StorageError> {
        let (tx, rx) = bounded(capacity.max(1));
        let worker = thread::Builder::new()
            .name("tuplegrid-scan".to_string())
            .spawn(move || {
                let mut consumer_gone = false;
                let result = store.for_each_tuple(
                    &mut |tuple| {
                        tx.send(Ok(tuple)).map_err(|_| {
                            consumer_gone = true;
                            StorageError::BackendError("scan consumer dropped".to_string())
                        })
                    },
                    &tables,
                );
                match result {
                    Ok(()) => debug!(tables = tables.len(), "scan finished"),
                    Err(_) if consumer_gone => debug!("scan stopped by consumer"),
                    Err(err) => {
                        let _ = tx.send(Err(err));
                    }
                }
            })
            .map_err(|e| StorageError::BackendError(format!("failed to spawn scan worker: {e}")))?;
        Ok(Self {
            rx: Some(rx),
            worker: Some(worker),
        })
    }

    /// Next tuple, waiting at most `timeout`.
    ///
    /// Returns `Ok(None)` once the scan is complete.
    pub fn next_timeout(&mut self, timeout: Duration) -> Result<Option<Tuple>, StorageError> {
        let Some(rx) = &self.rx else {
            return Ok(None);
        };
        match rx.recv_timeout(timeout) {
            Ok(item) => item.map(Some),
            Err(RecvTimeoutError::Timeout) => Err(StorageError::BackendUnavailable(format!(
                "scan produced nothing within {timeout:?}"
            ))),
            Err(RecvTimeoutError::Disconnected) => Ok(None),
        }
    }
}

impl Iterator for TupleStream {
    type Item = Result<Tuple, StorageError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.rx.as_ref()?.recv().ok()
    }
}

impl Drop for TupleStream {
    fn drop(&mut self) {
        // Disconnect first so a blocked worker fails its next send.
        drop(self.rx.take());
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::association::Association;
    use crate::key::{AssociationKey, EntityKey, RowKey};
    use crate::storage::memory::{MapDatastore, MapStore};
    use crate::storage::traits::TupleConsumer;

    fn populated(count: i64) -> Arc<dyn TupleStore> {
        let store = MapStore::new(Arc::new(MapDatastore::new()));
        for id in 0..count {
            let mut tuple = Tuple::new();
            tuple.put("n", id);
            store
                .update_tuple(&tuple, &EntityKey::new("Actor", ["id"], [id]))
                .unwrap();
        }
        store
            .update_tuple(&Tuple::new(), &EntityKey::new("Film", ["id"], [1i64]))
            .unwrap();
        Arc::new(store)
    }

    #[test]
    fn test_stream_yields_every_tuple_of_table() {
        let stream = TupleStream::spawn(
            populated(20),
            vec![EntityKeyMetadata::new("Actor", ["id"])],
            4,
        )
        .unwrap();
        let tuples: Vec<Tuple> = stream.collect::<Result<_, _>>().unwrap();
        assert_eq!(tuples.len(), 20);
    }

    #[test]
    fn test_dropping_stream_stops_worker() {
        let mut stream = TupleStream::spawn(
            populated(100),
            vec![EntityKeyMetadata::new("Actor", ["id"])],
            1,
        )
        .unwrap();
        assert!(stream.next().is_some());
        drop(stream);
    }

    /// Fails every scan with a fixed backend error.
    struct FailingScan;

    impl TupleStore for FailingScan {
        fn backend_name(&self) -> &'static str {
            "failing"
        }

        fn get_tuple(&self, _key: &EntityKey) -> Result<Option<Tuple>, StorageError> {
            Ok(None)
        }

        fn create_tuple(&self, _key: &EntityKey) -> Tuple {
            Tuple::new()
        }

        fn update_tuple(&self, _tuple: &Tuple, _key: &EntityKey) -> Result<(), StorageError> {
            Ok(())
        }

        fn remove_tuple(&self, _key: &EntityKey) -> Result<(), StorageError> {
            Ok(())
        }

        fn get_association(
            &self,
            _key: &AssociationKey,
        ) -> Result<Option<Association>, StorageError> {
            Ok(None)
        }

        fn create_association(&self, _key: &AssociationKey) -> Association {
            Association::new()
        }

        fn update_association(
            &self,
            _association: &Association,
            _key: &AssociationKey,
        ) -> Result<(), StorageError> {
            Ok(())
        }

        fn remove_association(&self, _key: &AssociationKey) -> Result<(), StorageError> {
            Ok(())
        }

        fn create_tuple_association(&self, _key: &AssociationKey, _row_key: &RowKey) -> Tuple {
            Tuple::new()
        }

        fn next_value(
            &self,
            _key: &RowKey,
            _increment: i64,
            initial: i64,
        ) -> Result<i64, StorageError> {
            Ok(initial)
        }

        fn for_each_tuple(
            &self,
            _consumer: &mut TupleConsumer<'_>,
            _tables: &[EntityKeyMetadata],
        ) -> Result<(), StorageError> {
            Err(StorageError::BackendError("scan consumer dropped".to_string()))
        }
    }

    #[test]
    fn test_backend_error_text_is_not_mistaken_for_drop() {
        let mut stream = TupleStream::spawn(
            Arc::new(FailingScan),
            vec![EntityKeyMetadata::new("Actor", ["id"])],
            2,
        )
        .unwrap();
        assert!(matches!(
            stream.next(),
            Some(Err(StorageError::BackendError(message))) if message == "scan consumer dropped"
        ));
        assert!(stream.next().is_none());
    }

    #[test]
    fn test_scan_error_is_last_item() {
        let handle = Arc::new(MapDatastore::new());
        handle.shutdown();
        let stopped: Arc<dyn TupleStore> = Arc::new(MapStore::new(handle));

        let mut stream = TupleStream::spawn(
            stopped,
            vec![EntityKeyMetadata::new("Actor", ["id"])],
            2,
        )
        .unwrap();
        assert!(matches!(
            stream.next(),
            Some(Err(StorageError::BackendUnavailable(_)))
        ));
        assert!(stream.next().is_none());
        assert!(stream.next_timeout(Duration::from_millis(10)).unwrap().is_none());
    }
}
