//! Key-value mapping of tuples and associations.
//!
//! Keys are split into domain spaces by prefix:
//!
//! | prefix | holds                                               |
//! |--------|-----------------------------------------------------|
//! | `E_`   | hash of an entity's columns, one field per column   |
//! | `A_`   | set of the row identifiers of one association       |
//! | `R_`   | hash of one association row, `R_<assoc id>:<row id>` |
//! | `S_`   | counter value as a decimal string                   |
//!
//! Every logical write is one WATCH/EXEC transaction: concurrent writers
//! to the same key either land as a whole or retry.

use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::association::{Association, MapAssociationSnapshot, RowMap};
use crate::identifier::{association_id, entity_id, owned_association_prefix, row_id, table_prefix};
use crate::key::{AssociationKey, EntityKey, EntityKeyMetadata, RowKey};
use crate::operation::AssociationOperation;
use crate::sequence::{CounterBackend, SequenceGenerator};
use crate::storage::columns::{
    apply_tuple_operations, check_row_keys, entity_key_columns, row_columns,
};
use crate::storage::keyvalue::codec::{decode_columns, encode_columns};
use crate::storage::keyvalue::server::{Command, KeyValueConnection, WatchToken};
use crate::storage::traits::{StorageError, TupleConsumer, TupleStore};
use crate::tuple::Tuple;

const ENTITY_PREFIX: &str = "E_";
const ASSOCIATION_PREFIX: &str = "A_";
const ROW_PREFIX: &str = "R_";
const SEQUENCE_PREFIX: &str = "S_";

fn entity_key(key: &EntityKey) -> String {
    format!("{ENTITY_PREFIX}{}", entity_id(key))
}

fn association_key(key: &AssociationKey) -> String {
    format!("{ASSOCIATION_PREFIX}{}", association_id(key))
}

/// Row hash key from an association set key and one of its members.
fn row_key(association_key: &str, member: &str) -> String {
    let association = association_key
        .strip_prefix(ASSOCIATION_PREFIX)
        .unwrap_or(association_key);
    format!("{ROW_PREFIX}{association}:{member}")
}

fn sequence_key(key: &RowKey) -> String {
    format!("{SEQUENCE_PREFIX}{}", row_id(key))
}

/// Counter primitives over `S_` keys.
struct StringCounters<'a> {
    connection: &'a dyn KeyValueConnection,
}

impl CounterBackend for StringCounters<'_> {
    type Token = WatchToken;

    fn read(&self, key: &RowKey) -> Result<(Option<i64>, WatchToken), StorageError> {
        let counter = sequence_key(key);
        let token = self.connection.watch(&counter)?;
        let value = self
            .connection
            .get(&counter)?
            .map(|raw| {
                raw.parse::<i64>().map_err(|e| {
                    StorageError::SerializationError(format!(
                        "counter {counter} holds {raw:?}: {e}"
                    ))
                })
            })
            .transpose()?;
        Ok((value, token))
    }

    fn create(&self, key: &RowKey, token: WatchToken, value: i64) -> Result<bool, StorageError> {
        self.replace(key, token, value)
    }

    fn replace(&self, key: &RowKey, token: WatchToken, value: i64) -> Result<bool, StorageError> {
        self.connection.exec(
            &[token],
            &[Command::Set {
                key: sequence_key(key),
                value: value.to_string(),
            }],
        )
    }
}

/// Adapter over a [`KeyValueConnection`].
#[derive(Clone)]
pub struct KeyValueStore {
    connection: Arc<dyn KeyValueConnection>,
    scan_batch_size: usize,
    max_transaction_retries: u32,
    sequences: SequenceGenerator,
}

impl std::fmt::Debug for KeyValueStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyValueStore")
            .field("scan_batch_size", &self.scan_batch_size)
            .field("max_transaction_retries", &self.max_transaction_retries)
            .field("sequences", &self.sequences)
            .finish_non_exhaustive()
    }
}

impl KeyValueStore {
    #[must_use]
    pub fn new(
        connection: Arc<dyn KeyValueConnection>,
        scan_batch_size: usize,
        max_transaction_retries: u32,
        sequences: SequenceGenerator,
    ) -> Self {
        Self {
            connection,
            scan_batch_size,
            max_transaction_retries,
            sequences,
        }
    }

    /// Runs WATCH `watched` / build commands / EXEC until EXEC goes through.
    ///
    /// `build` reads current state and returns the batch to apply; an empty
    /// batch finishes the transaction without writing.
    fn transaction(
        &self,
        watched: &[String],
        build: impl Fn(&dyn KeyValueConnection) -> Result<Vec<Command>, StorageError>,
    ) -> Result<(), StorageError> {
        let connection = self.connection.as_ref();
        for attempt in 1..=self.max_transaction_retries {
            let tokens = watched
                .iter()
                .map(|key| connection.watch(key))
                .collect::<Result<Vec<_>, _>>()?;
            let commands = build(connection)?;
            if commands.is_empty() || connection.exec(&tokens, &commands)? {
                return Ok(());
            }
            trace!(?watched, attempt, "transaction aborted, retrying");
        }
        warn!(
            ?watched,
            attempts = self.max_transaction_retries,
            "transaction retry cap reached"
        );
        Err(StorageError::ContentionExceeded {
            key: watched.join(","),
            attempts: self.max_transaction_retries,
        })
    }

    /// Keys of every association set owned by `owner`.
    fn owned_association_keys(&self, owner: &EntityKey) -> Result<Vec<String>, StorageError> {
        let prefix = format!("{ASSOCIATION_PREFIX}{}", owned_association_prefix(owner));
        self.scan_all(&prefix)
    }

    fn scan_all(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let mut keys = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = self
                .connection
                .scan(prefix, cursor.as_deref(), self.scan_batch_size)?;
            keys.extend(page.keys);
            match page.cursor {
                Some(next) => cursor = Some(next),
                None => return Ok(keys),
            }
        }
    }

    /// The set key plus every row hash key of one association.
    fn association_contents(
        connection: &dyn KeyValueConnection,
        set_key: &str,
    ) -> Result<Vec<String>, StorageError> {
        let mut keys = vec![set_key.to_string()];
        keys.extend(
            connection
                .smembers(set_key)?
                .iter()
                .map(|member| row_key(set_key, member)),
        );
        Ok(keys)
    }
}

impl TupleStore for KeyValueStore {
    fn backend_name(&self) -> &'static str {
        "keyvalue"
    }

    fn get_tuple(&self, key: &EntityKey) -> Result<Option<Tuple>, StorageError> {
        let fields = self.connection.hgetall(&entity_key(key))?;
        if fields.is_empty() {
            return Ok(None);
        }
        Ok(Some(Tuple::from_columns(decode_columns(&fields)?)))
    }

    fn create_tuple(&self, _key: &EntityKey) -> Tuple {
        Tuple::new()
    }

    fn update_tuple(&self, tuple: &Tuple, key: &EntityKey) -> Result<(), StorageError> {
        let hash = entity_key(key);
        self.transaction(std::slice::from_ref(&hash), |connection| {
            let current = decode_columns(&connection.hgetall(&hash)?)?;
            let mut next = if current.is_empty() {
                entity_key_columns(key)
            } else {
                current.clone()
            };
            apply_tuple_operations(&mut next, tuple);

            let changed: std::collections::HashMap<_, _> = next
                .iter()
                .filter(|(name, value)| current.get(*name) != Some(*value))
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect();
            let removed: Vec<String> = current
                .keys()
                .filter(|name| !next.contains_key(*name))
                .cloned()
                .collect();

            let mut commands = Vec::new();
            if !removed.is_empty() {
                commands.push(Command::HDel {
                    key: hash.clone(),
                    fields: removed,
                });
            }
            if !changed.is_empty() {
                commands.push(Command::HSet {
                    key: hash.clone(),
                    fields: encode_columns(&changed)?,
                });
            }
            Ok(commands)
        })?;
        debug!(%key, operations = tuple.operations().len(), "updated tuple");
        Ok(())
    }

    fn remove_tuple(&self, key: &EntityKey) -> Result<(), StorageError> {
        let hash = entity_key(key);
        let mut watched = self.owned_association_keys(key)?;
        let associations = watched.len();
        watched.push(hash);
        self.transaction(&watched, |connection| {
            let mut doomed = Vec::new();
            for set_key in &watched[..associations] {
                doomed.extend(Self::association_contents(connection, set_key)?);
            }
            doomed.push(watched[associations].clone());
            Ok(vec![Command::Del { keys: doomed }])
        })?;
        debug!(%key, associations, "removed tuple");
        Ok(())
    }

    fn get_association(&self, key: &AssociationKey) -> Result<Option<Association>, StorageError> {
        let set_key = association_key(key);
        let members = self.connection.smembers(&set_key)?;
        if members.is_empty() {
            return Ok(None);
        }
        let mut rows = RowMap::new();
        for member in &members {
            let columns = decode_columns(&self.connection.hgetall(&row_key(&set_key, member))?)?;
            let row = key.row_key_from(|c| columns.get(c));
            rows.insert(row, columns);
        }
        Ok(Some(Association::from_snapshot(MapAssociationSnapshot::new(
            rows,
        ))))
    }

    fn create_association(&self, _key: &AssociationKey) -> Association {
        Association::new()
    }

    fn create_tuple_association(&self, _key: &AssociationKey, _row_key: &RowKey) -> Tuple {
        Tuple::new()
    }

    fn update_association(
        &self,
        association: &Association,
        key: &AssociationKey,
    ) -> Result<(), StorageError> {
        check_row_keys(association, key)?;
        let set_key = association_key(key);
        self.transaction(std::slice::from_ref(&set_key), |connection| {
            let mut commands = Vec::new();
            for operation in association.operations() {
                match operation {
                    AssociationOperation::Clear => {
                        commands.push(Command::Del {
                            keys: Self::association_contents(connection, &set_key)?,
                        });
                    }
                    AssociationOperation::Put { key: row, value } => {
                        let member = row_id(row);
                        let hash = row_key(&set_key, &member);
                        commands.push(Command::SAdd {
                            key: set_key.clone(),
                            members: vec![member],
                        });
                        commands.push(Command::Del {
                            keys: vec![hash.clone()],
                        });
                        commands.push(Command::HSet {
                            key: hash,
                            fields: encode_columns(&row_columns(row, value))?,
                        });
                    }
                    AssociationOperation::PutNull { key: row }
                    | AssociationOperation::Remove { key: row } => {
                        let member = row_id(row);
                        commands.push(Command::Del {
                            keys: vec![row_key(&set_key, &member)],
                        });
                        commands.push(Command::SRem {
                            key: set_key.clone(),
                            members: vec![member],
                        });
                    }
                }
            }
            Ok(commands)
        })?;
        debug!(%key, operations = association.operations().len(), "updated association");
        Ok(())
    }

    fn remove_association(&self, key: &AssociationKey) -> Result<(), StorageError> {
        let set_key = association_key(key);
        self.transaction(std::slice::from_ref(&set_key), |connection| {
            Ok(vec![Command::Del {
                keys: Self::association_contents(connection, &set_key)?,
            }])
        })?;
        debug!(%key, "removed association");
        Ok(())
    }

    fn next_value(&self, key: &RowKey, increment: i64, initial: i64) -> Result<i64, StorageError> {
        let counters = StringCounters {
            connection: self.connection.as_ref(),
        };
        self.sequences.next_value(&counters, key, increment, initial)
    }

    fn for_each_tuple(
        &self,
        consumer: &mut TupleConsumer<'_>,
        tables: &[EntityKeyMetadata],
    ) -> Result<(), StorageError> {
        for table in tables {
            let prefix = format!("{ENTITY_PREFIX}{}", table_prefix(table.table()));
            let mut cursor: Option<String> = None;
            loop {
                let page = self
                    .connection
                    .scan(&prefix, cursor.as_deref(), self.scan_batch_size)?;
                for hash in &page.keys {
                    let fields = self.connection.hgetall(hash)?;
                    if !fields.is_empty() {
                        consumer(Tuple::from_columns(decode_columns(&fields)?))?;
                    }
                }
                match page.cursor {
                    Some(next) => cursor = Some(next),
                    None => break,
                }
            }
        }
        Ok(())
    }
}
