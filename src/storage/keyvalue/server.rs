//! Key-value server connection surface and an in-process server.
//!
//! The surface mirrors a RESP server: hashes, sets and plain strings under
//! flat keys, cursor-based prefix scans, and optimistic transactions. A
//! client WATCHes keys, reads, then submits a command batch with
//! [`KeyValueConnection::exec`]; the batch is applied atomically unless a
//! watched key changed since it was watched, in which case nothing is
//! applied and `exec` returns `false`.
//!
//! As on a RESP server, a command failing inside an executed batch does
//! not undo the commands before it.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use tracing::info;

use crate::storage::StorageError;

fn lock_err(context: &'static str) -> StorageError {
    StorageError::BackendError(format!("poisoned lock: {context}"))
}

/// A write command, queued inside a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    HSet {
        key: String,
        fields: Vec<(String, String)>,
    },
    HDel {
        key: String,
        fields: Vec<String>,
    },
    SAdd {
        key: String,
        members: Vec<String>,
    },
    SRem {
        key: String,
        members: Vec<String>,
    },
    Set {
        key: String,
        value: String,
    },
    Del {
        keys: Vec<String>,
    },
}

/// Version of a key observed by WATCH.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchToken {
    key: String,
    version: u64,
}

impl WatchToken {
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }
}

/// One page of a prefix scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanPage {
    pub keys: Vec<String>,
    /// Cursor for the next page; `None` once the scan is complete.
    pub cursor: Option<String>,
}

/// Connection to a key-value server.
pub trait KeyValueConnection: Send + Sync {
    /// Every field of a hash; empty if the key does not exist.
    fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StorageError>;

    /// Every member of a set; empty if the key does not exist.
    fn smembers(&self, key: &str) -> Result<BTreeSet<String>, StorageError>;

    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    fn exists(&self, key: &str) -> Result<bool, StorageError>;

    /// Up to `count` keys starting with `prefix`, after `cursor`.
    fn scan(
        &self,
        prefix: &str,
        cursor: Option<&str>,
        count: usize,
    ) -> Result<ScanPage, StorageError>;

    fn watch(&self, key: &str) -> Result<WatchToken, StorageError>;

    /// Applies `commands` atomically if no watched key has changed.
    ///
    /// Returns `false` (and applies nothing) if the transaction aborted.
    fn exec(&self, watched: &[WatchToken], commands: &[Command]) -> Result<bool, StorageError>;

    /// Applies one command outside any transaction.
    fn execute(&self, command: Command) -> Result<(), StorageError> {
        self.exec(&[], std::slice::from_ref(&command)).map(|_| ())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Entry {
    Hash(HashMap<String, String>),
    Set(BTreeSet<String>),
    Str(String),
}

impl Entry {
    const fn type_name(&self) -> &'static str {
        match self {
            Self::Hash(_) => "hash",
            Self::Set(_) => "set",
            Self::Str(_) => "string",
        }
    }

    fn is_empty(&self) -> bool {
        match self {
            Self::Hash(fields) => fields.is_empty(),
            Self::Set(members) => members.is_empty(),
            Self::Str(_) => false,
        }
    }
}

fn wrong_type(key: &str, expected: &str, found: &Entry) -> StorageError {
    StorageError::BackendError(format!(
        "WRONGTYPE key {key:?} holds a {} value, expected {expected}",
        found.type_name()
    ))
}

#[derive(Debug, Default)]
struct ServerState {
    data: BTreeMap<String, Entry>,
    /// Last modification of each live key.
    versions: HashMap<String, u64>,
    /// Clock of the latest removal of any key. Absent keys report it as
    /// their version, so a key created and removed again after a WATCH
    /// still aborts the transaction.
    removed_at: u64,
    clock: u64,
}

impl ServerState {
    fn version(&self, key: &str) -> u64 {
        self.versions.get(key).copied().unwrap_or(self.removed_at)
    }

    fn touch(&mut self, key: &str) {
        self.clock += 1;
        if self.data.contains_key(key) {
            self.versions.insert(key.to_string(), self.clock);
        } else {
            self.versions.remove(key);
            self.removed_at = self.clock;
        }
    }

    fn drop_if_empty(&mut self, key: &str) {
        if self.data.get(key).is_some_and(Entry::is_empty) {
            self.data.remove(key);
        }
    }

    fn hash_mut(&mut self, key: &str) -> Result<&mut HashMap<String, String>, StorageError> {
        match self
            .data
            .entry(key.to_string())
            .or_insert_with(|| Entry::Hash(HashMap::new()))
        {
            Entry::Hash(fields) => Ok(fields),
            other => Err(wrong_type(key, "hash", other)),
        }
    }

    fn set_mut(&mut self, key: &str) -> Result<&mut BTreeSet<String>, StorageError> {
        match self
            .data
            .entry(key.to_string())
            .or_insert_with(|| Entry::Set(BTreeSet::new()))
        {
            Entry::Set(members) => Ok(members),
            other => Err(wrong_type(key, "set", other)),
        }
    }

    fn apply(&mut self, command: &Command) -> Result<(), StorageError> {
        match command {
            Command::HSet { key, fields } => {
                let hash = self.hash_mut(key)?;
                for (field, value) in fields {
                    hash.insert(field.clone(), value.clone());
                }
                self.drop_if_empty(key);
                self.touch(key);
            }
            Command::HDel { key, fields } => {
                if self.data.contains_key(key) {
                    let hash = self.hash_mut(key)?;
                    for field in fields {
                        hash.remove(field);
                    }
                    self.drop_if_empty(key);
                    self.touch(key);
                }
            }
            Command::SAdd { key, members } => {
                let set = self.set_mut(key)?;
                set.extend(members.iter().cloned());
                self.drop_if_empty(key);
                self.touch(key);
            }
            Command::SRem { key, members } => {
                if self.data.contains_key(key) {
                    let set = self.set_mut(key)?;
                    for member in members {
                        set.remove(member);
                    }
                    self.drop_if_empty(key);
                    self.touch(key);
                }
            }
            Command::Set { key, value } => {
                self.data.insert(key.clone(), Entry::Str(value.clone()));
                self.touch(key);
            }
            Command::Del { keys } => {
                for key in keys {
                    if self.data.remove(key).is_some() {
                        self.touch(key);
                    }
                }
            }
        }
        Ok(())
    }
}

/// In-process key-value server.
#[derive(Debug)]
pub struct InMemoryKeyValueServer {
    state: RwLock<ServerState>,
    running: AtomicBool,
}

impl Default for InMemoryKeyValueServer {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryKeyValueServer {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: RwLock::new(ServerState::default()),
            running: AtomicBool::new(true),
        }
    }

    /// Stops the server. Every later call fails with `BackendUnavailable`.
    pub fn shutdown(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            info!("key-value server stopped");
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Number of live keys.
    pub fn dbsize(&self) -> Result<usize, StorageError> {
        Ok(self.read()?.data.len())
    }

    fn ensure_running(&self) -> Result<(), StorageError> {
        if self.is_running() {
            Ok(())
        } else {
            Err(StorageError::BackendUnavailable(
                "key-value server has been shut down".to_string(),
            ))
        }
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, ServerState>, StorageError> {
        self.ensure_running()?;
        self.state.read().map_err(|_| lock_err("key-value state"))
    }
}

impl KeyValueConnection for InMemoryKeyValueServer {
    fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StorageError> {
        match self.read()?.data.get(key) {
            None => Ok(HashMap::new()),
            Some(Entry::Hash(fields)) => Ok(fields.clone()),
            Some(other) => Err(wrong_type(key, "hash", other)),
        }
    }

    fn smembers(&self, key: &str) -> Result<BTreeSet<String>, StorageError> {
        match self.read()?.data.get(key) {
            None => Ok(BTreeSet::new()),
            Some(Entry::Set(members)) => Ok(members.clone()),
            Some(other) => Err(wrong_type(key, "set", other)),
        }
    }

    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        match self.read()?.data.get(key) {
            None => Ok(None),
            Some(Entry::Str(value)) => Ok(Some(value.clone())),
            Some(other) => Err(wrong_type(key, "string", other)),
        }
    }

    fn exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.read()?.data.contains_key(key))
    }

    fn scan(
        &self,
        prefix: &str,
        cursor: Option<&str>,
        count: usize,
    ) -> Result<ScanPage, StorageError> {
        let state = self.read()?;
        let start = cursor.map_or(Bound::Included(prefix), Bound::Excluded);
        let keys: Vec<String> = state
            .data
            .range::<str, _>((start, Bound::Unbounded))
            .map(|(key, _)| key)
            .take_while(|key| key.starts_with(prefix))
            .take(count)
            .cloned()
            .collect();
        let cursor = if count > 0 && keys.len() == count {
            keys.last().cloned()
        } else {
            None
        };
        Ok(ScanPage { keys, cursor })
    }

    fn watch(&self, key: &str) -> Result<WatchToken, StorageError> {
        Ok(WatchToken {
            key: key.to_string(),
            version: self.read()?.version(key),
        })
    }

    fn exec(&self, watched: &[WatchToken], commands: &[Command]) -> Result<bool, StorageError> {
        self.ensure_running()?;
        let mut state = self.state.write().map_err(|_| lock_err("key-value state"))?;
        if watched
            .iter()
            .any(|token| state.version(&token.key) != token.version)
        {
            return Ok(false);
        }
        for command in commands {
            state.apply(command)?;
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hset(key: &str, field: &str, value: &str) -> Command {
        Command::HSet {
            key: key.to_string(),
            fields: vec![(field.to_string(), value.to_string())],
        }
    }

    #[test]
    fn test_hash_fields_and_empty_hash_removal() {
        let server = InMemoryKeyValueServer::new();
        server.execute(hset("h", "a", "1")).unwrap();
        assert_eq!(server.hgetall("h").unwrap().get("a").map(String::as_str), Some("1"));

        server
            .execute(Command::HDel {
                key: "h".to_string(),
                fields: vec!["a".to_string()],
            })
            .unwrap();
        assert!(!server.exists("h").unwrap());
        assert!(server.hgetall("h").unwrap().is_empty());
    }

    #[test]
    fn test_watch_aborts_on_concurrent_change() {
        let server = InMemoryKeyValueServer::new();
        let token = server.watch("k").unwrap();
        server
            .execute(Command::Set {
                key: "k".to_string(),
                value: "other".to_string(),
            })
            .unwrap();

        let applied = server
            .exec(
                &[token],
                &[Command::Set {
                    key: "k".to_string(),
                    value: "mine".to_string(),
                }],
            )
            .unwrap();
        assert!(!applied);
        assert_eq!(server.get("k").unwrap().as_deref(), Some("other"));
    }

    #[test]
    fn test_watch_sees_delete_and_recreate() {
        let server = InMemoryKeyValueServer::new();
        server.execute(hset("k", "a", "1")).unwrap();
        let token = server.watch("k").unwrap();
        server
            .execute(Command::Del {
                keys: vec!["k".to_string()],
            })
            .unwrap();
        server.execute(hset("k", "a", "1")).unwrap();
        assert!(!server.exec(&[token], &[]).unwrap());
    }

    #[test]
    fn test_watch_sees_create_and_delete_of_absent_key() {
        let server = InMemoryKeyValueServer::new();
        let token = server.watch("k").unwrap();
        server.execute(hset("k", "a", "1")).unwrap();
        server
            .execute(Command::Del {
                keys: vec!["k".to_string()],
            })
            .unwrap();
        assert!(!server.exec(&[token], &[hset("k", "a", "2")]).unwrap());
        assert!(!server.exists("k").unwrap());
    }

    #[test]
    fn test_versions_of_removed_keys_are_dropped() {
        let server = InMemoryKeyValueServer::new();
        for round in 0..50 {
            let key = format!("k{round}");
            server.execute(hset(&key, "a", "1")).unwrap();
            server
                .execute(Command::HDel {
                    key: key.clone(),
                    fields: vec!["a".to_string()],
                })
                .unwrap();
            server.execute(hset(&key, "a", "1")).unwrap();
            server.execute(Command::Del { keys: vec![key] }).unwrap();
        }
        server.execute(hset("live", "a", "1")).unwrap();

        let state = server.state.read().unwrap();
        assert_eq!(state.versions.len(), 1);
        assert!(state.versions.contains_key("live"));
    }

    #[test]
    fn test_scan_pages_through_prefix() {
        let server = InMemoryKeyValueServer::new();
        for key in ["E_a", "E_b", "E_c", "F_a", "A_x"] {
            server.execute(hset(key, "f", "v")).unwrap();
        }

        let first = server.scan("E_", None, 2).unwrap();
        assert_eq!(first.keys, ["E_a", "E_b"]);
        let second = server.scan("E_", first.cursor.as_deref(), 2).unwrap();
        assert_eq!(second.keys, ["E_c"]);
        assert!(second.cursor.is_none());
    }

    #[test]
    fn test_wrong_type_is_an_error() {
        let server = InMemoryKeyValueServer::new();
        server.execute(hset("h", "a", "1")).unwrap();
        assert!(matches!(server.smembers("h"), Err(StorageError::BackendError(_))));
    }

    #[test]
    fn test_shutdown() {
        let server = InMemoryKeyValueServer::new();
        server.shutdown();
        assert!(matches!(
            server.get("k"),
            Err(StorageError::BackendUnavailable(_))
        ));
    }
}
