//! Key-value backend with optimistic WATCH/EXEC transactions.

pub mod codec;
mod dialect;
pub mod server;

pub use dialect::KeyValueStore;
pub use server::{Command, InMemoryKeyValueServer, KeyValueConnection, ScanPage, WatchToken};
