//! Datastore configuration loaded from TOML.
//!
//! Every section is optional and falls back to its defaults:
//!
//! ```toml
//! backend = "cache"            # map | graph | cache | keyvalue
//!
//! [cache]
//! write_mode = "delta"         # compare_and_swap | delta
//! max_cas_retries = 64
//!
//! [sequence]
//! max_retries = 1000
//!
//! [logging]
//! level = "tuplegrid=debug"
//! format = "json"              # pretty | json
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, EnvFilter};

use crate::error::ConfigError;
use crate::sequence::{SequenceGenerator, DEFAULT_MAX_RETRIES};
use crate::storage::cache::CacheWriteMode;

/// Which backend family the datastore runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Sharded in-process maps.
    #[default]
    Map,
    /// Embedded property graph.
    Graph,
    /// Whole-value remote cache.
    Cache,
    /// Hash/set key-value server.
    KeyValue,
}

/// Index names used by the graph backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GraphConfig {
    /// Index over entity and row vertices.
    pub vertex_index: String,
    /// Index over association edges.
    pub edge_index: String,
    /// Index over sequence vertices.
    pub sequence_index: String,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            vertex_index: "tuplegrid_vertices".to_string(),
            edge_index: "tuplegrid_edges".to_string(),
            sequence_index: "tuplegrid_sequences".to_string(),
        }
    }
}

/// Store names and write strategy of the cache backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// Store holding entity tuples.
    pub entity_store: String,
    /// Store holding association rows.
    pub association_store: String,
    /// Store holding sequence counters.
    pub identifier_store: String,
    /// How updates reach the cache.
    pub write_mode: CacheWriteMode,
    /// Attempts per compare-and-swap write before giving up.
    pub max_cas_retries: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            entity_store: "ENTITIES".to_string(),
            association_store: "ASSOCIATIONS".to_string(),
            identifier_store: "IDENTIFIERS".to_string(),
            write_mode: CacheWriteMode::default(),
            max_cas_retries: 100,
        }
    }
}

/// Key-value backend tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KeyValueConfig {
    /// Keys requested per scan page.
    pub scan_batch_size: usize,
    /// Attempts per WATCH/EXEC transaction before giving up.
    pub max_transaction_retries: u32,
}

impl Default for KeyValueConfig {
    fn default() -> Self {
        Self {
            scan_batch_size: 100,
            max_transaction_retries: 100,
        }
    }
}

/// Sequence generator tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SequenceConfig {
    /// Attempts per `next_value` call before `ContentionExceeded`.
    pub max_retries: u32,
}

impl Default for SequenceConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Pretty,
    /// One JSON object per event.
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// Filter directive, e.g. `info` or `tuplegrid=debug`. `RUST_LOG`
    /// overrides it when set.
    pub level: String,
    /// Output format.
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: LogFormat::Pretty,
        }
    }
}

impl LoggingConfig {
    /// Installs a global tracing subscriber for this configuration.
    ///
    /// # Errors
    /// If a global subscriber is already installed.
    pub fn init(&self) -> Result<(), ConfigError> {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.level));

        let result = match self.format {
            LogFormat::Json => fmt().json().with_env_filter(filter).try_init(),
            LogFormat::Pretty => fmt().with_env_filter(filter).try_init(),
        };
        result.map_err(|e| ConfigError::Logging(e.to_string()))
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    /// Backend to start.
    pub backend: BackendKind,
    /// `[graph]` section.
    pub graph: GraphConfig,
    /// `[cache]` section.
    pub cache: CacheConfig,
    /// `[keyvalue]` section.
    pub keyvalue: KeyValueConfig,
    /// `[sequence]` section.
    pub sequence: SequenceConfig,
    /// `[logging]` section.
    pub logging: LoggingConfig,
}

fn require_name(field: &'static str, value: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        Err(ConfigError::MissingField { field })
    } else {
        Ok(())
    }
}

fn require_positive(field: &'static str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        Err(ConfigError::InvalidValue {
            field,
            reason: "must be greater than zero".to_string(),
        })
    } else {
        Ok(())
    }
}

fn require_distinct(field: &'static str, names: &[&str]) -> Result<(), ConfigError> {
    for (i, name) in names.iter().enumerate() {
        if names[..i].contains(name) {
            return Err(ConfigError::InvalidValue {
                field,
                reason: format!("{name:?} is used more than once"),
            });
        }
    }
    Ok(())
}

impl StoreConfig {
    /// Reads, parses and validates a TOML file.
    ///
    /// # Errors
    /// `ReadFile`, `Parse`, or any error from [`StoreConfig::validate`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(ConfigError::ReadFile)?;
        Self::from_toml_str(&raw)
    }

    /// Parses and validates a TOML document.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw).map_err(ConfigError::Parse)?;
        config.validate()
    }

    /// Validate configuration values.
    ///
    /// # Errors
    /// `MissingField` for blank names, `InvalidValue` for zero limits,
    /// duplicated store names or an unparsable log filter.
    pub fn validate(self) -> Result<Self, ConfigError> {
        require_name("graph.vertex_index", &self.graph.vertex_index)?;
        require_name("graph.edge_index", &self.graph.edge_index)?;
        require_name("graph.sequence_index", &self.graph.sequence_index)?;
        require_distinct(
            "graph",
            &[
                &self.graph.vertex_index,
                &self.graph.edge_index,
                &self.graph.sequence_index,
            ],
        )?;

        require_name("cache.entity_store", &self.cache.entity_store)?;
        require_name("cache.association_store", &self.cache.association_store)?;
        require_name("cache.identifier_store", &self.cache.identifier_store)?;
        require_distinct(
            "cache",
            &[
                &self.cache.entity_store,
                &self.cache.association_store,
                &self.cache.identifier_store,
            ],
        )?;
        require_positive("cache.max_cas_retries", u64::from(self.cache.max_cas_retries))?;

        require_positive(
            "keyvalue.scan_batch_size",
            self.keyvalue.scan_batch_size as u64,
        )?;
        require_positive(
            "keyvalue.max_transaction_retries",
            u64::from(self.keyvalue.max_transaction_retries),
        )?;

        require_positive("sequence.max_retries", u64::from(self.sequence.max_retries))?;

        require_name("logging.level", &self.logging.level)?;
        EnvFilter::try_new(&self.logging.level).map_err(|e| ConfigError::InvalidValue {
            field: "logging.level",
            reason: e.to_string(),
        })?;

        Ok(self)
    }

    /// Sequence generator honoring `[sequence]`.
    #[must_use]
    pub const fn sequence_generator(&self) -> SequenceGenerator {
        SequenceGenerator::new(self.sequence.max_retries)
    }
}
