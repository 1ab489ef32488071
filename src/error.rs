//! Error types for tuplegrid.
//!
//! Storage-level failures are described by [`StorageError`]; configuration
//! problems by [`ConfigError`]. [`GridError`] is the umbrella type returned
//! by lifecycle entry points that can fail for either reason.

use thiserror::Error;

use crate::storage::StorageError;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required value is blank.
    #[error("missing required field: {field}")]
    MissingField { field: &'static str },

    /// A value is out of range or conflicts with another.
    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    /// The config file could not be read.
    #[error("failed to read config file: {0}")]
    ReadFile(#[source] std::io::Error),

    /// The config file is not valid TOML for `StoreConfig`.
    #[error("failed to parse config: {0}")]
    Parse(#[source] toml::de::Error),

    /// A global subscriber was already installed.
    #[error("failed to initialize logging: {0}")]
    Logging(String),
}

/// Top-level error type for tuplegrid.
#[derive(Debug, Error)]
pub enum GridError {
    /// Configuration failure.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Storage failure.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl GridError {
    /// Returns true if this is a configuration error.
    #[must_use]
    pub const fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }

    /// Returns true if this is a storage error.
    #[must_use]
    pub const fn is_storage(&self) -> bool {
        matches!(self, Self::Storage(_))
    }

    /// Returns true if a higher orchestration layer may retry the call.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Config(_) => false,
            Self::Storage(e) => e.is_retryable(),
        }
    }
}

/// Result type alias for tuplegrid operations.
pub type GridResult<T> = Result<T, GridError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::MissingField { field: "graph.vertex_index" };
        assert!(err.to_string().contains("graph.vertex_index"));

        let err = ConfigError::InvalidValue {
            field: "sequence.max_retries",
            reason: "must be greater than zero".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("sequence.max_retries"));
        assert!(msg.contains("greater than zero"));
    }

    #[test]
    fn test_grid_error_from_config() {
        let err: GridError = ConfigError::Logging("already set".to_string()).into();
        assert!(err.is_config());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_grid_error_from_storage() {
        let err: GridError = StorageError::BackendUnavailable("stopped".to_string()).into();
        assert!(err.is_storage());
        assert!(err.is_retryable());

        let err: GridError = StorageError::InvalidKey("bad".to_string()).into();
        assert!(!err.is_retryable());
    }
}
