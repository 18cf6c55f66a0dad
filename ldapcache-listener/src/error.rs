//! Listener error type.

use ldapcache_core::{CacheError, ConfigError, StorageError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("Cannot open {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to initialise logging: {0}")]
    Telemetry(String),

    #[error("Failed to encode output: {0}")]
    Encode(#[from] serde_json::Error),
}

impl From<ConfigError> for ListenerError {
    fn from(err: ConfigError) -> Self {
        ListenerError::Cache(err.into())
    }
}

impl From<StorageError> for ListenerError {
    fn from(err: StorageError) -> Self {
        ListenerError::Cache(err.into())
    }
}

pub type ListenerResult<T> = Result<T, ListenerError>;
