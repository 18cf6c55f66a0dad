//! Error types for ldapcache operations

use thiserror::Error;

/// Storage layer errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Storage unavailable at {path}: {reason}")]
    Unavailable { path: String, reason: String },

    #[error("Storage busy: {reason}")]
    Busy { reason: String },

    #[error("Storage contended: {reason}")]
    Contended { reason: String },

    #[error("Storage capacity exhausted: {reason}")]
    CapacityExhausted { reason: String },

    #[error("Storage corrupted: {reason}")]
    Corrupted { reason: String },

    #[error("Transaction failed: {reason}")]
    TransactionFailed { reason: String },

    #[error("Sub-database not registered: {name}")]
    UnknownSubDatabase { name: String },

    #[error("Record encoding failed for {key}: {reason}")]
    Encoding { key: String, reason: String },

    #[error("Storage environment closed")]
    Closed,

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

impl StorageError {
    /// Whether retrying the same operation may succeed.
    ///
    /// Capacity and reader-slot exhaustion clear up once readers release
    /// their snapshots or space is reclaimed; everything else needs an
    /// operator.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StorageError::Contended { .. } | StorageError::CapacityExhausted { .. }
        )
    }
}

/// Cache registry errors. These are programming errors surfaced at startup.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Cache already registered: {name}")]
    DuplicateCache { name: String },

    #[error("Shard {shard} registered twice in cache {cache}")]
    DuplicateShard { cache: String, shard: String },

    #[error("Cache {name} has no shards")]
    EmptyCache { name: String },

    #[error("Shard {shard} was opened for cache {opened_for}, not {cache}")]
    ShardMismatch {
        cache: String,
        shard: String,
        opened_for: String,
    },

    #[error("Unknown cache: {name}")]
    UnknownCache { name: String },
}

/// Projection errors for a single upstream object.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MappingError {
    #[error("Object {dn} is missing required property {property}")]
    MissingProperty { dn: String, property: String },

    #[error("Malformed DN {dn:?}: {reason}")]
    MalformedDn { dn: String, reason: String },
}

impl MappingError {
    /// DN the error refers to.
    pub fn dn(&self) -> &str {
        match self {
            MappingError::MissingProperty { dn, .. } | MappingError::MalformedDn { dn, .. } => dn,
        }
    }
}

/// Change feed errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Feed disconnected: {reason}")]
    Disconnected { reason: String },

    #[error("Malformed message {delivery}: {reason}")]
    Malformed { delivery: u64, reason: String },

    #[error("Acknowledgement failed for message {delivery}: {reason}")]
    AckFailed { delivery: u64, reason: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to read layout {path}: {reason}")]
    Layout { path: String, reason: String },
}

/// Master error type for all ldapcache errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Mapping error: {0}")]
    Mapping(#[from] MappingError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl CacheError {
    /// Whether the error is a storage failure that must stop the process.
    pub fn is_fatal_storage(&self) -> bool {
        matches!(self, CacheError::Storage(e) if !e.is_transient())
    }
}

/// Result type alias for ldapcache operations.
pub type CacheResult<T> = Result<T, CacheError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_error_display_unavailable() {
        let err = StorageError::Unavailable {
            path: "/var/lib/ldapcache".to_string(),
            reason: "permission denied".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("Storage unavailable"));
        assert!(msg.contains("/var/lib/ldapcache"));
        assert!(msg.contains("permission denied"));
    }

    #[test]
    fn test_storage_error_transient_classification() {
        assert!(StorageError::CapacityExhausted {
            reason: "map full".to_string()
        }
        .is_transient());
        assert!(StorageError::Contended {
            reason: "readers full".to_string()
        }
        .is_transient());
        assert!(!StorageError::Corrupted {
            reason: "bad page".to_string()
        }
        .is_transient());
        assert!(!StorageError::Busy {
            reason: "nested write".to_string()
        }
        .is_transient());
        assert!(!StorageError::Closed.is_transient());
    }

    #[test]
    fn test_registry_error_display() {
        let err = RegistryError::DuplicateCache {
            name: "groups".to_string(),
        };
        assert!(format!("{}", err).contains("groups"));

        let err = RegistryError::UnknownCache {
            name: "hosts".to_string(),
        };
        assert!(format!("{}", err).contains("Unknown cache: hosts"));
    }

    #[test]
    fn test_mapping_error_dn() {
        let err = MappingError::MissingProperty {
            dn: "uid=u1".to_string(),
            property: "uid".to_string(),
        };
        assert_eq!(err.dn(), "uid=u1");
        assert!(format!("{}", err).contains("missing required property uid"));
    }

    #[test]
    fn test_cache_error_from_variants() {
        let storage = CacheError::from(StorageError::Closed);
        assert!(matches!(storage, CacheError::Storage(_)));
        assert!(storage.is_fatal_storage());

        let transient = CacheError::from(StorageError::CapacityExhausted {
            reason: "map full".to_string(),
        });
        assert!(!transient.is_fatal_storage());

        let registry = CacheError::from(RegistryError::EmptyCache {
            name: "groups".to_string(),
        });
        assert!(matches!(registry, CacheError::Registry(_)));

        let mapping = CacheError::from(MappingError::MalformedDn {
            dn: String::new(),
            reason: "empty DN".to_string(),
        });
        assert!(matches!(mapping, CacheError::Mapping(_)));
        assert!(!mapping.is_fatal_storage());

        let transport = CacheError::from(TransportError::Disconnected {
            reason: "eof".to_string(),
        });
        assert!(matches!(transport, CacheError::Transport(_)));

        let config = CacheError::from(ConfigError::MissingRequired {
            field: "path".to_string(),
        });
        assert!(matches!(config, CacheError::Config(_)));
    }
}
