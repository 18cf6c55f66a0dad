//! Configuration types
//!
//! Every struct has a `Default` with production values and a `from_env()`
//! constructor. Unparseable environment values fall back to the default;
//! `validate()` rejects values that would make the cache unusable.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

/// Default location of the cache environment.
pub const DEFAULT_STORAGE_PATH: &str = "/var/lib/ldapcache";
/// Default pre-allocated map size (megabytes).
pub const DEFAULT_MAX_SIZE_MB: usize = 2048;
/// Default limit on named sub-databases (one per shard).
pub const DEFAULT_MAX_SUB_DATABASES: u32 = 128;
/// Default number of processed messages between cleanup runs.
pub const DEFAULT_CLEANUP_INTERVAL: u64 = 1000;
/// Default number of keys deleted per cleanup write transaction.
pub const DEFAULT_CLEANUP_BATCH_SIZE: usize = 500;

const DEFAULT_MAX_RETRIES: u32 = 5;
const DEFAULT_INITIAL_BACKOFF_MS: u64 = 100;
const DEFAULT_MAX_BACKOFF_MS: u64 = 5_000;
const DEFAULT_RECONNECT_BACKOFF_MS: u64 = 1_000;

// ============================================================================
// STORAGE
// ============================================================================

/// Location and sizing of the embedded store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding the environment files.
    pub path: PathBuf,
    /// Maximum environment size in megabytes.
    pub max_size_mb: usize,
    /// Maximum number of named sub-databases.
    pub max_sub_databases: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_STORAGE_PATH),
            max_size_mb: DEFAULT_MAX_SIZE_MB,
            max_sub_databases: DEFAULT_MAX_SUB_DATABASES,
        }
    }
}

impl StorageConfig {
    /// Create StorageConfig from environment variables.
    ///
    /// Environment variables:
    /// - `LDAPCACHE_STORAGE_PATH`: environment directory (default: /var/lib/ldapcache)
    /// - `LDAPCACHE_MAX_SIZE_MB`: map size in megabytes (default: 2048)
    /// - `LDAPCACHE_MAX_SUB_DATABASES`: sub-database limit (default: 128)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            path: std::env::var("LDAPCACHE_STORAGE_PATH")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .map(PathBuf::from)
                .unwrap_or(defaults.path),
            max_size_mb: env_parse("LDAPCACHE_MAX_SIZE_MB").unwrap_or(defaults.max_size_mb),
            max_sub_databases: env_parse("LDAPCACHE_MAX_SUB_DATABASES")
                .unwrap_or(defaults.max_sub_databases),
        }
    }

    /// Map size in bytes.
    pub fn map_size_bytes(&self) -> usize {
        self.max_size_mb * 1024 * 1024
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.path.as_os_str().is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "storage.path".to_string(),
            });
        }
        if self.max_size_mb == 0 {
            return Err(ConfigError::InvalidValue {
                field: "storage.max_size_mb".to_string(),
                value: "0".to_string(),
                reason: "map size must be positive".to_string(),
            });
        }
        if self.max_sub_databases == 0 {
            return Err(ConfigError::InvalidValue {
                field: "storage.max_sub_databases".to_string(),
                value: "0".to_string(),
                reason: "at least one sub-database is required".to_string(),
            });
        }
        Ok(())
    }
}

// ============================================================================
// RETRY
// ============================================================================

/// Retry policy for transient storage failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            initial_backoff: Duration::from_millis(DEFAULT_INITIAL_BACKOFF_MS),
            max_backoff: Duration::from_millis(DEFAULT_MAX_BACKOFF_MS),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Create RetryConfig from environment variables.
    ///
    /// - `LDAPCACHE_RETRY_MAX`: attempts after the first (default: 5)
    /// - `LDAPCACHE_RETRY_INITIAL_BACKOFF_MS`: first delay (default: 100)
    /// - `LDAPCACHE_RETRY_MAX_BACKOFF_MS`: delay ceiling (default: 5000)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_retries: env_parse("LDAPCACHE_RETRY_MAX").unwrap_or(defaults.max_retries),
            initial_backoff: env_parse("LDAPCACHE_RETRY_INITIAL_BACKOFF_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.initial_backoff),
            max_backoff: env_parse("LDAPCACHE_RETRY_MAX_BACKOFF_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.max_backoff),
            backoff_multiplier: defaults.backoff_multiplier,
        }
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (1-based), capped at `max_backoff`.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let factor = f64::from(self.backoff_multiplier.max(1.0)).powi(exponent);
        let millis = (self.initial_backoff.as_millis() as f64 * factor)
            .min(self.max_backoff.as_millis() as f64);
        Duration::from_millis(millis as u64)
    }
}

// ============================================================================
// CONSUMER
// ============================================================================

/// Event consumer settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Processed messages between `cleanup_all` runs.
    pub cleanup_interval: u64,
    /// Keys deleted per cleanup write transaction.
    pub cleanup_batch_size: usize,
    /// Policy for transient storage errors.
    pub retry: RetryConfig,
    /// Delay between reconnect attempts after a transport failure.
    pub reconnect_backoff: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            cleanup_batch_size: DEFAULT_CLEANUP_BATCH_SIZE,
            retry: RetryConfig::default(),
            reconnect_backoff: Duration::from_millis(DEFAULT_RECONNECT_BACKOFF_MS),
        }
    }
}

impl ConsumerConfig {
    /// Create ConsumerConfig from environment variables.
    ///
    /// - `LDAPCACHE_CLEANUP_INTERVAL`: messages between cleanups (default: 1000)
    /// - `LDAPCACHE_CLEANUP_BATCH_SIZE`: deletes per transaction (default: 500)
    /// - `LDAPCACHE_RECONNECT_BACKOFF_MS`: reconnect delay (default: 1000)
    /// - plus the `LDAPCACHE_RETRY_*` variables of [`RetryConfig::from_env`]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            cleanup_interval: env_parse("LDAPCACHE_CLEANUP_INTERVAL")
                .unwrap_or(defaults.cleanup_interval),
            cleanup_batch_size: env_parse("LDAPCACHE_CLEANUP_BATCH_SIZE")
                .unwrap_or(defaults.cleanup_batch_size),
            retry: RetryConfig::from_env(),
            reconnect_backoff: env_parse("LDAPCACHE_RECONNECT_BACKOFF_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.reconnect_backoff),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cleanup_interval == 0 {
            return Err(ConfigError::InvalidValue {
                field: "consumer.cleanup_interval".to_string(),
                value: "0".to_string(),
                reason: "interval must be positive".to_string(),
            });
        }
        if self.cleanup_batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "consumer.cleanup_batch_size".to_string(),
                value: "0".to_string(),
                reason: "batch size must be positive".to_string(),
            });
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let storage = StorageConfig::default();
        assert_eq!(storage.path, PathBuf::from(DEFAULT_STORAGE_PATH));
        assert_eq!(storage.map_size_bytes(), 2048 * 1024 * 1024);
        assert!(storage.validate().is_ok());

        let consumer = ConsumerConfig::default();
        assert_eq!(consumer.cleanup_interval, 1000);
        assert!(consumer.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let storage = StorageConfig {
            max_sub_databases: 0,
            ..StorageConfig::default()
        };
        assert!(matches!(
            storage.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));

        let consumer = ConsumerConfig {
            cleanup_interval: 0,
            ..ConsumerConfig::default()
        };
        assert!(matches!(
            consumer.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let retry = RetryConfig {
            max_retries: 10,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(1000),
            backoff_multiplier: 2.0,
        };
        assert_eq!(retry.backoff_for(1), Duration::from_millis(100));
        assert_eq!(retry.backoff_for(2), Duration::from_millis(200));
        assert_eq!(retry.backoff_for(3), Duration::from_millis(400));
        assert_eq!(retry.backoff_for(10), Duration::from_millis(1000));
    }

    #[test]
    fn test_retry_none() {
        assert_eq!(RetryConfig::none().max_retries, 0);
    }
}
