//! Listener configuration.
//!
//! Everything comes from environment variables first; command-line flags
//! override individual fields afterwards.

use std::path::{Path, PathBuf};

use ldapcache_core::{ConfigError, ConsumerConfig, StorageConfig};
use ldapcache_storage::Layout;

/// Default `tracing` filter when `RUST_LOG` is unset.
pub const DEFAULT_LOG_FILTER: &str = "ldapcache=info";

/// Logging configuration from environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    /// `EnvFilter` directives
    pub filter: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            filter: DEFAULT_LOG_FILTER.to_string(),
            json: false,
        }
    }
}

impl TelemetryConfig {
    /// - `RUST_LOG`: filter directives (default: ldapcache=info)
    /// - `LDAPCACHE_LOG_JSON`: `true` or `1` for JSON output
    pub fn from_env() -> Self {
        Self {
            filter: std::env::var("RUST_LOG")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string()),
            json: std::env::var("LDAPCACHE_LOG_JSON")
                .map(|s| s == "true" || s == "1")
                .unwrap_or(false),
        }
    }
}

/// Everything the listener needs to open the store.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ListenerConfig {
    pub storage: StorageConfig,
    pub consumer: ConsumerConfig,
    /// TOML layout file; the built-in layout when unset.
    pub layout_path: Option<PathBuf>,
}

impl ListenerConfig {
    /// Storage and consumer settings from their own variables, plus
    /// `LDAPCACHE_LAYOUT` for the layout file.
    pub fn from_env() -> Self {
        Self {
            storage: StorageConfig::from_env(),
            consumer: ConsumerConfig::from_env(),
            layout_path: std::env::var("LDAPCACHE_LAYOUT")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .map(PathBuf::from),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.storage.validate()?;
        self.consumer.validate()
    }

    /// Load the layout and check it fits the sub-database limit.
    pub fn layout(&self) -> Result<Layout, ConfigError> {
        let layout = match &self.layout_path {
            Some(path) => load_layout(path)?,
            None => Layout::builtin(),
        };
        if layout.caches.is_empty() {
            return Err(ConfigError::Layout {
                path: self.layout_source(),
                reason: "no caches defined".to_string(),
            });
        }
        let needed = layout.shard_count();
        if needed > self.storage.max_sub_databases as usize {
            return Err(ConfigError::InvalidValue {
                field: "storage.max_sub_databases".to_string(),
                value: self.storage.max_sub_databases.to_string(),
                reason: format!("layout needs {} sub-databases", needed),
            });
        }
        Ok(layout)
    }

    fn layout_source(&self) -> String {
        self.layout_path
            .as_deref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "<builtin>".to_string())
    }
}

/// Parse a TOML layout file.
///
/// ```toml
/// [[cache]]
/// name = "groups"
///
/// [[cache.shards]]
/// name = "all"
/// predicate = { op = "object_type", value = "groups/group" }
/// shape = { kind = "membership" }
/// ```
pub fn load_layout(path: &Path) -> Result<Layout, ConfigError> {
    let layout_error = |reason: String| ConfigError::Layout {
        path: path.display().to_string(),
        reason,
    };
    let text = std::fs::read_to_string(path).map_err(|e| layout_error(e.to_string()))?;
    toml::from_str(&text).map_err(|e| layout_error(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ldapcache_core::{Predicate, RecordShape};
    use std::time::Duration;
    use tempfile::TempDir;

    const LAYOUT: &str = r#"
[[cache]]
name = "groups"

[[cache.shards]]
name = "all"
predicate = { op = "object_type", value = "groups/group" }
shape = { kind = "membership" }

[[cache]]
name = "principals"

[[cache.shards]]
name = "users"
predicate = { op = "object_type", value = "users/user" }
shape = { kind = "attributes", attributes = ["uid", "uidNumber"], required = ["uid"] }
max_age_secs = 86400
"#;

    fn write_layout(dir: &TempDir, text: &str) -> PathBuf {
        let path = dir.path().join("layout.toml");
        std::fs::write(&path, text).expect("write layout");
        path
    }

    #[test]
    fn test_layout_file_is_parsed() {
        let dir = TempDir::new().expect("tempdir");
        let layout = load_layout(&write_layout(&dir, LAYOUT)).expect("valid layout");

        assert_eq!(layout.caches.len(), 2);
        assert_eq!(layout.shard_count(), 2);
        let users = &layout.caches[1].shards[0];
        assert_eq!(users.predicate, Predicate::object_type("users/user"));
        assert_eq!(
            users.shape,
            RecordShape::Attributes {
                attributes: vec!["uid".to_string(), "uidNumber".to_string()],
                required: vec!["uid".to_string()],
            }
        );
        assert_eq!(users.max_age(), Some(Duration::from_secs(86400)));
        assert_eq!(layout.caches[0].shards[0].max_age(), None);
    }

    #[test]
    fn test_unreadable_layout_is_a_layout_error() {
        let dir = TempDir::new().expect("tempdir");
        let missing = dir.path().join("missing.toml");
        assert!(matches!(load_layout(&missing), Err(ConfigError::Layout { .. })));

        let garbage = write_layout(&dir, "[[cache]]\nname = 3\n");
        assert!(matches!(load_layout(&garbage), Err(ConfigError::Layout { .. })));
    }

    #[test]
    fn test_builtin_layout_without_a_file() {
        let config = ListenerConfig::default();
        assert_eq!(config.layout().expect("builtin"), Layout::builtin());
    }

    #[test]
    fn test_layout_must_fit_sub_database_limit() {
        let mut config = ListenerConfig::default();
        config.storage.max_sub_databases = 2;
        assert!(matches!(
            config.layout(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_empty_layout_is_rejected() {
        let dir = TempDir::new().expect("tempdir");
        let config = ListenerConfig {
            layout_path: Some(write_layout(&dir, "")),
            ..ListenerConfig::default()
        };
        assert!(matches!(config.layout(), Err(ConfigError::Layout { .. })));
    }

    #[test]
    fn test_telemetry_default_filter() {
        assert_eq!(TelemetryConfig::default().filter, "ldapcache=info");
        assert!(!TelemetryConfig::default().json);
    }
}
