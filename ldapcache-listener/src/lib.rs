//! ldapcache Listener
//!
//! Process entry points around the cache: consume the change feed until a
//! shutdown signal, rebuild from a directory snapshot, and report usage.
//! The `ldapcache` binary is a thin CLI over these functions.

pub mod config;
pub mod error;
pub mod telemetry;

pub use config::{load_layout, ListenerConfig, TelemetryConfig, DEFAULT_LOG_FILTER};
pub use error::{ListenerError, ListenerResult};
pub use telemetry::init_tracing;

use std::sync::Arc;

use ldapcache_events::{
    rebuild, ChangeFeed, ConsumerSnapshot, DirectorySource, EventConsumer, Projector,
    RebuildReport, Router,
};
use ldapcache_storage::{CacheRegistry, EnvironmentStats, StorageEngine};
use tokio::sync::watch;

/// An opened environment with every cache of the layout registered.
pub struct OpenStore {
    pub engine: Arc<StorageEngine>,
    pub registry: Arc<CacheRegistry>,
}

impl OpenStore {
    /// Validate `config`, open the environment and register the layout.
    pub fn open(config: &ListenerConfig) -> ListenerResult<Self> {
        config.validate()?;
        let layout = config.layout()?;
        let engine = Arc::new(StorageEngine::from_config(&config.storage)?);
        let registry = layout
            .open(&engine, config.consumer.cleanup_batch_size)
            .map_err(ListenerError::Cache)?;

        tracing::info!(
            path = %config.storage.path.display(),
            caches = layout.caches.len(),
            shards = layout.shard_count(),
            "Cache store opened"
        );
        Ok(Self {
            engine,
            registry: Arc::new(registry),
        })
    }

    pub fn router(&self) -> Router {
        Router::new(
            Arc::clone(&self.engine),
            Arc::clone(&self.registry),
            Projector::default(),
        )
    }

    /// Flush and close the environment.
    pub fn close(&self) -> ListenerResult<()> {
        self.engine.close()?;
        Ok(())
    }
}

/// Consume `feed` until it ends or `shutdown_rx` fires, then close the store.
pub async fn run<F: ChangeFeed>(
    config: &ListenerConfig,
    feed: F,
    shutdown_rx: watch::Receiver<bool>,
) -> ListenerResult<ConsumerSnapshot> {
    let store = OpenStore::open(config)?;
    let mut consumer = EventConsumer::new(store.router(), feed, config.consumer.clone());

    let result = consumer.run(shutdown_rx).await;
    if let Err(e) = &result {
        tracing::error!(error = %e, "Consumer stopped on a storage failure; run `rebuild` before restarting");
    }
    let closed = store.close();
    let snapshot = result.map_err(ListenerError::Cache)?;
    closed?;
    Ok(snapshot)
}

/// Recreate the store from `source`.
pub async fn rebuild_from<S>(
    config: &ListenerConfig,
    source: &mut S,
) -> ListenerResult<RebuildReport>
where
    S: DirectorySource + ?Sized,
{
    let store = OpenStore::open(config)?;
    let report = rebuild(&store.router(), source)
        .await
        .map_err(ListenerError::Cache);
    let closed = store.close();
    let report = report?;
    closed?;
    Ok(report)
}

/// Map size, disk usage and entries per sub-database.
pub fn stats(config: &ListenerConfig) -> ListenerResult<EnvironmentStats> {
    let store = OpenStore::open(config)?;
    let stats = store.engine.stats()?;
    store.close()?;
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ldapcache_core::CacheError;
    use ldapcache_events::{ChannelFeed, SnapshotSource};
    use ldapcache_test_utils::fixtures::{g1, group_dn, user};
    use ldapcache_test_utils::ChangeEvent;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> ListenerConfig {
        let mut config = ListenerConfig::default();
        config.storage.path = dir.path().join("cache");
        config.storage.max_size_mb = 32;
        config
    }

    #[tokio::test]
    async fn test_run_consumes_until_feed_ends() {
        let dir = TempDir::new().expect("tempdir");
        let config = config(&dir);
        let (tx, feed) = ChannelFeed::channel(4);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let produce = async move {
            tx.send_event(&ChangeEvent::create(g1())).await.expect("send");
        };
        let (snapshot, ()) = tokio::join!(run(&config, feed, shutdown_rx), produce);
        assert_eq!(snapshot.expect("run").applied, 1);

        let stats = stats(&config).expect("stats");
        assert_eq!(stats.sub_databases.get("groups/all"), Some(&1));
        assert_eq!(stats.sub_databases.get("principals/users"), Some(&0));
        assert_eq!(stats.max_sub_databases, config.storage.max_sub_databases);
    }

    #[tokio::test]
    async fn test_rebuild_from_snapshot() {
        let dir = TempDir::new().expect("tempdir");
        let config = config(&dir);
        let mut source = SnapshotSource::new([g1(), user("u1")]);

        let report = rebuild_from(&config, &mut source).await.expect("rebuild");
        assert_eq!(report.stored, 2);

        let store = OpenStore::open(&config).expect("reopen");
        let groups = store.registry.resolve("groups").expect("groups");
        assert!(groups
            .shard("all")
            .expect("all")
            .get(&group_dn("g1"))
            .expect("read")
            .is_some());
    }

    #[test]
    fn test_invalid_config_is_rejected_before_opening() {
        let dir = TempDir::new().expect("tempdir");
        let mut config = config(&dir);
        config.consumer.cleanup_interval = 0;
        assert!(matches!(
            OpenStore::open(&config),
            Err(ListenerError::Cache(CacheError::Config(_)))
        ));
        assert!(!config.storage.path.exists());
    }
}
