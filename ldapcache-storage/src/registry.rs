//! Cache registry: logical cache names to shards.
//!
//! Built once at startup and then shared read-only. There is no global
//! instance; the registry is constructed by the entry point and handed to
//! the consumer and query code explicitly.

use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

use ldapcache_core::{
    normalize_dn, CacheResult, DirectoryObject, Predicate, RegistryError, StorageError,
};

use crate::envelope::StoredRecord;
use crate::shard::Shard;

/// A registered logical cache.
#[derive(Debug)]
pub struct Cache {
    name: String,
    shards: Vec<Shard>,
}

impl Cache {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shards(&self) -> &[Shard] {
        &self.shards
    }

    /// Single-shard cache.
    pub fn is_full(&self) -> bool {
        self.shards.len() == 1
    }

    pub fn shard(&self, name: &str) -> Option<&Shard> {
        self.shards.iter().find(|s| s.name() == name)
    }
}

/// Outcome of one maintenance pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub shards: usize,
    pub removed: usize,
    pub elapsed: Duration,
}

#[derive(Debug, Default)]
pub struct CacheRegistry {
    caches: BTreeMap<String, Cache>,
}

impl CacheRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a cache over already-opened shards.
    ///
    /// # Errors
    ///
    /// - `DuplicateCache` if `name` is already registered
    /// - `EmptyCache` if `shards` is empty
    /// - `DuplicateShard` if two shards share a name
    /// - `ShardMismatch` if a shard was opened for a different cache
    pub fn register_cache(
        &mut self,
        name: impl Into<String>,
        shards: Vec<Shard>,
    ) -> Result<(), RegistryError> {
        let name = name.into();
        if self.caches.contains_key(&name) {
            return Err(RegistryError::DuplicateCache { name });
        }
        if shards.is_empty() {
            return Err(RegistryError::EmptyCache { name });
        }

        let mut seen = BTreeSet::new();
        for shard in &shards {
            if shard.cache() != name {
                return Err(RegistryError::ShardMismatch {
                    cache: name,
                    shard: shard.name().to_string(),
                    opened_for: shard.cache().to_string(),
                });
            }
            if !seen.insert(shard.name()) {
                return Err(RegistryError::DuplicateShard {
                    cache: name,
                    shard: shard.name().to_string(),
                });
            }
        }

        tracing::info!(
            cache = %name,
            shards = shards.len(),
            "Registered cache"
        );
        self.caches.insert(name.clone(), Cache { name, shards });
        Ok(())
    }

    /// Register a single-shard cache. The factory receives the cache name.
    pub fn register_full_shard<F>(&mut self, name: impl Into<String>, factory: F) -> CacheResult<()>
    where
        F: FnOnce(&str) -> Result<Shard, StorageError>,
    {
        let name = name.into();
        if self.caches.contains_key(&name) {
            return Err(RegistryError::DuplicateCache { name }.into());
        }
        let shard = factory(&name)?;
        self.register_cache(name, vec![shard])?;
        Ok(())
    }

    pub fn resolve(&self, name: &str) -> Result<&Cache, RegistryError> {
        self.caches
            .get(name)
            .ok_or_else(|| RegistryError::UnknownCache {
                name: name.to_string(),
            })
    }

    pub fn caches(&self) -> impl Iterator<Item = &Cache> {
        self.caches.values()
    }

    pub fn is_empty(&self) -> bool {
        self.caches.is_empty()
    }

    /// Shards of `name` that may hold objects matching `filter`.
    ///
    /// A full cache always answers with its only shard.
    pub fn shards_for_filter(
        &self,
        name: &str,
        filter: &Predicate,
    ) -> Result<Vec<&Shard>, RegistryError> {
        let cache = self.resolve(name)?;
        if cache.is_full() {
            return Ok(cache.shards.iter().collect());
        }
        Ok(cache
            .shards
            .iter()
            .filter(|shard| shard.predicate().may_overlap(filter))
            .collect())
    }

    /// Shards of `name` that accept `object`.
    pub fn shards_for_object(
        &self,
        name: &str,
        object: &DirectoryObject,
    ) -> Result<Vec<&Shard>, RegistryError> {
        let cache = self.resolve(name)?;
        Ok(cache.shards.iter().filter(|s| s.matches(object)).collect())
    }

    /// Records from every shard that may answer `filter`, one per DN.
    pub fn entries_for_filter(
        &self,
        name: &str,
        filter: &Predicate,
    ) -> CacheResult<Vec<(String, StoredRecord)>> {
        let mut seen = BTreeSet::new();
        let mut entries = Vec::new();
        for shard in self.shards_for_filter(name, filter)? {
            for (dn, stored) in shard.entries()? {
                if seen.insert(normalize_dn(&dn)) {
                    entries.push((dn, stored));
                }
            }
        }
        Ok(entries)
    }

    /// Run cleanup on every shard of every cache.
    pub fn cleanup_all(&self) -> Result<CleanupReport, StorageError> {
        let started = Instant::now();
        let mut report = CleanupReport::default();
        for cache in self.caches.values() {
            for shard in &cache.shards {
                report.removed += shard.cleanup()?;
                report.shards += 1;
            }
        }
        report.elapsed = started.elapsed();

        tracing::info!(
            shards = report.shards,
            removed = report.removed,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Cleanup pass completed"
        );
        Ok(report)
    }
}
