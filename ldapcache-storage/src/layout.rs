//! Declarative cache layouts.
//!
//! A layout lists caches and their shard specs. It is deserialized from the
//! operator's layout file or taken from [`Layout::builtin`], then opened
//! against an engine to produce a populated [`CacheRegistry`].

use std::sync::Arc;

use ldapcache_core::{CacheResult, Predicate, RecordShape};
use serde::{Deserialize, Serialize};

use crate::engine::StorageEngine;
use crate::registry::CacheRegistry;
use crate::shard::{Shard, ShardSpec};

/// Object type of groups.
pub const GROUP_OBJECT_TYPE: &str = "groups/group";
/// Object type of users.
pub const USER_OBJECT_TYPE: &str = "users/user";
/// Object types of hosts.
pub const HOST_OBJECT_TYPES: &[&str] = &[
    "computers/domaincontroller_master",
    "computers/domaincontroller_backup",
    "computers/domaincontroller_slave",
    "computers/memberserver",
    "computers/linux",
    "computers/windows",
    "computers/macos",
    "computers/ubuntu",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheLayout {
    pub name: String,
    pub shards: Vec<ShardSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layout {
    #[serde(default, rename = "cache")]
    pub caches: Vec<CacheLayout>,
}

impl Layout {
    /// `groups`: one shard with the membership of every group.
    /// `principals`: user and host attributes, one shard each.
    pub fn builtin() -> Self {
        let groups = CacheLayout {
            name: "groups".to_string(),
            shards: vec![ShardSpec::new(
                "all",
                Predicate::object_type(GROUP_OBJECT_TYPE),
                RecordShape::Membership,
            )],
        };

        let principals = CacheLayout {
            name: "principals".to_string(),
            shards: vec![
                ShardSpec::new(
                    "users",
                    Predicate::object_type(USER_OBJECT_TYPE),
                    RecordShape::Attributes {
                        attributes: ["uid", "uidNumber", "gidNumber", "mailPrimaryAddress"]
                            .map(String::from)
                            .to_vec(),
                        required: vec!["uid".to_string()],
                    },
                ),
                ShardSpec::new(
                    "hosts",
                    Predicate::or(HOST_OBJECT_TYPES.iter().map(|t| Predicate::object_type(*t))),
                    RecordShape::Attributes {
                        attributes: ["cn", "uid", "uidNumber", "univentionObjectType"]
                            .map(String::from)
                            .to_vec(),
                        required: vec!["cn".to_string()],
                    },
                ),
            ],
        };

        Self {
            caches: vec![groups, principals],
        }
    }

    /// Open every shard and register every cache.
    pub fn open(
        &self,
        engine: &Arc<StorageEngine>,
        cleanup_batch_size: usize,
    ) -> CacheResult<CacheRegistry> {
        let mut registry = CacheRegistry::new();
        for cache in &self.caches {
            let shards = cache
                .shards
                .iter()
                .map(|spec| {
                    Shard::open(engine, &cache.name, spec.clone())
                        .map(|shard| shard.with_cleanup_batch_size(cleanup_batch_size))
                })
                .collect::<Result<Vec<_>, _>>()?;
            registry.register_cache(cache.name.clone(), shards)?;
        }
        Ok(registry)
    }

    /// Number of sub-databases the layout needs.
    pub fn shard_count(&self) -> usize {
        self.caches.iter().map(|c| c.shards.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ldapcache_core::DirectoryObject;
    use tempfile::TempDir;

    #[test]
    fn test_builtin_layout_opens() {
        let dir = TempDir::new().expect("tempdir");
        let engine = Arc::new(StorageEngine::open(dir.path(), 16, 8).expect("engine"));
        let layout = Layout::builtin();
        assert_eq!(layout.shard_count(), 3);

        let registry = layout.open(&engine, 100).expect("registry");
        assert!(registry.resolve("groups").expect("groups").is_full());

        let host = DirectoryObject::new("cn=h1,cn=computers,dc=example")
            .object_type_of("computers/memberserver");
        let routed = registry.shards_for_object("principals", &host).expect("route");
        assert_eq!(routed.len(), 1);
        assert_eq!(routed[0].qualified_name(), "principals/hosts");
    }

    #[test]
    fn test_duplicate_cache_in_layout_fails() {
        let dir = TempDir::new().expect("tempdir");
        let engine = Arc::new(StorageEngine::open(dir.path(), 16, 8).expect("engine"));
        let mut layout = Layout::builtin();
        layout.caches.push(layout.caches[0].clone());
        assert!(layout.open(&engine, 100).is_err());
    }
}
