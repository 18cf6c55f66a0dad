//! ldapcache Storage - LMDB Environment, Shards and Registry
//!
//! One memory-mapped LMDB environment holds every cache. Each shard owns a
//! named sub-database (`<cache>/<shard>`) inside it; the [`CacheRegistry`]
//! maps logical cache names to their shards and routes objects and queries.
//!
//! # Transactions
//!
//! Readers take MVCC snapshots and never block the writer. There is exactly
//! one writer at a time; the engine rejects a second write transaction on a
//! thread that already holds one instead of deadlocking on LMDB's lock.

pub mod engine;
pub mod envelope;
pub mod layout;
pub mod registry;
pub mod shard;

pub use engine::{EnvironmentStats, StorageEngine, SubDatabase, WriteTxn};
pub use envelope::{StoredRecord, TIMESTAMP_LEN};
pub use heed::RoTxn;
pub use layout::{
    CacheLayout, Layout, GROUP_OBJECT_TYPE, HOST_OBJECT_TYPES, USER_OBJECT_TYPE,
};
pub use registry::{Cache, CacheRegistry, CleanupReport};
pub use shard::{Shard, ShardSpec};
