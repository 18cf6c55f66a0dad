//! Shards: named partitions of a logical cache.
//!
//! A shard owns one sub-database named `<cache>/<shard>`, keyed by source
//! DN. Its predicate decides which objects it accepts and its shape decides
//! which record the projection produces for it.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use ldapcache_core::{
    DirectoryObject, Predicate, RecordShape, RelationRecord, StorageError,
    DEFAULT_CLEANUP_BATCH_SIZE,
};
use serde::{Deserialize, Serialize};

use crate::engine::{storage_error, StorageEngine, SubDatabase, WriteTxn};
use crate::envelope::StoredRecord;

/// Declarative shard definition, as registered at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardSpec {
    pub name: String,
    #[serde(default)]
    pub predicate: Predicate,
    pub shape: RecordShape,
    /// Entries older than this are evicted by cleanup. `None` never expires.
    #[serde(default)]
    pub max_age_secs: Option<u64>,
}

impl ShardSpec {
    pub fn new(name: impl Into<String>, predicate: Predicate, shape: RecordShape) -> Self {
        Self {
            name: name.into(),
            predicate,
            shape,
            max_age_secs: None,
        }
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age_secs = Some(max_age.as_secs());
        self
    }

    pub fn max_age(&self) -> Option<Duration> {
        self.max_age_secs.map(Duration::from_secs)
    }
}

/// An opened shard bound to its sub-database.
pub struct Shard {
    cache: String,
    spec: ShardSpec,
    qualified_name: String,
    db: SubDatabase,
    engine: Arc<StorageEngine>,
    cleanup_batch_size: usize,
}

impl Shard {
    /// Open (creating if needed) the sub-database for `spec` within `cache`.
    pub fn open(
        engine: &Arc<StorageEngine>,
        cache: &str,
        spec: ShardSpec,
    ) -> Result<Self, StorageError> {
        let qualified_name = format!("{}/{}", cache, spec.name);
        let db = engine.create_sub_database(&qualified_name)?;
        Ok(Self {
            cache: cache.to_string(),
            spec,
            qualified_name,
            db,
            engine: Arc::clone(engine),
            cleanup_batch_size: DEFAULT_CLEANUP_BATCH_SIZE,
        })
    }

    /// Keys deleted per cleanup write transaction (minimum 1).
    pub fn with_cleanup_batch_size(mut self, batch_size: usize) -> Self {
        self.cleanup_batch_size = batch_size.max(1);
        self
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn cache(&self) -> &str {
        &self.cache
    }

    /// Sub-database name, `<cache>/<shard>`.
    pub fn qualified_name(&self) -> &str {
        &self.qualified_name
    }

    pub fn spec(&self) -> &ShardSpec {
        &self.spec
    }

    pub fn predicate(&self) -> &Predicate {
        &self.spec.predicate
    }

    pub fn shape(&self) -> &RecordShape {
        &self.spec.shape
    }

    pub fn engine(&self) -> &Arc<StorageEngine> {
        &self.engine
    }

    pub fn matches(&self, object: &DirectoryObject) -> bool {
        self.spec.predicate.matches(object)
    }

    // ========================================================================
    // WRITES
    // ========================================================================

    /// Upsert the record for `dn` in its own write transaction.
    pub fn add_object(&self, dn: &str, record: &RelationRecord) -> Result<(), StorageError> {
        let mut wtxn = self.engine.begin_write()?;
        self.add_object_in(&mut wtxn, dn, record)?;
        wtxn.commit()
    }

    /// Upsert within a caller-owned transaction. Refreshes the stored-at mark.
    pub fn add_object_in(
        &self,
        txn: &mut WriteTxn<'_>,
        dn: &str,
        record: &RelationRecord,
    ) -> Result<(), StorageError> {
        let value = StoredRecord::new(record.clone(), Utc::now()).encode(dn)?;
        self.engine.put(txn, &self.db, dn.as_bytes(), &value)?;
        tracing::trace!(shard = %self.qualified_name, dn, "Stored record");
        Ok(())
    }

    /// Remove the record for `dn` in its own write transaction.
    pub fn remove_object(&self, dn: &str, record: &RelationRecord) -> Result<bool, StorageError> {
        let mut wtxn = self.engine.begin_write()?;
        let removed = self.remove_object_in(&mut wtxn, dn, record)?;
        wtxn.commit()?;
        Ok(removed)
    }

    /// Remove within a caller-owned transaction. A missing key is a no-op.
    /// Only the key identifies the entry.
    pub fn remove_object_in(
        &self,
        txn: &mut WriteTxn<'_>,
        dn: &str,
        _record: &RelationRecord,
    ) -> Result<bool, StorageError> {
        self.remove_key_in(txn, dn)
    }

    /// Remove the entry stored under `dn`, whatever it holds.
    pub fn remove_key_in(&self, txn: &mut WriteTxn<'_>, dn: &str) -> Result<bool, StorageError> {
        let removed = self.engine.delete(txn, &self.db, dn.as_bytes())?;
        if removed {
            tracing::trace!(shard = %self.qualified_name, dn, "Removed record");
        }
        Ok(removed)
    }

    /// Evict entries past `max_age` and entries that no longer decode.
    ///
    /// Candidates are collected under a read snapshot, then deleted in
    /// batches of `cleanup_batch_size`, each batch in its own write
    /// transaction. Every candidate is re-checked inside the batch so an
    /// entry rewritten in between survives. Returns the number removed.
    pub fn cleanup(&self) -> Result<usize, StorageError> {
        let now = Utc::now();
        let max_age = self
            .spec
            .max_age()
            .and_then(|age| chrono::Duration::from_std(age).ok());
        let expired = |key: &[u8], value: &[u8]| {
            let dn = String::from_utf8_lossy(key);
            match StoredRecord::decode(&dn, value) {
                Ok(stored) => max_age.is_some_and(|age| stored.stored_at + age < now),
                Err(_) => true,
            }
        };

        let candidates: Vec<Vec<u8>> = {
            let rtxn = self.engine.begin_read()?;
            let mut keys = Vec::new();
            for item in self.db.iter(&rtxn).map_err(storage_error)? {
                let (key, value) = item.map_err(storage_error)?;
                if expired(key, value) {
                    keys.push(key.to_vec());
                }
            }
            keys
        };

        if candidates.is_empty() {
            return Ok(0);
        }

        let mut removed = 0;
        for batch in candidates.chunks(self.cleanup_batch_size) {
            let mut wtxn = self.engine.begin_write()?;
            for key in batch {
                let still_expired = match self.db.get(&wtxn, key).map_err(storage_error)? {
                    Some(value) => expired(key, value),
                    None => false,
                };
                if still_expired && self.engine.delete(&mut wtxn, &self.db, key)? {
                    removed += 1;
                }
            }
            wtxn.commit()?;
        }

        tracing::info!(
            shard = %self.qualified_name,
            candidates = candidates.len(),
            removed,
            "Shard cleanup completed"
        );
        Ok(removed)
    }

    // ========================================================================
    // QUERIES
    // ========================================================================

    pub fn get(&self, dn: &str) -> Result<Option<StoredRecord>, StorageError> {
        let rtxn = self.engine.begin_read()?;
        self.engine
            .get(&rtxn, &self.db, dn.as_bytes())?
            .map(|bytes| StoredRecord::decode(dn, bytes))
            .transpose()
    }

    /// All `(dn, record)` pairs from one consistent snapshot, in key order.
    ///
    /// Undecodable entries are skipped; cleanup removes them.
    pub fn entries(&self) -> Result<Vec<(String, StoredRecord)>, StorageError> {
        let rtxn = self.engine.begin_read()?;
        let mut entries = Vec::new();
        for item in self.db.iter(&rtxn).map_err(storage_error)? {
            let (key, value) = item.map_err(storage_error)?;
            let dn = String::from_utf8_lossy(key).into_owned();
            match StoredRecord::decode(&dn, value) {
                Ok(stored) => entries.push((dn, stored)),
                Err(e) => {
                    tracing::warn!(shard = %self.qualified_name, dn = %dn, error = %e, "Skipping undecodable entry");
                }
            }
        }
        Ok(entries)
    }

    pub fn len(&self) -> Result<u64, StorageError> {
        let rtxn = self.engine.begin_read()?;
        self.db.len(&rtxn).map_err(storage_error)
    }

    pub fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.len()? == 0)
    }

    /// DNs whose record lists `member` as a member DN or uid.
    pub fn referencing(&self, member: &str) -> Result<Vec<String>, StorageError> {
        Ok(self
            .entries()?
            .into_iter()
            .filter(|(_, stored)| stored.record.references(member))
            .map(|(dn, _)| dn)
            .collect())
    }
}

impl std::fmt::Debug for Shard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shard")
            .field("name", &self.qualified_name)
            .field("predicate", &self.spec.predicate)
            .field("shape", &self.spec.shape)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn engine(dir: &TempDir) -> Arc<StorageEngine> {
        Arc::new(StorageEngine::open(dir.path(), 16, 8).expect("open engine"))
    }

    fn groups_spec() -> ShardSpec {
        ShardSpec::new(
            "all",
            Predicate::object_type("groups/group"),
            RecordShape::Membership,
        )
    }

    fn g1_record() -> RelationRecord {
        RelationRecord::membership(
            vec![
                "uid=u1,cn=users,dc=example".to_string(),
                "cn=g2,cn=groups,dc=example".to_string(),
            ],
            vec!["u1".to_string()],
        )
    }

    /// Write a raw value bypassing the envelope.
    fn put_raw(shard: &Shard, key: &str, value: &[u8]) {
        let mut wtxn = shard.engine().begin_write().expect("write txn");
        let db = shard
            .engine()
            .sub_database(shard.qualified_name())
            .expect("sub-db");
        shard
            .engine()
            .put(&mut wtxn, &db, key.as_bytes(), value)
            .expect("put");
        wtxn.commit().expect("commit");
    }

    #[test]
    fn test_open_names_sub_database() {
        let dir = TempDir::new().expect("tempdir");
        let shard = Shard::open(&engine(&dir), "groups", groups_spec()).expect("shard");
        assert_eq!(shard.qualified_name(), "groups/all");
        assert_eq!(shard.cache(), "groups");
        assert_eq!(shard.name(), "all");
    }

    #[test]
    fn test_add_get_remove() {
        let dir = TempDir::new().expect("tempdir");
        let shard = Shard::open(&engine(&dir), "groups", groups_spec()).expect("shard");
        let dn = "cn=g1,cn=groups,dc=example";

        shard.add_object(dn, &g1_record()).expect("add");
        let stored = shard.get(dn).expect("get").expect("present");
        assert_eq!(stored.record, g1_record());

        assert!(shard.remove_object(dn, &g1_record()).expect("remove"));
        assert!(shard.get(dn).expect("get").is_none());
        assert!(!shard.remove_object(dn, &g1_record()).expect("remove missing"));
    }

    #[test]
    fn test_add_is_idempotent() {
        let dir = TempDir::new().expect("tempdir");
        let shard = Shard::open(&engine(&dir), "groups", groups_spec()).expect("shard");
        let dn = "cn=g1,cn=groups,dc=example";

        shard.add_object(dn, &g1_record()).expect("add");
        shard.add_object(dn, &g1_record()).expect("add again");

        assert_eq!(shard.len().expect("len"), 1);
        assert_eq!(shard.get(dn).expect("get").expect("present").record, g1_record());
    }

    #[test]
    fn test_cleanup_without_max_age_keeps_entries() {
        let dir = TempDir::new().expect("tempdir");
        let shard = Shard::open(&engine(&dir), "groups", groups_spec()).expect("shard");
        shard.add_object("cn=g1", &g1_record()).expect("add");
        assert_eq!(shard.cleanup().expect("cleanup"), 0);
        assert_eq!(shard.len().expect("len"), 1);
    }

    #[test]
    fn test_cleanup_evicts_expired_in_batches() {
        let dir = TempDir::new().expect("tempdir");
        let spec = groups_spec().with_max_age(Duration::from_secs(60));
        let shard = Shard::open(&engine(&dir), "groups", spec)
            .expect("shard")
            .with_cleanup_batch_size(2);

        let old = Utc::now() - chrono::Duration::hours(1);
        for i in 0..5 {
            let dn = format!("cn=old{},dc=example", i);
            let value = StoredRecord::new(g1_record(), old).encode(&dn).expect("encode");
            put_raw(&shard, &dn, &value);
        }
        shard.add_object("cn=fresh,dc=example", &g1_record()).expect("add");

        assert_eq!(shard.cleanup().expect("cleanup"), 5);
        let remaining: Vec<String> = shard
            .entries()
            .expect("entries")
            .into_iter()
            .map(|(dn, _)| dn)
            .collect();
        assert_eq!(remaining, vec!["cn=fresh,dc=example"]);
    }

    #[test]
    fn test_cleanup_evicts_undecodable_entries() {
        let dir = TempDir::new().expect("tempdir");
        let shard = Shard::open(&engine(&dir), "groups", groups_spec()).expect("shard");
        put_raw(&shard, "cn=legacy", b"not an envelope");
        shard.add_object("cn=g1", &g1_record()).expect("add");

        assert_eq!(shard.entries().expect("entries").len(), 1);
        assert_eq!(shard.cleanup().expect("cleanup"), 1);
        assert_eq!(shard.len().expect("len"), 1);
    }

    #[test]
    fn test_referencing_reverse_lookup() {
        let dir = TempDir::new().expect("tempdir");
        let shard = Shard::open(&engine(&dir), "groups", groups_spec()).expect("shard");
        shard.add_object("cn=g1", &g1_record()).expect("add");
        shard
            .add_object(
                "cn=g3",
                &RelationRecord::membership(vec!["cn=g4,dc=example".to_string()], vec![]),
            )
            .expect("add");

        assert_eq!(
            shard.referencing("CN=g2, cn=groups,dc=example").expect("lookup"),
            vec!["cn=g1"]
        );
        assert_eq!(shard.referencing("u1").expect("lookup"), vec!["cn=g1"]);
        assert!(shard.referencing("uid=u9").expect("lookup").is_empty());
    }

    #[test]
    fn test_transaction_scoped_writes_commit_together() {
        let dir = TempDir::new().expect("tempdir");
        let engine = engine(&dir);
        let a = Shard::open(&engine, "groups", groups_spec()).expect("shard");
        let b = Shard::open(
            &engine,
            "groups",
            ShardSpec::new("mirror", Predicate::Any, RecordShape::Membership),
        )
        .expect("shard");

        let mut wtxn = engine.begin_write().expect("write txn");
        a.add_object_in(&mut wtxn, "cn=g1", &g1_record()).expect("add a");
        b.add_object_in(&mut wtxn, "cn=g1", &g1_record()).expect("add b");
        wtxn.abort();
        assert!(a.is_empty().expect("len"));
        assert!(b.is_empty().expect("len"));

        let mut wtxn = engine.begin_write().expect("write txn");
        a.add_object_in(&mut wtxn, "cn=g1", &g1_record()).expect("add a");
        b.add_object_in(&mut wtxn, "cn=g1", &g1_record()).expect("add b");
        wtxn.commit().expect("commit");
        assert_eq!(a.len().expect("len"), 1);
        assert_eq!(b.len().expect("len"), 1);
    }

    #[test]
    fn test_spec_deserializes_with_max_age() {
        let spec: ShardSpec = serde_json::from_str(
            r#"{"name": "users", "predicate": {"op": "object_type", "value": "users/user"},
                "shape": {"kind": "attributes", "attributes": ["uid"]}, "max_age_secs": 3600}"#,
        )
        .expect("valid shard spec");
        assert_eq!(spec.max_age(), Some(Duration::from_secs(3600)));
        assert_eq!(spec.predicate, Predicate::object_type("users/user"));
    }
}
