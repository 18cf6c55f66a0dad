//! ldapcache Test Utilities
//!
//! Shared test infrastructure for the workspace:
//! - Directory object fixtures (groups, users, hosts)
//! - Throwaway environments with a registered layout
//! - Scripted feed, directory source and sink doubles for failure paths
//! - Proptest generators for DNs, objects and change sequences
//! - Assertions over stored records

pub use ldapcache_core::{
    CacheError, CacheResult, ChangeEvent, DirectoryObject, Predicate, RecordShape,
    RelationRecord, StorageError, TransportError, HOSTS_PROPERTY, NESTED_GROUP_PROPERTY,
    USERS_PROPERTY,
};
pub use ldapcache_storage::{
    CacheRegistry, CleanupReport, Layout, StorageEngine, GROUP_OBJECT_TYPE, USER_OBJECT_TYPE,
};

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use ldapcache_events::{
    ChangeFeed, ChangeSink, Delivery, DirectorySource, Projector, RouteOutcome, Router,
};
use tempfile::TempDir;

/// Base DN of every fixture object.
pub const BASE_DN: &str = "dc=example,dc=org";

// ============================================================================
// MOCK COLLABORATORS
// ============================================================================

/// One scripted step of a [`MockChangeFeed`].
#[derive(Debug, Clone)]
pub enum FeedStep {
    Deliver(ChangeEvent),
    Fail(TransportError),
}

/// Change feed playing back a script.
///
/// Deliveries are numbered from 1. Unacknowledged deliveries are handed out
/// again, under new ids, after a successful reconnect. Once the script runs
/// out the feed ends, or stays silent with [`MockChangeFeed::hold_open`].
#[derive(Debug, Default)]
pub struct MockChangeFeed {
    script: VecDeque<FeedStep>,
    in_flight: BTreeMap<u64, ChangeEvent>,
    last_id: u64,
    failing_acks: BTreeSet<u64>,
    failing_reconnects: u32,
    hold_open: bool,
    acked: Vec<u64>,
    reconnects: u32,
}

impl MockChangeFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deliver(mut self, event: ChangeEvent) -> Self {
        self.script.push_back(FeedStep::Deliver(event));
        self
    }

    /// `next` returns `error` at this point of the script.
    pub fn fail(mut self, error: TransportError) -> Self {
        self.script.push_back(FeedStep::Fail(error));
        self
    }

    /// The first ack of `delivery` fails with `AckFailed`.
    pub fn fail_ack(mut self, delivery: u64) -> Self {
        self.failing_acks.insert(delivery);
        self
    }

    /// The next `count` reconnect attempts fail.
    pub fn fail_reconnects(mut self, count: u32) -> Self {
        self.failing_reconnects = count;
        self
    }

    /// Never end; wait for shutdown once the script is played.
    pub fn hold_open(mut self) -> Self {
        self.hold_open = true;
        self
    }

    /// Acknowledged delivery ids, in order.
    pub fn acked(&self) -> &[u64] {
        &self.acked
    }

    /// Successful reconnects.
    pub fn reconnects(&self) -> u32 {
        self.reconnects
    }
}

#[async_trait]
impl ChangeFeed for MockChangeFeed {
    async fn next(&mut self) -> Result<Option<Delivery>, TransportError> {
        match self.script.pop_front() {
            Some(FeedStep::Deliver(event)) => {
                self.last_id += 1;
                self.in_flight.insert(self.last_id, event.clone());
                Ok(Some(Delivery {
                    id: self.last_id,
                    event,
                }))
            }
            Some(FeedStep::Fail(error)) => Err(error),
            None if self.hold_open => std::future::pending().await,
            None => Ok(None),
        }
    }

    async fn ack(&mut self, delivery: u64) -> Result<(), TransportError> {
        if self.failing_acks.remove(&delivery) {
            return Err(TransportError::AckFailed {
                delivery,
                reason: "scripted ack failure".to_string(),
            });
        }
        self.in_flight.remove(&delivery);
        self.acked.push(delivery);
        Ok(())
    }

    async fn reconnect(&mut self) -> Result<(), TransportError> {
        if self.failing_reconnects > 0 {
            self.failing_reconnects -= 1;
            return Err(TransportError::Disconnected {
                reason: "scripted reconnect failure".to_string(),
            });
        }
        self.reconnects += 1;
        let redeliver = std::mem::take(&mut self.in_flight);
        for event in redeliver.into_values().rev() {
            self.script.push_front(FeedStep::Deliver(event));
        }
        Ok(())
    }
}

/// Directory source playing back objects and failures in order.
#[derive(Debug, Default)]
pub struct MockDirectorySource {
    script: VecDeque<Result<DirectoryObject, TransportError>>,
}

impl MockDirectorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn object(mut self, object: DirectoryObject) -> Self {
        self.script.push_back(Ok(object));
        self
    }

    pub fn fail(mut self, error: TransportError) -> Self {
        self.script.push_back(Err(error));
        self
    }
}

#[async_trait]
impl DirectorySource for MockDirectorySource {
    async fn next_object(&mut self) -> Result<Option<DirectoryObject>, TransportError> {
        self.script.pop_front().transpose()
    }
}

/// Sink returning scripted storage errors before delegating to a router.
#[derive(Debug)]
pub struct MockChangeSink {
    inner: Router,
    route_failures: Mutex<VecDeque<StorageError>>,
    cleanup_failures: Mutex<VecDeque<StorageError>>,
    route_calls: AtomicU64,
    cleanup_calls: AtomicU64,
}

impl MockChangeSink {
    pub fn new(inner: Router) -> Self {
        Self {
            inner,
            route_failures: Mutex::new(VecDeque::new()),
            cleanup_failures: Mutex::new(VecDeque::new()),
            route_calls: AtomicU64::new(0),
            cleanup_calls: AtomicU64::new(0),
        }
    }

    /// The next `count` routes fail with `error`.
    pub fn fail_routes(self, count: usize, error: StorageError) -> Self {
        self.route_failures
            .lock()
            .expect("route failure script")
            .extend(std::iter::repeat(error).take(count));
        self
    }

    /// The next `count` cleanup passes fail with `error`.
    pub fn fail_cleanups(self, count: usize, error: StorageError) -> Self {
        self.cleanup_failures
            .lock()
            .expect("cleanup failure script")
            .extend(std::iter::repeat(error).take(count));
        self
    }

    pub fn route_calls(&self) -> u64 {
        self.route_calls.load(Ordering::Relaxed)
    }

    pub fn cleanup_calls(&self) -> u64 {
        self.cleanup_calls.load(Ordering::Relaxed)
    }
}

impl ChangeSink for MockChangeSink {
    fn route(&self, event: &ChangeEvent) -> CacheResult<RouteOutcome> {
        self.route_calls.fetch_add(1, Ordering::Relaxed);
        let failure = self
            .route_failures
            .lock()
            .expect("route failure script")
            .pop_front();
        match failure {
            Some(error) => Err(error.into()),
            None => self.inner.route(event),
        }
    }

    fn cleanup(&self) -> Result<CleanupReport, StorageError> {
        self.cleanup_calls.fetch_add(1, Ordering::Relaxed);
        let failure = self
            .cleanup_failures
            .lock()
            .expect("cleanup failure script")
            .pop_front();
        match failure {
            Some(error) => Err(error),
            None => ChangeSink::cleanup(&self.inner),
        }
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built directory objects and environments.

    use super::*;

    pub fn user_dn(uid: &str) -> String {
        format!("uid={},cn=users,{}", uid, BASE_DN)
    }

    pub fn group_dn(cn: &str) -> String {
        format!("cn={},cn=groups,{}", cn, BASE_DN)
    }

    pub fn host_dn(cn: &str) -> String {
        format!("cn={},cn=computers,{}", cn, BASE_DN)
    }

    /// A group with user members (by uid), host members and nested groups (by cn).
    pub fn group(cn: &str, users: &[&str], hosts: &[&str], nested: &[&str]) -> DirectoryObject {
        DirectoryObject::new(group_dn(cn))
            .object_type_of(GROUP_OBJECT_TYPE)
            .property("cn", [cn])
            .property(USERS_PROPERTY, users.iter().map(|u| user_dn(u)))
            .property(HOSTS_PROPERTY, hosts.iter().map(|h| host_dn(h)))
            .property(NESTED_GROUP_PROPERTY, nested.iter().map(|g| group_dn(g)))
    }

    /// `g1` with users `u1`, `u2` and nested group `g2`.
    pub fn g1() -> DirectoryObject {
        group("g1", &["u1", "u2"], &[], &["g2"])
    }

    pub fn user(uid: &str) -> DirectoryObject {
        DirectoryObject::new(user_dn(uid))
            .object_type_of(USER_OBJECT_TYPE)
            .property("uid", [uid])
            .property("uidNumber", ["2000"])
    }

    pub fn host(cn: &str) -> DirectoryObject {
        DirectoryObject::new(host_dn(cn))
            .object_type_of("computers/linux")
            .property("cn", [cn])
    }

    /// A temporary environment with a registered layout.
    pub struct TestStore {
        pub engine: Arc<StorageEngine>,
        pub registry: Arc<CacheRegistry>,
        dir: TempDir,
    }

    impl TestStore {
        /// Environment with the built-in `groups`/`principals` layout.
        pub fn builtin() -> Self {
            Self::with_layout(&Layout::builtin())
        }

        pub fn with_layout(layout: &Layout) -> Self {
            let dir = TempDir::new().expect("create temp dir");
            let engine = Arc::new(
                StorageEngine::open(dir.path().join("cache"), 32, 16).expect("open environment"),
            );
            let registry = Arc::new(layout.open(&engine, 100).expect("register layout"));
            Self {
                engine,
                registry,
                dir,
            }
        }

        pub fn path(&self) -> &std::path::Path {
            self.dir.path()
        }

        /// Router over this store with the default projector.
        pub fn router(&self) -> Router {
            Router::new(
                Arc::clone(&self.engine),
                Arc::clone(&self.registry),
                Projector::default(),
            )
        }

        /// Record stored for `dn` in `cache`/`shard`, if any.
        pub fn record(&self, cache: &str, shard: &str, dn: &str) -> Option<RelationRecord> {
            self.registry
                .resolve(cache)
                .expect("cache registered")
                .shard(shard)
                .expect("shard registered")
                .get(dn)
                .expect("read shard")
                .map(|stored| stored.record)
        }

        /// Every stored record keyed by `(sub-database, dn)`.
        pub fn contents(&self) -> BTreeMap<(String, String), RelationRecord> {
            let mut contents = BTreeMap::new();
            for cache in self.registry.caches() {
                for shard in cache.shards() {
                    for (dn, stored) in shard.entries().expect("read shard") {
                        contents.insert((shard.qualified_name().to_string(), dn), stored.record);
                    }
                }
            }
            contents
        }
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for directory objects and change sequences.

    use super::fixtures::{group, user};
    use super::*;
    use proptest::prelude::*;

    pub fn arb_uid() -> impl Strategy<Value = String> {
        "[a-z][a-z0-9]{0,5}"
    }

    /// Group names from a small pool so sequences revisit the same keys.
    pub fn arb_group_cn() -> impl Strategy<Value = String> {
        prop_oneof![Just("g1"), Just("g2"), Just("g3"), Just("g4")].prop_map(String::from)
    }

    pub fn arb_group() -> impl Strategy<Value = DirectoryObject> {
        (
            arb_group_cn(),
            prop::collection::vec(arb_uid(), 0..5),
            prop::collection::vec(arb_group_cn(), 0..3),
        )
            .prop_map(|(cn, users, nested)| {
                let users: Vec<&str> = users.iter().map(String::as_str).collect();
                let nested: Vec<&str> = nested.iter().map(String::as_str).collect();
                group(&cn, &users, &[], &nested)
            })
    }

    pub fn arb_user() -> impl Strategy<Value = DirectoryObject> {
        arb_uid().prop_map(|uid| user(&uid))
    }

    pub fn arb_object() -> impl Strategy<Value = DirectoryObject> {
        prop_oneof![3 => arb_group(), 1 => arb_user()]
    }

    /// A per-key consistent change: create, modify from an earlier state, or delete.
    pub fn arb_change() -> impl Strategy<Value = ChangeEvent> {
        (arb_object(), arb_object(), 0u8..3).prop_map(|(a, b, kind)| match kind {
            0 => ChangeEvent::create(a),
            1 if a.dn == b.dn => ChangeEvent::modify(a, b),
            1 => ChangeEvent::create(b),
            _ => ChangeEvent::delete(a),
        })
    }

    pub fn arb_changes(max: usize) -> impl Strategy<Value = Vec<ChangeEvent>> {
        prop::collection::vec(arb_change(), 0..max)
    }
}

// ============================================================================
// ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions over stored records.

    use super::*;

    /// Assert a record is a membership record with exactly these members and uids.
    #[track_caller]
    pub fn assert_membership(record: &RelationRecord, unique_member: &[String], member_uid: &[&str]) {
        match record {
            RelationRecord::Membership {
                unique_member: stored_members,
                member_uid: stored_uids,
            } => {
                assert_eq!(stored_members, unique_member, "unique_member differs");
                assert_eq!(stored_uids, member_uid, "member_uid differs");
            }
            other => panic!("Expected membership record, got: {:?}", other),
        }
    }

    /// Assert that a CacheResult is a Mapping error.
    #[track_caller]
    pub fn assert_mapping_error<T: std::fmt::Debug>(result: &CacheResult<T>) {
        match result {
            Err(CacheError::Mapping(_)) => {}
            other => panic!("Expected Mapping error, got: {:?}", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;

    #[test]
    fn test_g1_fixture() {
        let g1 = g1();
        assert_eq!(g1.object_type(), Some("groups/group"));
        assert_eq!(g1.values("users").len(), 2);
        assert_eq!(g1.values("nestedGroup"), [group_dn("g2")]);
    }

    #[test]
    fn test_store_starts_empty() {
        let store = TestStore::builtin();
        assert!(store.contents().is_empty());
        assert!(store.record("groups", "all", &group_dn("g1")).is_none());
    }
}
