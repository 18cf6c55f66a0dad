//! Routing of projected records to shards.
//!
//! Routing happens in two steps so a mapping failure never leaves a
//! half-applied change: [`Router::plan`] projects the new state for every
//! affected shard up front, then [`Router::apply_in`] performs all removals
//! and all additions inside one write transaction.
//!
//! Removals are keyed by DN alone. The old state is only matched against
//! shard predicates, never projected, so an old snapshot that no longer maps
//! cannot block the new state from being stored.

use std::borrow::Cow;
use std::sync::Arc;

use ldapcache_core::{
    CacheResult, ChangeEvent, DirectoryObject, MappingError, RelationRecord, StorageError,
    OBJECT_TYPE_ATTRIBUTE,
};
use ldapcache_storage::{CacheRegistry, CleanupReport, Shard, StorageEngine, WriteTxn};

use crate::projection::Projector;

/// One pending shard removal.
#[derive(Debug)]
pub struct ShardRemoval<'r> {
    pub shard: &'r Shard,
    pub dn: String,
}

/// One pending shard write.
#[derive(Debug)]
pub struct ShardWrite<'r> {
    pub shard: &'r Shard,
    pub dn: String,
    pub record: RelationRecord,
}

/// Writes derived from one change event.
#[derive(Debug, Default)]
pub struct RoutePlan<'r> {
    pub removals: Vec<ShardRemoval<'r>>,
    pub additions: Vec<ShardWrite<'r>>,
}

impl RoutePlan<'_> {
    pub fn is_empty(&self) -> bool {
        self.removals.is_empty() && self.additions.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouteOutcome {
    /// Records that existed and were removed.
    pub removed: usize,
    /// Records written.
    pub stored: usize,
}

impl std::ops::AddAssign for RouteOutcome {
    fn add_assign(&mut self, other: Self) {
        self.removed += other.removed;
        self.stored += other.stored;
    }
}

/// Where the consumer applies changes and runs maintenance.
pub trait ChangeSink: Send {
    /// Apply one change atomically.
    fn route(&self, event: &ChangeEvent) -> CacheResult<RouteOutcome>;

    /// Evict stale entries from every shard.
    fn cleanup(&self) -> Result<CleanupReport, StorageError>;
}

/// Applies change events to every registered cache.
#[derive(Debug, Clone)]
pub struct Router {
    engine: Arc<StorageEngine>,
    registry: Arc<CacheRegistry>,
    projector: Projector,
}

impl Router {
    pub fn new(
        engine: Arc<StorageEngine>,
        registry: Arc<CacheRegistry>,
        projector: Projector,
    ) -> Self {
        Self {
            engine,
            registry,
            projector,
        }
    }

    pub fn engine(&self) -> &Arc<StorageEngine> {
        &self.engine
    }

    pub fn registry(&self) -> &Arc<CacheRegistry> {
        &self.registry
    }

    /// Project the event for every shard whose predicate accepts a side.
    ///
    /// Shards matching the old state get a removal keyed by the old DN,
    /// shards matching the new state get an addition keyed by the new DN.
    /// Only a new state that cannot be projected is a mapping error.
    pub fn plan(&self, event: &ChangeEvent) -> Result<RoutePlan<'_>, MappingError> {
        let object_type = event.object_type();
        let old = event.old.as_ref().map(|o| typed(o, object_type));
        let new = event.new.as_ref().map(|o| typed(o, object_type));

        let mut plan = RoutePlan::default();
        for cache in self.registry.caches() {
            for shard in cache.shards() {
                if let Some(old) = old.as_deref().filter(|o| shard.matches(o)) {
                    plan.removals.push(ShardRemoval {
                        shard,
                        dn: old.dn.clone(),
                    });
                }
                if let Some(new) = new.as_deref().filter(|o| shard.matches(o)) {
                    plan.additions.push(ShardWrite {
                        shard,
                        dn: new.dn.clone(),
                        record: self.projector.project_object(shard.shape(), new)?,
                    });
                }
            }
        }
        Ok(plan)
    }

    /// Apply a plan inside `txn`: every removal before any addition.
    pub fn apply_in(
        &self,
        txn: &mut WriteTxn<'_>,
        plan: &RoutePlan<'_>,
    ) -> Result<RouteOutcome, StorageError> {
        let mut outcome = RouteOutcome::default();
        for removal in &plan.removals {
            if removal.shard.remove_key_in(txn, &removal.dn)? {
                outcome.removed += 1;
            }
        }
        for write in &plan.additions {
            write.shard.add_object_in(txn, &write.dn, &write.record)?;
            outcome.stored += 1;
        }
        Ok(outcome)
    }

    /// Plan and apply `event` in its own write transaction.
    ///
    /// Events that touch no shard do not open a transaction.
    pub fn route(&self, event: &ChangeEvent) -> CacheResult<RouteOutcome> {
        let plan = self.plan(event)?;
        if plan.is_empty() {
            return Ok(RouteOutcome::default());
        }
        let mut wtxn = self.engine.begin_write()?;
        let outcome = self.apply_in(&mut wtxn, &plan)?;
        wtxn.commit()?;
        Ok(outcome)
    }
}

impl ChangeSink for Router {
    fn route(&self, event: &ChangeEvent) -> CacheResult<RouteOutcome> {
        Router::route(self, event)
    }

    fn cleanup(&self) -> Result<CleanupReport, StorageError> {
        self.registry.cleanup_all()
    }
}

/// The object with the feed's object type filled in when it lacks one.
fn typed<'a>(object: &'a DirectoryObject, object_type: Option<&str>) -> Cow<'a, DirectoryObject> {
    match object_type {
        Some(object_type) if object.object_type().is_none() => Cow::Owned(
            object
                .clone()
                .property(OBJECT_TYPE_ATTRIBUTE, [object_type.to_string()]),
        ),
        _ => Cow::Borrowed(object),
    }
}
