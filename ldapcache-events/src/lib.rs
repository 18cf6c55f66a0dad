//! ldapcache Events - Change Consumption and Maintenance
//!
//! Turns an at-least-once, possibly reordered stream of directory changes
//! into the materialized membership view kept by `ldapcache-storage`.
//!
//! # Components
//!
//! - [`Projector`]: object to relation record, per shard shape
//! - [`Router`]: record to shards, one write transaction per change; the
//!   default [`ChangeSink`] behind the consumer
//! - [`EventConsumer`]: feed loop with ack-after-commit, retries and reconnects
//! - [`MaintenanceScheduler`]: message-count cleanup cadence
//! - [`rebuild`]: recreate from a directory snapshot

pub mod consumer;
pub mod feed;
pub mod projection;
pub mod rebuild;
pub mod routing;
pub mod scheduler;

pub use consumer::{ConsumerMetrics, ConsumerSnapshot, ConsumerState, Disposition, EventConsumer};
pub use feed::{AckLog, ChangeFeed, ChannelFeed, Delivery, FeedSender, LineFeed};
pub use projection::{
    project, project_attributes, MemberIdResolver, NoMemberLookup, ProjectedPair, Projector,
    StaticMemberIds,
};
pub use rebuild::{rebuild, DirectorySource, JsonLinesSource, RebuildReport, SnapshotSource};
pub use routing::{ChangeSink, RouteOutcome, RoutePlan, Router, ShardRemoval, ShardWrite};
pub use scheduler::MaintenanceScheduler;
