//! Full rebuild from a directory snapshot.
//!
//! Reads the whole snapshot first, then clears every sub-database and
//! replays each object as a create event inside one write transaction.
//! Readers see either the old store or the rebuilt one; a source failure
//! leaves the old store untouched. The result equals what the consumer
//! would hold after processing those creates.

use std::collections::VecDeque;

use async_trait::async_trait;
use ldapcache_core::{
    deserialize_properties, CacheError, CacheResult, ChangeEvent, DirectoryObject, Properties,
    TransportError, OBJECT_TYPE_ATTRIBUTE,
};
use serde::Deserialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, Lines};

use crate::routing::{RouteOutcome, Router};

/// Lists every current directory object.
#[async_trait]
pub trait DirectorySource: Send {
    /// Next object, `Ok(None)` at the end of the snapshot.
    ///
    /// `TransportError::Malformed` marks a single unreadable entry; any other
    /// error aborts the rebuild.
    async fn next_object(&mut self) -> Result<Option<DirectoryObject>, TransportError>;
}

/// In-memory snapshot.
#[derive(Debug, Clone, Default)]
pub struct SnapshotSource {
    objects: VecDeque<DirectoryObject>,
}

impl SnapshotSource {
    pub fn new(objects: impl IntoIterator<Item = DirectoryObject>) -> Self {
        Self {
            objects: objects.into_iter().collect(),
        }
    }
}

#[async_trait]
impl DirectorySource for SnapshotSource {
    async fn next_object(&mut self) -> Result<Option<DirectoryObject>, TransportError> {
        Ok(self.objects.pop_front())
    }
}

/// One snapshot line: `{"dn": ..., "object_type": ..., "properties": {...}}`.
#[derive(Debug, Deserialize)]
struct SnapshotEntry {
    dn: String,
    #[serde(default)]
    object_type: Option<String>,
    #[serde(default, deserialize_with = "deserialize_properties")]
    properties: Properties,
}

/// Snapshot with one JSON object per line. Blank lines are ignored.
pub struct JsonLinesSource<R> {
    lines: Lines<R>,
    line: u64,
}

impl<R: AsyncBufRead + Unpin + Send> JsonLinesSource<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: reader.lines(),
            line: 0,
        }
    }
}

#[async_trait]
impl<R: AsyncBufRead + Unpin + Send> DirectorySource for JsonLinesSource<R> {
    async fn next_object(&mut self) -> Result<Option<DirectoryObject>, TransportError> {
        loop {
            let Some(line) = self
                .lines
                .next_line()
                .await
                .map_err(|e| TransportError::Disconnected {
                    reason: e.to_string(),
                })?
            else {
                return Ok(None);
            };
            self.line += 1;
            if line.trim().is_empty() {
                continue;
            }

            let entry: SnapshotEntry =
                serde_json::from_str(&line).map_err(|e| TransportError::Malformed {
                    delivery: self.line,
                    reason: e.to_string(),
                })?;
            let mut properties = entry.properties;
            if let Some(object_type) = entry.object_type {
                properties
                    .entry(OBJECT_TYPE_ATTRIBUTE.to_string())
                    .or_insert_with(|| vec![object_type]);
            }
            return Ok(Some(DirectoryObject::with_properties(entry.dn, properties)));
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RebuildReport {
    /// Sub-databases emptied in the rebuild commit.
    pub cleared: usize,
    /// Objects read from the source.
    pub objects: u64,
    /// Records written across all shards.
    pub stored: u64,
    /// Objects skipped because they could not be mapped.
    pub skipped: u64,
    /// Unreadable snapshot entries.
    pub malformed: u64,
}

/// Recreate the store from `source` through `router` in one commit.
pub async fn rebuild<S>(router: &Router, source: &mut S) -> CacheResult<RebuildReport>
where
    S: DirectorySource + ?Sized,
{
    let mut report = RebuildReport::default();
    tracing::info!("Rebuild started");

    let mut events = Vec::new();
    loop {
        match source.next_object().await {
            Ok(Some(object)) => {
                report.objects += 1;
                events.push(ChangeEvent::create(object));
            }
            Ok(None) => break,
            Err(TransportError::Malformed { delivery, reason }) => {
                report.malformed += 1;
                tracing::warn!(entry = delivery, reason = %reason, "Skipping unreadable snapshot entry");
            }
            Err(e) => {
                tracing::error!(error = %e, objects = report.objects, "Snapshot read failed, store left unchanged");
                return Err(CacheError::from(e));
            }
        }
    }

    let mut plans = Vec::with_capacity(events.len());
    for event in &events {
        match router.plan(event) {
            Ok(plan) => plans.push(plan),
            Err(e) => {
                report.skipped += 1;
                tracing::warn!(dn = %e.dn(), error = %e, "Skipping object that cannot be mapped");
            }
        }
    }

    let mut wtxn = router.engine().begin_write()?;
    report.cleared = router.engine().recreate_in(&mut wtxn)?;
    let mut outcome = RouteOutcome::default();
    for plan in &plans {
        outcome += router.apply_in(&mut wtxn, plan)?;
    }
    wtxn.commit()?;
    report.stored = outcome.stored as u64;

    tracing::info!(
        objects = report.objects,
        stored = report.stored,
        skipped = report.skipped,
        malformed = report.malformed,
        "Rebuild completed"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn test_json_lines_source_reads_entries() {
        let input = concat!(
            r#"{"dn": "cn=g1,dc=example", "object_type": "groups/group", "properties": {"users": "uid=u1,dc=example"}}"#,
            "\n\n",
            "not json\n",
            r#"{"dn": "uid=u1,dc=example", "properties": {"univentionObjectType": ["users/user"], "uid": ["u1"]}}"#,
            "\n",
        );
        let mut source = JsonLinesSource::new(BufReader::new(input.as_bytes()));

        let group = source.next_object().await.expect("read").expect("entry");
        assert_eq!(group.object_type(), Some("groups/group"));
        assert_eq!(group.values("users"), ["uid=u1,dc=example".to_string()]);

        assert!(matches!(
            source.next_object().await,
            Err(TransportError::Malformed { delivery: 3, .. })
        ));

        let user = source.next_object().await.expect("read").expect("entry");
        assert_eq!(user.object_type(), Some("users/user"));
        assert!(source.next_object().await.expect("read").is_none());
    }

    #[tokio::test]
    async fn test_snapshot_source_drains_in_order() {
        let mut source = SnapshotSource::new([
            DirectoryObject::new("cn=a"),
            DirectoryObject::new("cn=b"),
        ]);
        assert_eq!(source.next_object().await.expect("read").expect("a").dn, "cn=a");
        assert_eq!(source.next_object().await.expect("read").expect("b").dn, "cn=b");
        assert!(source.next_object().await.expect("read").is_none());
    }
}
