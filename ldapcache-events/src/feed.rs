//! Change feed seam.
//!
//! The message bus is an external collaborator; the consumer only sees the
//! [`ChangeFeed`] trait. Two implementations ship here: an in-process
//! channel for embedding and tests, and a JSON-lines reader for a bus
//! bridge writing one change per line to a pipe or file.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use ldapcache_core::{ChangeEvent, TransportError};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, Lines};
use tokio::sync::mpsc;

/// One delivered change, identified for acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub id: u64,
    pub event: ChangeEvent,
}

/// At-least-once source of change events.
#[async_trait]
pub trait ChangeFeed: Send {
    /// Wait for the next delivery. `Ok(None)` means the feed ended cleanly.
    ///
    /// Undecodable payloads surface as `TransportError::Malformed` carrying
    /// the delivery id.
    async fn next(&mut self) -> Result<Option<Delivery>, TransportError>;

    /// Confirm a delivery whose effects are committed.
    async fn ack(&mut self, delivery: u64) -> Result<(), TransportError>;

    /// Re-establish the connection after a transport failure.
    async fn reconnect(&mut self) -> Result<(), TransportError>;
}

fn decode(delivery: u64, payload: &str) -> Result<Delivery, TransportError> {
    serde_json::from_str::<ChangeEvent>(payload)
        .map(|event| Delivery {
            id: delivery,
            event,
        })
        .map_err(|e| TransportError::Malformed {
            delivery,
            reason: e.to_string(),
        })
}

// ============================================================================
// CHANNEL FEED
// ============================================================================

/// Shared record of acknowledged delivery ids.
#[derive(Debug, Clone, Default)]
pub struct AckLog(Arc<Mutex<Vec<u64>>>);

impl AckLog {
    fn push(&self, delivery: u64) -> Result<(), TransportError> {
        self.0
            .lock()
            .map_err(|_| TransportError::AckFailed {
                delivery,
                reason: "ack log poisoned".to_string(),
            })?
            .push(delivery);
        Ok(())
    }

    /// Acknowledged ids in acknowledgement order.
    pub fn acked(&self) -> Vec<u64> {
        self.0.lock().map(|ids| ids.clone()).unwrap_or_default()
    }
}

/// Producer half of a [`ChannelFeed`].
#[derive(Debug, Clone)]
pub struct FeedSender {
    tx: mpsc::Sender<String>,
}

impl FeedSender {
    /// Send an event as its wire JSON.
    pub async fn send_event(&self, event: &ChangeEvent) -> Result<(), TransportError> {
        let payload = serde_json::to_string(event).map_err(|e| TransportError::Disconnected {
            reason: e.to_string(),
        })?;
        self.send_raw(payload).await
    }

    /// Send a raw payload, decodable or not.
    pub async fn send_raw(&self, payload: impl Into<String>) -> Result<(), TransportError> {
        self.tx
            .send(payload.into())
            .await
            .map_err(|_| TransportError::Disconnected {
                reason: "feed receiver dropped".to_string(),
            })
    }
}

/// In-process feed over a bounded channel of JSON payloads.
///
/// Delivery ids count from 1. The feed ends when every sender is dropped.
#[derive(Debug)]
pub struct ChannelFeed {
    rx: mpsc::Receiver<String>,
    next_id: u64,
    acks: AckLog,
}

impl ChannelFeed {
    pub fn channel(capacity: usize) -> (FeedSender, ChannelFeed) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            FeedSender { tx },
            ChannelFeed {
                rx,
                next_id: 1,
                acks: AckLog::default(),
            },
        )
    }

    pub fn ack_log(&self) -> AckLog {
        self.acks.clone()
    }
}

#[async_trait]
impl ChangeFeed for ChannelFeed {
    async fn next(&mut self) -> Result<Option<Delivery>, TransportError> {
        let Some(payload) = self.rx.recv().await else {
            return Ok(None);
        };
        let id = self.next_id;
        self.next_id += 1;
        decode(id, &payload).map(Some)
    }

    async fn ack(&mut self, delivery: u64) -> Result<(), TransportError> {
        self.acks.push(delivery)
    }

    async fn reconnect(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

// ============================================================================
// JSON LINES FEED
// ============================================================================

/// Feed reading one JSON change per line. Blank lines are ignored.
///
/// Delivery ids are line numbers. A read error leaves the feed broken:
/// `reconnect` fails from then on, since a byte stream cannot be rewound.
pub struct LineFeed<R> {
    lines: Lines<R>,
    line: u64,
    acked: u64,
    failed: Option<String>,
}

impl<R: AsyncBufRead + Unpin + Send> LineFeed<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: reader.lines(),
            line: 0,
            acked: 0,
            failed: None,
        }
    }

    /// Highest acknowledged line number.
    pub fn last_acked(&self) -> u64 {
        self.acked
    }
}

#[async_trait]
impl<R: AsyncBufRead + Unpin + Send> ChangeFeed for LineFeed<R> {
    async fn next(&mut self) -> Result<Option<Delivery>, TransportError> {
        if let Some(reason) = &self.failed {
            return Err(TransportError::Disconnected {
                reason: reason.clone(),
            });
        }
        loop {
            let line = match self.lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => return Ok(None),
                Err(e) => {
                    self.failed = Some(e.to_string());
                    return Err(TransportError::Disconnected {
                        reason: e.to_string(),
                    });
                }
            };
            self.line += 1;
            if line.trim().is_empty() {
                continue;
            }
            return decode(self.line, &line).map(Some);
        }
    }

    async fn ack(&mut self, delivery: u64) -> Result<(), TransportError> {
        if delivery > self.line {
            return Err(TransportError::AckFailed {
                delivery,
                reason: format!("line {} not delivered yet", delivery),
            });
        }
        self.acked = self.acked.max(delivery);
        Ok(())
    }

    async fn reconnect(&mut self) -> Result<(), TransportError> {
        match &self.failed {
            Some(reason) => Err(TransportError::Disconnected {
                reason: reason.clone(),
            }),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ldapcache_core::DirectoryObject;
    use tokio::io::BufReader;

    fn group_event() -> ChangeEvent {
        ChangeEvent::create(
            DirectoryObject::new("cn=g1,cn=groups,dc=example").object_type_of("groups/group"),
        )
    }

    #[tokio::test]
    async fn test_channel_feed_delivers_and_records_acks() {
        let (tx, mut feed) = ChannelFeed::channel(8);
        let acks = feed.ack_log();
        tx.send_event(&group_event()).await.expect("send");
        tx.send_raw("{not json").await.expect("send");
        drop(tx);

        let first = feed.next().await.expect("delivery").expect("some");
        assert_eq!(first.id, 1);
        assert_eq!(first.event.dn, "cn=g1,cn=groups,dc=example");
        feed.ack(first.id).await.expect("ack");

        assert!(matches!(
            feed.next().await,
            Err(TransportError::Malformed { delivery: 2, .. })
        ));
        assert!(feed.next().await.expect("end").is_none());
        assert_eq!(acks.acked(), vec![1]);
    }

    #[tokio::test]
    async fn test_line_feed_numbers_lines() {
        let payload = serde_json::to_string(&group_event()).expect("json");
        let input = format!("{}\n\n{}\n", payload, payload);
        let mut feed = LineFeed::new(BufReader::new(input.as_bytes()));

        let first = feed.next().await.expect("delivery").expect("some");
        let second = feed.next().await.expect("delivery").expect("some");
        assert_eq!((first.id, second.id), (1, 3));
        assert!(feed.next().await.expect("end").is_none());

        feed.ack(3).await.expect("ack");
        assert_eq!(feed.last_acked(), 3);
        assert!(matches!(
            feed.ack(9).await,
            Err(TransportError::AckFailed { .. })
        ));
        feed.reconnect().await.expect("healthy reconnect");
    }
}
