//! Stored value layout.
//!
//! Format: `[stored_at: 8 bytes, i64 millis LE][json record]`. The timestamp
//! is written on every upsert and read back by shard cleanup.

use chrono::{DateTime, Utc};
use ldapcache_core::{RelationRecord, StorageError};

/// Length of the timestamp prefix.
pub const TIMESTAMP_LEN: usize = 8;

/// A decoded shard value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    pub record: RelationRecord,
    pub stored_at: DateTime<Utc>,
}

impl StoredRecord {
    pub fn new(record: RelationRecord, stored_at: DateTime<Utc>) -> Self {
        Self { record, stored_at }
    }

    /// Serialize timestamp + record.
    pub fn encode(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let value_bytes = serde_json::to_vec(&self.record).map_err(|e| StorageError::Encoding {
            key: key.to_string(),
            reason: e.to_string(),
        })?;

        let mut full_bytes = Vec::with_capacity(TIMESTAMP_LEN + value_bytes.len());
        full_bytes.extend_from_slice(&self.stored_at.timestamp_millis().to_le_bytes());
        full_bytes.extend_from_slice(&value_bytes);
        Ok(full_bytes)
    }

    /// Parse a stored value. Fails on short values, out-of-range timestamps
    /// and records written by an incompatible layout.
    pub fn decode(key: &str, bytes: &[u8]) -> Result<Self, StorageError> {
        let invalid = |reason: String| StorageError::Encoding {
            key: key.to_string(),
            reason,
        };

        if bytes.len() < TIMESTAMP_LEN {
            return Err(invalid(format!("value is {} bytes", bytes.len())));
        }
        let timestamp_bytes: [u8; TIMESTAMP_LEN] = bytes[..TIMESTAMP_LEN]
            .try_into()
            .map_err(|_| invalid("invalid timestamp".to_string()))?;
        let millis = i64::from_le_bytes(timestamp_bytes);
        let stored_at = DateTime::from_timestamp_millis(millis)
            .ok_or_else(|| invalid(format!("timestamp {} out of range", millis)))?;

        let record = serde_json::from_slice(&bytes[TIMESTAMP_LEN..])
            .map_err(|e| invalid(e.to_string()))?;

        Ok(Self { record, stored_at })
    }
}
