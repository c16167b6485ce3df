//! Storage layer for the encrypted record buffer.
//!
//! Two interchangeable backends implement [`RecordStore`]:
//! - [`SqliteStore`], the preferred durable store
//! - [`KeyValueStore`], a single JSON document used when `SQLite` is unusable
//!
//! The buffer picks one at initialization and talks to it only through the
//! trait.

pub mod kv;
pub mod migrations;
pub mod schema;
pub mod sqlite;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::crypto::Sealed;
use crate::error::Result;
use crate::position::Tier;

pub use kv::KeyValueStore;
pub use sqlite::SqliteStore;

/// Which backend is serving the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// The `SQLite` database.
    Sqlite,
    /// The JSON key/value fallback.
    KeyValue,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sqlite => write!(f, "sqlite"),
            Self::KeyValue => write!(f, "key_value"),
        }
    }
}

/// An encrypted position as held in the buffer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedRecord {
    /// Unique identifier (assigned by the storage layer).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    /// Capture time of the sealed sample; drives eviction order.
    pub captured_at: DateTime<Utc>,
    /// Tier the record is filed under.
    pub tier: Tier,
    /// Owner fingerprint, empty for records migrated from older layouts.
    #[serde(default)]
    pub key_fingerprint: String,
    /// Sealed sample.
    #[serde(with = "b64")]
    pub ciphertext: Vec<u8>,
    /// Per-record nonce.
    #[serde(with = "b64")]
    pub iv: Vec<u8>,
    /// Per-record salt.
    #[serde(with = "b64")]
    pub salt: Vec<u8>,
}

impl EncryptedRecord {
    /// Wrap sealed output into an unsaved record.
    #[must_use]
    pub fn new(
        captured_at: DateTime<Utc>,
        tier: Tier,
        key_fingerprint: impl Into<String>,
        sealed: Sealed,
    ) -> Self {
        Self {
            id: None,
            captured_at,
            tier,
            key_fingerprint: key_fingerprint.into(),
            ciphertext: sealed.ciphertext,
            iv: sealed.iv,
            salt: sealed.salt,
        }
    }

    /// Whether this record may belong to the owner with `fingerprint`.
    ///
    /// Records without a fingerprint could belong to anyone.
    #[must_use]
    pub fn may_belong_to(&self, fingerprint: &str) -> bool {
        self.key_fingerprint.is_empty() || self.key_fingerprint == fingerprint
    }
}

/// Durable form of a retry-queue entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedBatch {
    /// Queue key, `{tier}:{enqueue millis}:{chunk index}`.
    pub key: String,
    /// Tier the payload was drained from.
    pub tier: Tier,
    /// Attempt number of the next retry.
    pub attempt: u32,
    /// When the batch was last (re)scheduled.
    pub enqueued_at: DateTime<Utc>,
    /// Encrypted payload, in upload order.
    pub records: Vec<EncryptedRecord>,
}

/// Common interface of the buffer backends.
///
/// Records are returned oldest first (capture time, then id).
pub trait RecordStore: Send + fmt::Debug {
    /// Which backend this is.
    fn backend(&self) -> Backend;

    /// Insert a record, keeping its id when it already has one.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn insert(&mut self, record: &EncryptedRecord) -> Result<i64>;

    /// All records of a tier, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    fn records(&self, tier: Tier) -> Result<Vec<EncryptedRecord>>;

    /// The most recently captured record of a tier.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    fn latest(&self, tier: Tier) -> Result<Option<EncryptedRecord>>;

    /// Number of records in a tier.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    fn count(&self, tier: Tier) -> Result<usize>;

    /// Delete records by id, returning how many existed.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn delete(&mut self, ids: &[i64]) -> Result<usize>;

    /// Delete every record of a tier.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn clear(&mut self, tier: Tier) -> Result<usize>;

    /// Evict oldest records until the tier holds at most `capacity`.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn evict_to_capacity(&mut self, tier: Tier, capacity: usize) -> Result<usize>;

    /// Insert or replace a retry batch.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn save_retry_batch(&mut self, batch: &PersistedBatch) -> Result<()>;

    /// Remove a retry batch, returning whether it existed.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn remove_retry_batch(&mut self, key: &str) -> Result<bool>;

    /// All persisted retry batches.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    fn retry_batches(&self) -> Result<Vec<PersistedBatch>>;
}

/// Base64 encoding for binary record fields in JSON.
mod b64 {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use chrono::Duration;

    /// A record with recognizable but meaningless ciphertext.
    pub fn record(tier: Tier, minutes_ago: i64, marker: u8) -> EncryptedRecord {
        EncryptedRecord {
            id: None,
            captured_at: Utc::now() - Duration::minutes(minutes_ago),
            tier,
            key_fingerprint: "fp".to_string(),
            ciphertext: vec![marker; 8],
            iv: vec![1; 24],
            salt: vec![2; 16],
        }
    }
}
