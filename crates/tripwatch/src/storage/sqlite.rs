//! `SQLite` backend for the record buffer.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::position::Tier;

use super::{migrations, Backend, EncryptedRecord, PersistedBatch, RecordStore};

const RECORD_COLUMNS: &str = "id, captured_at, tier, key_fingerprint, ciphertext, iv, salt";

/// Preferred durable store for encrypted records.
///
/// Provides persistent storage using `SQLite` with support for:
/// - Per-tier, time-ordered record scans
/// - Oldest-first eviction to a capacity
/// - A persisted retry queue
#[derive(Debug)]
pub struct SqliteStore {
    /// Path to the database file.
    path: PathBuf,
    /// Database connection.
    conn: Connection,
}

impl SqliteStore {
    /// Open or create a store at the given path.
    ///
    /// Creates the parent directories and database file if they don't exist.
    /// Initializes or migrates the schema.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or schema initialization fails.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|source| Error::DirectoryCreate {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }

        debug!("Opening database at {}", path.display());
        let conn = Connection::open(&path).map_err(|source| Error::DatabaseOpen {
            path: path.clone(),
            source,
        })?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        migrations::initialize_schema(&conn)?;

        info!("Record buffer opened at {}", path.display());
        Ok(Self { path, conn })
    }

    /// Create an in-memory store for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the in-memory database cannot be created.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|source| Error::DatabaseOpen {
            path: PathBuf::from(":memory:"),
            source,
        })?;

        migrations::initialize_schema(&conn)?;

        Ok(Self {
            path: PathBuf::from(":memory:"),
            conn,
        })
    }

    /// Get the path to the database file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Convert a database row to a record.
    fn row_to_record(row: &rusqlite::Row) -> rusqlite::Result<EncryptedRecord> {
        let id: i64 = row.get(0)?;
        let captured_ms: i64 = row.get(1)?;
        let tier_str: String = row.get(2)?;

        let captured_at = DateTime::from_timestamp_millis(captured_ms).unwrap_or_else(|| {
            warn!("Record {} has unrepresentable capture time {}", id, captured_ms);
            Utc::now()
        });

        let tier = tier_str.parse().unwrap_or_else(|_| {
            warn!("Unknown tier: {}, defaulting to offline", tier_str);
            Tier::Offline
        });

        Ok(EncryptedRecord {
            id: Some(id),
            captured_at,
            tier,
            key_fingerprint: row.get(3)?,
            ciphertext: row.get(4)?,
            iv: row.get(5)?,
            salt: row.get(6)?,
        })
    }

    fn row_to_batch(row: &rusqlite::Row) -> rusqlite::Result<(String, String, u32, i64, String)> {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
    }
}

impl RecordStore for SqliteStore {
    fn backend(&self) -> Backend {
        Backend::Sqlite
    }

    fn insert(&mut self, record: &EncryptedRecord) -> Result<i64> {
        self.conn.execute(
            r"
            INSERT INTO records (id, captured_at, tier, key_fingerprint, ciphertext, iv, salt)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ",
            params![
                record.id,
                record.captured_at.timestamp_millis(),
                record.tier.as_str(),
                record.key_fingerprint,
                record.ciphertext,
                record.iv,
                record.salt,
            ],
        )?;

        let id = self.conn.last_insert_rowid();
        debug!("Inserted {} record with id {}", record.tier, id);
        Ok(id)
    }

    fn records(&self, tier: Tier) -> Result<Vec<EncryptedRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM records WHERE tier = ?1 ORDER BY captured_at ASC, id ASC"
        ))?;

        let records = stmt
            .query_map([tier.as_str()], Self::row_to_record)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(records)
    }

    fn latest(&self, tier: Tier) -> Result<Option<EncryptedRecord>> {
        let record = self
            .conn
            .query_row(
                &format!(
                    "SELECT {RECORD_COLUMNS} FROM records WHERE tier = ?1 ORDER BY captured_at DESC, id DESC LIMIT 1"
                ),
                [tier.as_str()],
                Self::row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    fn count(&self, tier: Tier) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM records WHERE tier = ?1",
            [tier.as_str()],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    fn delete(&mut self, ids: &[i64]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let tx = self.conn.transaction()?;
        let mut affected = 0;
        {
            let mut stmt = tx.prepare("DELETE FROM records WHERE id = ?1")?;
            for id in ids {
                affected += stmt.execute([id])?;
            }
        }
        tx.commit()?;
        Ok(affected)
    }

    fn clear(&mut self, tier: Tier) -> Result<usize> {
        let affected = self
            .conn
            .execute("DELETE FROM records WHERE tier = ?1", [tier.as_str()])?;
        if affected > 0 {
            info!("Cleared {} {} records", affected, tier);
        }
        Ok(affected)
    }

    fn evict_to_capacity(&mut self, tier: Tier, capacity: usize) -> Result<usize> {
        let keep = i64::try_from(capacity).unwrap_or(i64::MAX);
        let affected = self.conn.execute(
            r"
            DELETE FROM records WHERE tier = ?1 AND id NOT IN (
                SELECT id FROM records WHERE tier = ?1
                ORDER BY captured_at DESC, id DESC LIMIT ?2
            )
            ",
            params![tier.as_str(), keep],
        )?;

        if affected > 0 {
            debug!("Evicted {} {} records to keep {}", affected, tier, capacity);
        }
        Ok(affected)
    }

    fn save_retry_batch(&mut self, batch: &PersistedBatch) -> Result<()> {
        let payload = serde_json::to_string(&batch.records)?;
        self.conn.execute(
            r"
            INSERT OR REPLACE INTO retry_batches (key, tier, attempt, enqueued_at, payload)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ",
            params![
                batch.key,
                batch.tier.as_str(),
                batch.attempt,
                batch.enqueued_at.timestamp_millis(),
                payload,
            ],
        )?;
        Ok(())
    }

    fn remove_retry_batch(&mut self, key: &str) -> Result<bool> {
        let affected = self
            .conn
            .execute("DELETE FROM retry_batches WHERE key = ?1", [key])?;
        Ok(affected > 0)
    }

    fn retry_batches(&self) -> Result<Vec<PersistedBatch>> {
        let mut stmt = self.conn.prepare(
            "SELECT key, tier, attempt, enqueued_at, payload FROM retry_batches ORDER BY enqueued_at ASC, key ASC",
        )?;
        let rows = stmt
            .query_map([], Self::row_to_batch)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut batches = Vec::with_capacity(rows.len());
        for (key, tier, attempt, enqueued_ms, payload) in rows {
            let Ok(tier) = tier.parse::<Tier>() else {
                warn!("Skipping retry batch {} with unknown tier {}", key, tier);
                continue;
            };
            let records = match serde_json::from_str(&payload) {
                Ok(records) => records,
                Err(e) => {
                    warn!("Skipping unreadable retry batch {}: {}", key, e);
                    continue;
                }
            };
            batches.push(PersistedBatch {
                key,
                tier,
                attempt,
                enqueued_at: DateTime::from_timestamp_millis(enqueued_ms).unwrap_or_else(Utc::now),
                records,
            });
        }
        Ok(batches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_support::record;

    fn create_test_store() -> SqliteStore {
        SqliteStore::open_in_memory().expect("failed to create test store")
    }

    #[test]
    fn test_open_in_memory() {
        let store = create_test_store();
        assert_eq!(store.path().to_string_lossy(), ":memory:");
        assert_eq!(store.backend(), Backend::Sqlite);
    }

    #[test]
    fn test_insert_and_read_back() {
        let mut store = create_test_store();
        let r = record(Tier::Online, 5, 7);

        let id = store.insert(&r).unwrap();
        let records = store.records(Tier::Online).unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, Some(id));
        assert_eq!(records[0].ciphertext, vec![7; 8]);
        assert_eq!(
            records[0].captured_at.timestamp_millis(),
            r.captured_at.timestamp_millis()
        );
        assert!(store.records(Tier::Offline).unwrap().is_empty());
    }

    #[test]
    fn test_insert_keeps_existing_id() {
        let mut store = create_test_store();
        let mut r = record(Tier::Offline, 1, 1);
        r.id = Some(41);

        assert_eq!(store.insert(&r).unwrap(), 41);
        let next = store.insert(&record(Tier::Offline, 0, 2)).unwrap();
        assert!(next > 41);
    }

    #[test]
    fn test_records_are_oldest_first() {
        let mut store = create_test_store();
        store.insert(&record(Tier::Online, 1, 1)).unwrap();
        store.insert(&record(Tier::Online, 10, 2)).unwrap();
        store.insert(&record(Tier::Online, 5, 3)).unwrap();

        let markers: Vec<u8> = store
            .records(Tier::Online)
            .unwrap()
            .iter()
            .map(|r| r.ciphertext[0])
            .collect();
        assert_eq!(markers, vec![2, 3, 1]);

        let latest = store.latest(Tier::Online).unwrap().unwrap();
        assert_eq!(latest.ciphertext[0], 1);
    }

    #[test]
    fn test_count_per_tier() {
        let mut store = create_test_store();
        store.insert(&record(Tier::Online, 1, 1)).unwrap();
        store.insert(&record(Tier::Offline, 1, 2)).unwrap();
        store.insert(&record(Tier::Offline, 2, 3)).unwrap();

        assert_eq!(store.count(Tier::Online).unwrap(), 1);
        assert_eq!(store.count(Tier::Offline).unwrap(), 2);
    }

    #[test]
    fn test_evict_to_capacity_drops_oldest() {
        let mut store = create_test_store();
        for minutes_ago in 0..5u8 {
            store
                .insert(&record(Tier::Online, i64::from(minutes_ago), minutes_ago))
                .unwrap();
        }

        let evicted = store.evict_to_capacity(Tier::Online, 3).unwrap();
        assert_eq!(evicted, 2);

        let markers: Vec<u8> = store
            .records(Tier::Online)
            .unwrap()
            .iter()
            .map(|r| r.ciphertext[0])
            .collect();
        assert_eq!(markers, vec![2, 1, 0]);
    }

    #[test]
    fn test_evict_leaves_other_tier_alone() {
        let mut store = create_test_store();
        store.insert(&record(Tier::Offline, 9, 9)).unwrap();
        store.insert(&record(Tier::Online, 1, 1)).unwrap();
        store.insert(&record(Tier::Online, 2, 2)).unwrap();

        store.evict_to_capacity(Tier::Online, 1).unwrap();
        assert_eq!(store.count(Tier::Offline).unwrap(), 1);
        assert_eq!(store.count(Tier::Online).unwrap(), 1);
    }

    #[test]
    fn test_delete_and_clear() {
        let mut store = create_test_store();
        let a = store.insert(&record(Tier::Online, 1, 1)).unwrap();
        store.insert(&record(Tier::Online, 2, 2)).unwrap();
        store.insert(&record(Tier::Offline, 3, 3)).unwrap();

        assert_eq!(store.delete(&[a, 99_999]).unwrap(), 1);
        assert_eq!(store.count(Tier::Online).unwrap(), 1);
        assert_eq!(store.delete(&[]).unwrap(), 0);

        assert_eq!(store.clear(Tier::Online).unwrap(), 1);
        assert_eq!(store.count(Tier::Online).unwrap(), 0);
        assert_eq!(store.count(Tier::Offline).unwrap(), 1);
    }

    #[test]
    fn test_retry_batches_round_trip() {
        let mut store = create_test_store();
        let mut r = record(Tier::Offline, 3, 4);
        r.id = Some(12);
        let batch = PersistedBatch {
            key: "offline:1700000000000:0".to_string(),
            tier: Tier::Offline,
            attempt: 2,
            enqueued_at: DateTime::from_timestamp_millis(1_700_000_000_000).unwrap(),
            records: vec![r],
        };

        store.save_retry_batch(&batch).unwrap();
        let loaded = store.retry_batches().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].key, batch.key);
        assert_eq!(loaded[0].attempt, 2);
        assert_eq!(loaded[0].records[0].id, Some(12));

        let mut bumped = batch.clone();
        bumped.attempt = 3;
        store.save_retry_batch(&bumped).unwrap();
        assert_eq!(store.retry_batches().unwrap()[0].attempt, 3);

        assert!(store.remove_retry_batch(&batch.key).unwrap());
        assert!(!store.remove_retry_batch(&batch.key).unwrap());
        assert!(store.retry_batches().unwrap().is_empty());
    }

    #[test]
    fn test_open_file_based_persists() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("nested").join("buffer.db");

        {
            let mut store = SqliteStore::open(&db_path).unwrap();
            store.insert(&record(Tier::Offline, 1, 1)).unwrap();
            assert_eq!(store.path(), db_path);
        }

        let store = SqliteStore::open(&db_path).unwrap();
        assert_eq!(store.count(Tier::Offline).unwrap(), 1);
    }

    #[test]
    fn test_open_fails_when_parent_is_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"not a directory").unwrap();

        let result = SqliteStore::open(blocker.join("buffer.db"));
        assert!(result.is_err());
    }
}
