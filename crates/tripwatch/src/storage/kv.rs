//! Key/value fallback backend.
//!
//! The whole buffer lives in one JSON document. Every mutation is applied to
//! a copy, written to a temporary file and renamed into place, so a crash
//! leaves either the old or the new document on disk.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::position::Tier;

use super::{b64, Backend, EncryptedRecord, PersistedBatch, RecordStore};

/// Current document layout version.
pub const DOCUMENT_VERSION: u32 = 2;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Document {
    version: u32,
    next_id: i64,
    #[serde(default)]
    records: Vec<EncryptedRecord>,
    #[serde(default)]
    retry_batches: Vec<PersistedBatch>,
}

impl Default for Document {
    fn default() -> Self {
        Self {
            version: DOCUMENT_VERSION,
            next_id: 1,
            records: Vec::new(),
            retry_batches: Vec::new(),
        }
    }
}

/// Version 1 layout: one array per tier, records without ids or tiers.
#[derive(Debug, Deserialize)]
struct LegacyDocument {
    #[serde(default)]
    online: Vec<LegacyRecord>,
    #[serde(default)]
    offline: Vec<LegacyRecord>,
}

#[derive(Debug, Deserialize)]
struct LegacyRecord {
    captured_at: DateTime<Utc>,
    #[serde(with = "b64")]
    ciphertext: Vec<u8>,
    #[serde(with = "b64")]
    iv: Vec<u8>,
    #[serde(with = "b64")]
    salt: Vec<u8>,
}

impl LegacyDocument {
    fn upgrade(self) -> Document {
        let mut doc = Document::default();
        let tiers = [(Tier::Online, self.online), (Tier::Offline, self.offline)];
        for (tier, records) in tiers {
            for legacy in records {
                doc.records.push(EncryptedRecord {
                    id: Some(doc.next_id),
                    captured_at: legacy.captured_at,
                    tier,
                    key_fingerprint: String::new(),
                    ciphertext: legacy.ciphertext,
                    iv: legacy.iv,
                    salt: legacy.salt,
                });
                doc.next_id += 1;
            }
        }
        doc
    }
}

/// Fallback store backed by a single JSON file.
#[derive(Debug)]
pub struct KeyValueStore {
    path: PathBuf,
    doc: Document,
}

impl KeyValueStore {
    /// Open or create the store at the given path.
    ///
    /// A version 1 document is upgraded in place, keeping every record's tier.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or written.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).map_err(|source| Error::DirectoryCreate {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }

        let (doc, dirty) = if path.exists() {
            let raw = fs::read_to_string(&path)
                .map_err(|e| Error::key_value(&path, format!("read failed: {e}")))?;
            Self::parse(&path, &raw)?
        } else {
            (Document::default(), true)
        };

        let mut store = Self { path, doc };
        if dirty {
            // Also proves the location is writable before the buffer relies on it.
            let doc = store.doc.clone();
            store.commit(doc)?;
        }

        info!("Fallback store opened at {}", store.path.display());
        Ok(store)
    }

    /// Get the path to the store file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn parse(path: &Path, raw: &str) -> Result<(Document, bool)> {
        if raw.trim().is_empty() {
            return Ok((Document::default(), true));
        }

        let value: serde_json::Value = serde_json::from_str(raw)
            .map_err(|e| Error::key_value(path, format!("corrupt document: {e}")))?;

        match value.get("version").and_then(serde_json::Value::as_u64) {
            Some(v) if v == u64::from(DOCUMENT_VERSION) => {
                let doc = serde_json::from_value(value)
                    .map_err(|e| Error::key_value(path, format!("corrupt document: {e}")))?;
                Ok((doc, false))
            }
            Some(v) => Err(Error::key_value(
                path,
                format!("unsupported document version {v}"),
            )),
            None => {
                let legacy: LegacyDocument = serde_json::from_value(value)
                    .map_err(|e| Error::key_value(path, format!("corrupt legacy document: {e}")))?;
                let doc = legacy.upgrade();
                info!(
                    "Upgraded {} legacy records to document version {}",
                    doc.records.len(),
                    DOCUMENT_VERSION
                );
                Ok((doc, true))
            }
        }
    }

    /// Write `doc` atomically and adopt it as the current state.
    fn commit(&mut self, doc: Document) -> Result<()> {
        let encoded = serde_json::to_vec(&doc)?;
        let tmp = self.path.with_extension("tmp");

        fs::write(&tmp, &encoded)
            .map_err(|e| Error::key_value(&self.path, format!("write failed: {e}")))?;
        fs::rename(&tmp, &self.path).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            Error::key_value(&self.path, format!("replace failed: {e}"))
        })?;

        self.doc = doc;
        Ok(())
    }

    fn sorted(&self, tier: Tier) -> Vec<&EncryptedRecord> {
        let mut records: Vec<&EncryptedRecord> =
            self.doc.records.iter().filter(|r| r.tier == tier).collect();
        records.sort_by_key(|r| (r.captured_at, r.id));
        records
    }
}

impl RecordStore for KeyValueStore {
    fn backend(&self) -> Backend {
        Backend::KeyValue
    }

    fn insert(&mut self, record: &EncryptedRecord) -> Result<i64> {
        let mut doc = self.doc.clone();
        let id = record.id.unwrap_or(doc.next_id);

        if doc.records.iter().any(|r| r.id == Some(id)) {
            return Err(Error::key_value(
                &self.path,
                format!("duplicate record id {id}"),
            ));
        }

        let mut stored = record.clone();
        stored.id = Some(id);
        doc.records.push(stored);
        doc.next_id = doc.next_id.max(id + 1);

        self.commit(doc)?;
        debug!("Inserted {} record with id {}", record.tier, id);
        Ok(id)
    }

    fn records(&self, tier: Tier) -> Result<Vec<EncryptedRecord>> {
        Ok(self.sorted(tier).into_iter().cloned().collect())
    }

    fn latest(&self, tier: Tier) -> Result<Option<EncryptedRecord>> {
        Ok(self.sorted(tier).last().map(|r| (*r).clone()))
    }

    fn count(&self, tier: Tier) -> Result<usize> {
        Ok(self.doc.records.iter().filter(|r| r.tier == tier).count())
    }

    fn delete(&mut self, ids: &[i64]) -> Result<usize> {
        let mut doc = self.doc.clone();
        let before = doc.records.len();
        doc.records.retain(|r| !matches!(r.id, Some(id) if ids.contains(&id)));
        let removed = before - doc.records.len();

        if removed > 0 {
            self.commit(doc)?;
        }
        Ok(removed)
    }

    fn clear(&mut self, tier: Tier) -> Result<usize> {
        let mut doc = self.doc.clone();
        let before = doc.records.len();
        doc.records.retain(|r| r.tier != tier);
        let removed = before - doc.records.len();

        if removed > 0 {
            self.commit(doc)?;
            info!("Cleared {} {} records", removed, tier);
        }
        Ok(removed)
    }

    fn evict_to_capacity(&mut self, tier: Tier, capacity: usize) -> Result<usize> {
        let sorted = self.sorted(tier);
        let excess = sorted.len().saturating_sub(capacity);
        if excess == 0 {
            return Ok(0);
        }

        let doomed: Vec<i64> = sorted.iter().take(excess).filter_map(|r| r.id).collect();
        let removed = self.delete(&doomed)?;
        debug!("Evicted {} {} records to keep {}", removed, tier, capacity);
        Ok(removed)
    }

    fn save_retry_batch(&mut self, batch: &PersistedBatch) -> Result<()> {
        let mut doc = self.doc.clone();
        match doc.retry_batches.iter_mut().find(|b| b.key == batch.key) {
            Some(existing) => *existing = batch.clone(),
            None => doc.retry_batches.push(batch.clone()),
        }
        self.commit(doc)
    }

    fn remove_retry_batch(&mut self, key: &str) -> Result<bool> {
        if !self.doc.retry_batches.iter().any(|b| b.key == key) {
            return Ok(false);
        }
        let mut doc = self.doc.clone();
        doc.retry_batches.retain(|b| b.key != key);
        self.commit(doc)?;
        Ok(true)
    }

    fn retry_batches(&self) -> Result<Vec<PersistedBatch>> {
        let mut batches = self.doc.retry_batches.clone();
        batches.sort_by(|a, b| (a.enqueued_at, &a.key).cmp(&(b.enqueued_at, &b.key)));
        Ok(batches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_support::record;

    fn open_temp() -> (tempfile::TempDir, KeyValueStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyValueStore::open(dir.path().join("buffer.json")).unwrap();
        (dir, store)
    }

    #[test]
    fn test_open_creates_document() {
        let (dir, store) = open_temp();
        assert_eq!(store.backend(), Backend::KeyValue);

        let raw = fs::read_to_string(dir.path().join("buffer.json")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["version"], 2);
        assert_eq!(value["next_id"], 1);
    }

    #[test]
    fn test_insert_assigns_increasing_ids() {
        let (_dir, mut store) = open_temp();
        let a = store.insert(&record(Tier::Online, 2, 1)).unwrap();
        let b = store.insert(&record(Tier::Online, 1, 2)).unwrap();
        assert!(b > a);

        let mut explicit = record(Tier::Offline, 1, 3);
        explicit.id = Some(100);
        assert_eq!(store.insert(&explicit).unwrap(), 100);
        assert_eq!(store.insert(&record(Tier::Offline, 0, 4)).unwrap(), 101);
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let (_dir, mut store) = open_temp();
        let mut r = record(Tier::Online, 1, 1);
        r.id = Some(5);
        store.insert(&r).unwrap();
        assert!(store.insert(&r).is_err());
        assert_eq!(store.count(Tier::Online).unwrap(), 1);
    }

    #[test]
    fn test_reopen_keeps_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("buffer.json");
        {
            let mut store = KeyValueStore::open(&path).unwrap();
            store.insert(&record(Tier::Offline, 3, 9)).unwrap();
        }

        let store = KeyValueStore::open(&path).unwrap();
        let records = store.records(Tier::Offline).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].ciphertext, vec![9; 8]);
        assert_eq!(store.path(), path);
    }

    #[test]
    fn test_ordering_latest_and_eviction() {
        let (_dir, mut store) = open_temp();
        for minutes_ago in [4u8, 0, 2, 3, 1] {
            store
                .insert(&record(Tier::Online, i64::from(minutes_ago), minutes_ago))
                .unwrap();
        }

        let latest = store.latest(Tier::Online).unwrap().unwrap();
        assert_eq!(latest.ciphertext[0], 0);

        assert_eq!(store.evict_to_capacity(Tier::Online, 2).unwrap(), 3);
        let markers: Vec<u8> = store
            .records(Tier::Online)
            .unwrap()
            .iter()
            .map(|r| r.ciphertext[0])
            .collect();
        assert_eq!(markers, vec![1, 0]);
        assert_eq!(store.evict_to_capacity(Tier::Online, 2).unwrap(), 0);
    }

    #[test]
    fn test_delete_and_clear() {
        let (_dir, mut store) = open_temp();
        let a = store.insert(&record(Tier::Online, 1, 1)).unwrap();
        store.insert(&record(Tier::Offline, 1, 2)).unwrap();

        assert_eq!(store.delete(&[a, 77]).unwrap(), 1);
        assert_eq!(store.count(Tier::Online).unwrap(), 0);
        assert_eq!(store.clear(Tier::Offline).unwrap(), 1);
        assert_eq!(store.clear(Tier::Offline).unwrap(), 0);
    }

    #[test]
    fn test_retry_batches_replace_and_remove() {
        let (_dir, mut store) = open_temp();
        let batch = PersistedBatch {
            key: "online:1:0".to_string(),
            tier: Tier::Online,
            attempt: 1,
            enqueued_at: Utc::now(),
            records: vec![record(Tier::Online, 1, 1)],
        };
        store.save_retry_batch(&batch).unwrap();

        let mut bumped = batch.clone();
        bumped.attempt = 2;
        store.save_retry_batch(&bumped).unwrap();

        let batches = store.retry_batches().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].attempt, 2);

        assert!(store.remove_retry_batch("online:1:0").unwrap());
        assert!(!store.remove_retry_batch("online:1:0").unwrap());
    }

    #[test]
    fn test_legacy_document_is_upgraded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("buffer.json");
        fs::write(
            &path,
            r#"{
                "online": [
                    {"captured_at": "2024-03-01T10:00:00Z", "ciphertext": "AQ==", "iv": "Ag==", "salt": "Aw=="}
                ],
                "offline": [
                    {"captured_at": "2024-03-01T10:05:00Z", "ciphertext": "BA==", "iv": "Ag==", "salt": "Aw=="},
                    {"captured_at": "2024-03-01T10:10:00Z", "ciphertext": "BQ==", "iv": "Ag==", "salt": "Aw=="}
                ]
            }"#,
        )
        .unwrap();

        let store = KeyValueStore::open(&path).unwrap();
        assert_eq!(store.count(Tier::Online).unwrap(), 1);
        assert_eq!(store.count(Tier::Offline).unwrap(), 2);

        let offline = store.records(Tier::Offline).unwrap();
        assert_eq!(offline[0].ciphertext, vec![4]);
        assert!(offline[0].key_fingerprint.is_empty());

        let raw = fs::read_to_string(&path).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["version"], 2);
        assert_eq!(value["next_id"], 4);
    }

    #[test]
    fn test_corrupt_document_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("buffer.json");
        fs::write(&path, "{not json").unwrap();

        let err = KeyValueStore::open(&path).unwrap_err();
        assert!(err.is_storage_error());
    }

    #[test]
    fn test_unknown_version_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("buffer.json");
        fs::write(&path, r#"{"version": 9, "next_id": 1}"#).unwrap();

        let err = KeyValueStore::open(&path).unwrap_err();
        assert!(err.to_string().contains("unsupported document version 9"));
    }
}
