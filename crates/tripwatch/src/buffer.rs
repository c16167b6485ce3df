//! Dual-tier encrypted position buffer.
//!
//! Samples are validated, distance-gated against the last accepted sample of
//! their tier, sealed with [`CryptoCodec`] and written to the selected
//! [`RecordStore`]. Each tier is bounded; overflow evicts the oldest records
//! inside the same `store` call.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::{Config, StorageConfig};
use crate::crypto::{key_fingerprint, CryptoCodec};
use crate::error::{Error, Result};
use crate::position::{PositionSample, Tier, ValidationError};
use crate::storage::{
    Backend, EncryptedRecord, KeyValueStore, PersistedBatch, RecordStore, SqliteStore,
};

/// Buffer shared between the sampler and the upload coordinator.
pub type SharedBuffer = Arc<Mutex<EncryptedBuffer>>;

/// Capacity and admission limits per tier.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BufferPolicy {
    /// Maximum online records.
    pub online_capacity: usize,
    /// Maximum offline records.
    pub offline_capacity: usize,
    /// Minimum movement between accepted online samples, in meters.
    pub online_min_distance_m: f64,
    /// Minimum movement between accepted offline samples, in meters.
    pub offline_min_distance_m: f64,
}

impl BufferPolicy {
    /// Capacity of a tier.
    #[must_use]
    pub fn capacity(&self, tier: Tier) -> usize {
        match tier {
            Tier::Online => self.online_capacity,
            Tier::Offline => self.offline_capacity,
        }
    }

    /// Minimum movement for a tier.
    #[must_use]
    pub fn min_distance(&self, tier: Tier) -> f64 {
        match tier {
            Tier::Online => self.online_min_distance_m,
            Tier::Offline => self.offline_min_distance_m,
        }
    }
}

impl From<&StorageConfig> for BufferPolicy {
    fn from(config: &StorageConfig) -> Self {
        Self {
            online_capacity: config.online_capacity,
            offline_capacity: config.offline_capacity,
            online_min_distance_m: config.online_min_distance_m,
            offline_min_distance_m: config.offline_min_distance_m,
        }
    }
}

impl Default for BufferPolicy {
    fn default() -> Self {
        Self::from(&StorageConfig::default())
    }
}

/// Outcome of [`EncryptedBuffer::store`].
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    /// The sample was sealed and written.
    Stored {
        /// Id of the new record.
        id: i64,
        /// Records evicted to stay within capacity.
        evicted: usize,
    },
    /// The sample failed validation.
    Invalid(ValidationError),
    /// The sample is too close to the last accepted one.
    TooClose {
        /// Distance from the anchor, in meters.
        distance_m: f64,
        /// Tier threshold, in meters.
        threshold_m: f64,
    },
    /// The tier was full of newer records, so the sample was evicted as
    /// soon as it was written.
    Evicted,
    /// Encryption or every backend failed; the sample is lost.
    Failed(String),
}

impl Admission {
    /// Whether the sample was stored.
    #[must_use]
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Stored { .. })
    }
}

/// Record counts per tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BufferStats {
    /// Records in the online tier.
    pub online: usize,
    /// Records in the offline tier.
    pub offline: usize,
}

impl BufferStats {
    /// Combined record count.
    #[must_use]
    pub fn total(&self) -> usize {
        self.online + self.offline
    }

    /// Count for one tier.
    #[must_use]
    pub fn get(&self, tier: Tier) -> usize {
        match tier {
            Tier::Online => self.online,
            Tier::Offline => self.offline,
        }
    }
}

/// Last accepted position of a tier.
#[derive(Debug, Clone)]
struct Anchor {
    traveler_id: String,
    latitude: f64,
    longitude: f64,
}

impl Anchor {
    fn of(sample: &PositionSample) -> Self {
        Self {
            traveler_id: sample.traveler_id.clone(),
            latitude: sample.latitude,
            longitude: sample.longitude,
        }
    }
}

/// The encrypted, bounded, two-tier position buffer.
#[derive(Debug)]
pub struct EncryptedBuffer {
    store: Box<dyn RecordStore>,
    policy: BufferPolicy,
    codec: CryptoCodec,
    /// Where to demote to if the preferred store starts failing.
    fallback_path: Option<PathBuf>,
    anchors: HashMap<Tier, Anchor>,
    seeded: HashSet<Tier>,
}

impl EncryptedBuffer {
    /// Open the buffer, preferring `SQLite` and falling back to the key/value file.
    ///
    /// The database is tried `open_attempts` times, `open_retry_delay_ms` apart.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StorageUnavailable`] if neither backend can be opened.
    pub async fn initialize(config: &Config, codec: CryptoCodec) -> Result<Self> {
        let policy = BufferPolicy::from(&config.storage);
        let db_path = config.database_path();
        let fallback_path = config.fallback_path();
        let attempts = config.storage.open_attempts.max(1);
        let delay = Duration::from_millis(config.storage.open_retry_delay_ms);

        let mut last_error = None;
        for attempt in 1..=attempts {
            match SqliteStore::open(&db_path) {
                Ok(store) => {
                    return Ok(Self::with_store(
                        Box::new(store),
                        policy,
                        codec,
                        Some(fallback_path),
                    ));
                }
                Err(e) => {
                    warn!(attempt, attempts, "Failed to open {}: {}", db_path.display(), e);
                    last_error = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        match KeyValueStore::open(&fallback_path) {
            Ok(store) => {
                warn!(
                    "Using fallback store at {} after database failures",
                    fallback_path.display()
                );
                Ok(Self::with_store(Box::new(store), policy, codec, None))
            }
            Err(fallback_error) => {
                let preferred = last_error.map_or_else(String::new, |e| e.to_string());
                error!("No storage backend available");
                Err(Error::StorageUnavailable {
                    message: format!("sqlite: {preferred}; key/value: {fallback_error}"),
                })
            }
        }
    }

    /// Build a buffer over an already-open store.
    ///
    /// `fallback_path` enables demotion to a key/value store when a `SQLite`
    /// store starts failing.
    #[must_use]
    pub fn with_store(
        store: Box<dyn RecordStore>,
        policy: BufferPolicy,
        codec: CryptoCodec,
        fallback_path: Option<PathBuf>,
    ) -> Self {
        info!("Buffer using {} backend", store.backend());
        Self {
            store,
            policy,
            codec,
            fallback_path,
            anchors: HashMap::new(),
            seeded: HashSet::new(),
        }
    }

    /// Backend currently serving the buffer.
    #[must_use]
    pub fn backend(&self) -> Backend {
        self.store.backend()
    }

    /// Admission policy in force.
    #[must_use]
    pub fn policy(&self) -> BufferPolicy {
        self.policy
    }

    /// Validate, gate, seal and write a sample.
    pub fn store(&mut self, sample: &PositionSample, tier: Tier) -> Admission {
        if let Err(e) = sample.validate(Utc::now()) {
            debug!("Rejected {} sample: {}", tier, e);
            return Admission::Invalid(e);
        }

        self.seed_anchor(tier, &sample.traveler_id);
        if let Some(anchor) = self.anchors.get(&tier) {
            if anchor.traveler_id == sample.traveler_id {
                let distance_m = sample.distance_to_point(anchor.latitude, anchor.longitude);
                let threshold_m = self.policy.min_distance(tier);
                if distance_m < threshold_m {
                    debug!(
                        "Rejected {} sample {:.1} m from last (threshold {} m)",
                        tier, distance_m, threshold_m
                    );
                    return Admission::TooClose {
                        distance_m,
                        threshold_m,
                    };
                }
            }
        }

        let sealed = match self.codec.encrypt(sample, &sample.traveler_id) {
            Ok(sealed) => sealed,
            Err(e) => {
                error!("Failed to seal sample: {}", e);
                return Admission::Failed(e.to_string());
            }
        };
        let record = EncryptedRecord::new(
            sample.captured_at,
            tier,
            key_fingerprint(&sample.traveler_id),
            sealed,
        );

        let id = match self.with_failover(|store| store.insert(&record)) {
            Ok(id) => id,
            Err(e) => {
                error!("Sample lost, every backend failed: {}", e);
                return Admission::Failed(e.to_string());
            }
        };

        let capacity = self.policy.capacity(tier);
        let evicted = match self.with_failover(|store| store.evict_to_capacity(tier, capacity)) {
            Ok(n) => n,
            Err(e) => {
                warn!("Failed to enforce {} capacity: {}", tier, e);
                0
            }
        };

        if evicted > 0 && !self.holds(tier, id) {
            debug!("{} sample older than every buffered record, evicted at once", tier);
            return Admission::Evicted;
        }

        self.anchors.insert(tier, Anchor::of(sample));
        debug!("Stored {} record {} ({} evicted)", tier, id, evicted);
        Admission::Stored { id, evicted }
    }

    /// Every record of a tier, oldest first. Nothing is removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn drain(&self, tier: Tier) -> Result<Vec<EncryptedRecord>> {
        self.store.records(tier)
    }

    /// Delete exactly the given records.
    ///
    /// # Errors
    ///
    /// Returns an error if every backend fails.
    pub fn remove(&mut self, ids: &[i64]) -> Result<usize> {
        self.with_failover(|store| store.delete(ids))
    }

    /// Delete every record of a tier.
    ///
    /// # Errors
    ///
    /// Returns an error if every backend fails.
    pub fn clear(&mut self, tier: Tier) -> Result<usize> {
        self.with_failover(|store| store.clear(tier))
    }

    /// Record counts per tier.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn stats(&self) -> Result<BufferStats> {
        Ok(BufferStats {
            online: self.store.count(Tier::Online)?,
            offline: self.store.count(Tier::Offline)?,
        })
    }

    /// Persist a retry batch.
    ///
    /// # Errors
    ///
    /// Returns an error if every backend fails.
    pub fn save_retry_batch(&mut self, batch: &PersistedBatch) -> Result<()> {
        self.with_failover(|store| store.save_retry_batch(batch))
    }

    /// Forget a persisted retry batch.
    ///
    /// # Errors
    ///
    /// Returns an error if every backend fails.
    pub fn remove_retry_batch(&mut self, key: &str) -> Result<bool> {
        self.with_failover(|store| store.remove_retry_batch(key))
    }

    /// Persisted retry batches, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn retry_batches(&self) -> Result<Vec<PersistedBatch>> {
        self.store.retry_batches()
    }

    /// Restore the distance anchor of a tier from storage, once per tier.
    fn seed_anchor(&mut self, tier: Tier, traveler_id: &str) {
        if !self.seeded.insert(tier) || self.anchors.contains_key(&tier) {
            return;
        }

        let latest = match self.store.latest(tier) {
            Ok(Some(record)) => record,
            Ok(None) => return,
            Err(e) => {
                warn!("Could not read latest {} record: {}", tier, e);
                return;
            }
        };

        if !latest.may_belong_to(&key_fingerprint(traveler_id)) {
            return;
        }

        match self
            .codec
            .decrypt(&latest.ciphertext, &latest.iv, &latest.salt, traveler_id)
        {
            Ok(sample) if sample.traveler_id == traveler_id => {
                debug!("Seeded {} anchor from record {:?}", tier, latest.id);
                self.anchors.insert(tier, Anchor::of(&sample));
            }
            Ok(_) => {}
            Err(e) => debug!("Latest {} record not readable for anchor: {}", tier, e),
        }
    }

    /// Run `op`, demoting to the fallback store and retrying once if the
    /// preferred store fails.
    /// Whether record `id` is still filed under `tier`.
    fn holds(&self, tier: Tier, id: i64) -> bool {
        match self.store.records(tier) {
            Ok(records) => records.iter().any(|r| r.id == Some(id)),
            Err(e) => {
                warn!("Could not confirm {} record {}: {}", tier, id, e);
                true
            }
        }
    }

    fn with_failover<T>(
        &mut self,
        op: impl Fn(&mut Box<dyn RecordStore>) -> Result<T>,
    ) -> Result<T> {
        match op(&mut self.store) {
            Ok(value) => Ok(value),
            Err(e) if self.store.backend() == Backend::Sqlite && self.fallback_path.is_some() => {
                warn!("Database write failed, demoting to fallback store: {}", e);
                self.demote()?;
                op(&mut self.store)
            }
            Err(e) => Err(e),
        }
    }

    /// Move everything readable into the key/value store and switch to it.
    fn demote(&mut self) -> Result<()> {
        let Some(path) = self.fallback_path.take() else {
            return Err(Error::StorageUnavailable {
                message: "no fallback store configured".to_string(),
            });
        };

        let mut fallback = KeyValueStore::open(&path)?;
        let mut carried = 0;
        for tier in Tier::ALL {
            let records = self.store.records(tier).unwrap_or_else(|e| {
                warn!("Lost {} records during demotion: {}", tier, e);
                Vec::new()
            });
            for record in records {
                if fallback.insert(&record).is_err() {
                    let mut renumbered = record.clone();
                    renumbered.id = None;
                    fallback.insert(&renumbered)?;
                }
                carried += 1;
            }
        }

        let batches = self.store.retry_batches().unwrap_or_else(|e| {
            warn!("Lost persisted retry batches during demotion: {}", e);
            Vec::new()
        });
        for batch in &batches {
            fallback.save_retry_batch(batch)?;
        }

        warn!(
            "Demoted to fallback store at {} with {} records",
            path.display(),
            carried
        );
        self.store = Box::new(fallback);
        Ok(())
    }
}
