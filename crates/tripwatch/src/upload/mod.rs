//! Upload coordination.
//!
//! The [`UploadCoordinator`] drains the buffer tier by tier, decrypts the
//! records, pushes them to an [`UploadSink`] in bounded chunks and keeps
//! failed chunks in a [`RetryQueue`] with exponential backoff.
//!
//! Ordering is always drain, upload, then remove: a record leaves the buffer
//! only after its chunk was accepted or handed to the retry queue.

pub mod retry;
pub mod sink;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::buffer::SharedBuffer;
use crate::config::UploadConfig;
use crate::crypto::{key_fingerprint, CryptoCodec};
use crate::device::ConnectivitySource;
use crate::error::Result;
use crate::position::{PositionSample, Tier};
use crate::storage::{EncryptedRecord, PersistedBatch};

pub use retry::{RetryBatch, RetryOutcome, RetryPolicy, RetryQueue};
pub use sink::{HttpUploadSink, LogUploadSink, SinkError, UploadSink};

/// Why an upload call did not run or did not finish.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UploadError {
    /// Another upload holds the in-flight guard.
    #[error("upload in progress")]
    InProgress,

    /// The device is offline.
    #[error("no network connection")]
    NoConnection,

    /// The coordinator was disposed.
    #[error("upload coordinator disposed")]
    Disposed,

    /// The buffer could not be read or updated.
    #[error("storage error: {0}")]
    Storage(String),
}

/// Outcome of an upload call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadResult {
    /// Records the sink accepted.
    pub uploaded_count: usize,
    /// Records whose chunk failed and went to (or stayed in) the retry queue.
    pub failed_count: usize,
    /// Records that could not be decrypted and were discarded.
    pub dropped_count: usize,
    /// Set when the call was refused or hit a storage problem.
    pub error: Option<UploadError>,
}

impl UploadResult {
    /// A result for a call that did nothing.
    #[must_use]
    pub fn refused(error: UploadError) -> Self {
        Self {
            error: Some(error),
            ..Self::default()
        }
    }

    /// Whether everything attempted went through.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.failed_count == 0
    }

    fn absorb(&mut self, other: Self) {
        self.uploaded_count += other.uploaded_count;
        self.failed_count += other.failed_count;
        self.dropped_count += other.dropped_count;
        if self.error.is_none() {
            self.error = other.error;
        }
    }
}

/// Clears the in-flight flag when dropped.
struct InFlightGuard<'a>(&'a AtomicBool);

impl<'a> InFlightGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Moves buffered records to the sink.
pub struct UploadCoordinator {
    buffer: SharedBuffer,
    codec: CryptoCodec,
    traveler_id: String,
    fingerprint: String,
    sink: Arc<dyn UploadSink>,
    connectivity: Arc<dyn ConnectivitySource>,
    chunk_size: usize,
    chunk_timeout: Duration,
    queue: Mutex<RetryQueue>,
    in_flight: AtomicBool,
    disposed: AtomicBool,
}

impl fmt::Debug for UploadCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadCoordinator")
            .field("sink", &self.sink.name())
            .field("chunk_size", &self.chunk_size)
            .field("chunk_timeout", &self.chunk_timeout)
            .field("in_flight", &self.in_flight.load(Ordering::Relaxed))
            .field("disposed", &self.disposed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl UploadCoordinator {
    /// Create a coordinator with an empty retry queue.
    #[must_use]
    pub fn new(
        buffer: SharedBuffer,
        codec: CryptoCodec,
        traveler_id: impl Into<String>,
        sink: Arc<dyn UploadSink>,
        connectivity: Arc<dyn ConnectivitySource>,
        config: &UploadConfig,
    ) -> Self {
        let traveler_id = traveler_id.into();
        Self {
            buffer,
            codec,
            fingerprint: key_fingerprint(&traveler_id),
            traveler_id,
            sink,
            connectivity,
            chunk_size: config.chunk_size.max(1),
            chunk_timeout: config.chunk_timeout(),
            queue: Mutex::new(RetryQueue::new(RetryPolicy::from(config))),
            in_flight: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        }
    }

    /// Load retry batches persisted by an earlier run.
    ///
    /// # Errors
    ///
    /// Returns an error if the buffer cannot be read.
    pub async fn restore_retry_queue(&self) -> Result<usize> {
        let persisted = self.buffer.lock().await.retry_batches()?;
        let count = persisted.len();
        let now = Instant::now();
        let mut queue = self.queue.lock().await;
        for batch in persisted {
            queue.restore(batch, now);
        }
        if count > 0 {
            info!("Restored {} retry batches", count);
        }
        Ok(count)
    }

    /// Upload every buffered record, online tier first.
    pub async fn upload_pending(&self) -> UploadResult {
        if self.is_disposed() {
            return UploadResult::refused(UploadError::Disposed);
        }
        let Some(_guard) = InFlightGuard::acquire(&self.in_flight) else {
            debug!("Upload already in progress");
            return UploadResult::refused(UploadError::InProgress);
        };
        if !self.connectivity.is_online() {
            return UploadResult::refused(UploadError::NoConnection);
        }

        self.upload_tiers().await
    }

    /// Push everything out now: the whole retry queue, then the buffer.
    ///
    /// Ignores the in-flight guard and the retry schedule. Offline, nothing
    /// is touched.
    pub async fn emergency_flush(&self) -> UploadResult {
        if self.is_disposed() {
            return UploadResult::refused(UploadError::Disposed);
        }
        if !self.connectivity.is_online() {
            warn!("Emergency flush requested while offline");
            return UploadResult::refused(UploadError::NoConnection);
        }

        info!("Emergency flush");
        let mut result = self.drain_retry_queue(true).await;
        if !self.is_disposed() {
            result.absorb(self.upload_tiers().await);
        }
        result
    }

    /// Retry queued batches: those due now, or all of them with `force`.
    ///
    /// Offline, due batches are rescheduled without using up an attempt.
    pub async fn process_retry_queue(&self, force: bool) -> UploadResult {
        if self.is_disposed() {
            return UploadResult::refused(UploadError::Disposed);
        }
        let Some(_guard) = InFlightGuard::acquire(&self.in_flight) else {
            return UploadResult::refused(UploadError::InProgress);
        };

        if !self.connectivity.is_online() {
            if !force {
                self.postpone_due().await;
            }
            return UploadResult::refused(UploadError::NoConnection);
        }

        self.drain_retry_queue(force).await
    }

    /// When the next retry batch becomes due.
    pub async fn next_retry_at(&self) -> Option<Instant> {
        self.queue.lock().await.next_retry_at()
    }

    /// Batches and records waiting for a retry.
    pub async fn pending_retries(&self) -> (usize, usize) {
        let queue = self.queue.lock().await;
        (queue.len(), queue.record_count())
    }

    /// Make every later call fail fast and discard results still in flight.
    pub fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::AcqRel) {
            info!("Upload coordinator disposed");
        }
    }

    /// Whether [`dispose`](Self::dispose) was called.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    async fn upload_tiers(&self) -> UploadResult {
        let mut result = UploadResult::default();
        for tier in Tier::ALL {
            self.upload_tier(tier, &mut result).await;
            if self.is_disposed() {
                return UploadResult::refused(UploadError::Disposed);
            }
        }
        if result.uploaded_count > 0 || result.failed_count > 0 {
            info!(
                uploaded = result.uploaded_count,
                failed = result.failed_count,
                dropped = result.dropped_count,
                "upload_pass_complete"
            );
        }
        result
    }

    async fn upload_tier(&self, tier: Tier, result: &mut UploadResult) {
        let drained = match self.buffer.lock().await.drain(tier) {
            Ok(records) => records,
            Err(e) => {
                warn!("Could not drain {} tier: {}", tier, e);
                result.error.get_or_insert(UploadError::Storage(e.to_string()));
                return;
            }
        };
        if drained.is_empty() {
            return;
        }

        let drained_ids: Vec<i64> = drained.iter().filter_map(|r| r.id).collect();
        let opened = self.open_records(drained, result);

        for (index, chunk) in opened.chunks(self.chunk_size).enumerate() {
            let samples: Vec<PositionSample> = chunk.iter().map(|(_, s)| s.clone()).collect();
            let outcome = self.send_chunk(&samples).await;
            if self.is_disposed() {
                return;
            }

            match outcome {
                Ok(()) => result.uploaded_count += samples.len(),
                Err(e) => {
                    warn!("Chunk {} of {} tier failed: {}", index, tier, e);
                    result.failed_count += samples.len();
                    let records: Vec<EncryptedRecord> =
                        chunk.iter().map(|(r, _)| r.clone()).collect();
                    let batch = self
                        .queue
                        .lock()
                        .await
                        .enqueue(tier, index, records, Instant::now());
                    let persisted = batch.to_persisted();
                    if let Err(e) = self.buffer.lock().await.save_retry_batch(&persisted) {
                        warn!("Retry batch {} kept in memory only: {}", batch.key, e);
                    }
                }
            }
        }

        match self.buffer.lock().await.remove(&drained_ids) {
            Ok(removed) => debug!("Removed {} drained {} records", removed, tier),
            Err(e) => {
                warn!("Could not remove drained {} records: {}", tier, e);
                result.error.get_or_insert(UploadError::Storage(e.to_string()));
            }
        }
    }

    async fn drain_retry_queue(&self, force: bool) -> UploadResult {
        let now = Instant::now();
        let batches = {
            let mut queue = self.queue.lock().await;
            if force {
                queue.take_all()
            } else {
                queue.take_due(now)
            }
        };

        let mut result = UploadResult::default();
        for batch in batches {
            if self.is_disposed() {
                return UploadResult::refused(UploadError::Disposed);
            }
            self.retry_batch(batch, &mut result).await;
        }
        result
    }

    async fn retry_batch(&self, batch: RetryBatch, result: &mut UploadResult) {
        let opened = self.open_records(batch.records.clone(), result);
        if opened.is_empty() {
            self.forget_batch(&batch.key).await;
            return;
        }

        let samples: Vec<PositionSample> = opened.into_iter().map(|(_, s)| s).collect();
        let outcome = self.send_chunk(&samples).await;
        if self.is_disposed() {
            return;
        }

        match outcome {
            Ok(()) => {
                debug!("Retry batch {} delivered", batch.key);
                result.uploaded_count += samples.len();
                self.forget_batch(&batch.key).await;
            }
            Err(e) => {
                result.failed_count += samples.len();
                let key = batch.key.clone();
                let mut queue = self.queue.lock().await;
                match queue.record_failure(batch, Instant::now()) {
                    RetryOutcome::Rescheduled { attempt, .. } => {
                        debug!("Retry batch {} failed ({}), next attempt {}", key, e, attempt);
                        let persisted = queue.get(&key).map(RetryBatch::to_persisted);
                        drop(queue);
                        if let Some(persisted) = persisted {
                            self.persist_batch(&persisted).await;
                        }
                    }
                    RetryOutcome::Dropped(dropped) => {
                        drop(queue);
                        self.forget_batch(&dropped.key).await;
                    }
                }
            }
        }
    }

    /// Push due batches back without consuming an attempt.
    async fn postpone_due(&self) {
        let now = Instant::now();
        let mut queue = self.queue.lock().await;
        let due = queue.take_due(now);
        if due.is_empty() {
            return;
        }
        debug!("Offline, postponing {} retry batches", due.len());
        let persisted: Vec<_> = due
            .into_iter()
            .map(|batch| queue.reschedule(batch, now).to_persisted())
            .collect();
        drop(queue);
        for batch in &persisted {
            self.persist_batch(batch).await;
        }
    }

    async fn persist_batch(&self, batch: &PersistedBatch) {
        if let Err(e) = self.buffer.lock().await.save_retry_batch(batch) {
            warn!("Could not persist retry batch {}: {}", batch.key, e);
        }
    }

    async fn forget_batch(&self, key: &str) {
        if let Err(e) = self.buffer.lock().await.remove_retry_batch(key) {
            warn!("Could not remove persisted retry batch {}: {}", key, e);
        }
    }

    /// Decrypt records, discarding the ones that cannot be opened.
    fn open_records(
        &self,
        records: Vec<EncryptedRecord>,
        result: &mut UploadResult,
    ) -> Vec<(EncryptedRecord, PositionSample)> {
        let mut opened = Vec::with_capacity(records.len());
        for record in records {
            if !record.may_belong_to(&self.fingerprint) {
                warn!("Dropping record {:?} owned by another traveler", record.id);
                result.dropped_count += 1;
                continue;
            }
            match self
                .codec
                .decrypt(&record.ciphertext, &record.iv, &record.salt, &self.traveler_id)
            {
                Ok(sample) => opened.push((record, sample)),
                Err(e) => {
                    warn!("Dropping undecryptable record {:?}: {}", record.id, e);
                    result.dropped_count += 1;
                }
            }
        }
        opened
    }

    async fn send_chunk(&self, samples: &[PositionSample]) -> std::result::Result<(), SinkError> {
        match tokio::time::timeout(
            self.chunk_timeout,
            self.sink.upload(&self.traveler_id, samples),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => Err(SinkError::Timeout {
                seconds: self.chunk_timeout.as_secs(),
            }),
        }
    }
}
