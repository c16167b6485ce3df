//! Backoff queue for chunks the sink did not accept.
//!
//! Batches live in an ordered map keyed by their queue key. A min-heap of
//! `(next_retry_at, key)` answers "what fires next" in `O(log n)`; heap
//! entries whose batch was removed or rescheduled are skipped lazily.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::UploadConfig;
use crate::position::Tier;
use crate::storage::{EncryptedRecord, PersistedBatch};

/// Exponential backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound on any delay.
    pub max_delay: Duration,
    /// Retries before a batch is dropped.
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&UploadConfig::default())
    }
}

impl From<&UploadConfig> for RetryPolicy {
    fn from(config: &UploadConfig) -> Self {
        Self {
            base_delay: config.retry_base_delay(),
            max_delay: config.retry_max_delay(),
            max_retries: config.max_retries,
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt` (1-based): `min(base * 2^(n-1), max)`.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.max(1) - 1;
        let factor = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

/// A chunk waiting to be re-sent.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryBatch {
    /// Queue key, `{tier}:{enqueue millis}:{chunk index}`.
    pub key: String,
    /// Tier the records came from.
    pub tier: Tier,
    /// Number of the next retry, starting at 1.
    pub attempt: u32,
    /// When the batch becomes due.
    pub next_retry_at: Instant,
    /// Wall-clock time of the last (re)scheduling.
    pub enqueued_at: DateTime<Utc>,
    /// Encrypted payload, in upload order.
    pub records: Vec<EncryptedRecord>,
}

impl RetryBatch {
    /// Queue key for a chunk.
    #[must_use]
    pub fn key_for(tier: Tier, enqueued_at: DateTime<Utc>, chunk_index: usize) -> String {
        format!("{tier}:{}:{chunk_index}", enqueued_at.timestamp_millis())
    }

    /// Durable form of this batch.
    #[must_use]
    pub fn to_persisted(&self) -> PersistedBatch {
        PersistedBatch {
            key: self.key.clone(),
            tier: self.tier,
            attempt: self.attempt,
            enqueued_at: self.enqueued_at,
            records: self.records.clone(),
        }
    }
}

/// What happened to a batch after a failed retry.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryOutcome {
    /// Scheduled again.
    Rescheduled {
        /// The attempt number it will fire as.
        attempt: u32,
        /// When it fires.
        next_retry_at: Instant,
    },
    /// Out of retries; the records are lost.
    Dropped(RetryBatch),
}

/// Ordered retry queue with next-fire lookup.
#[derive(Debug, Default)]
pub struct RetryQueue {
    policy: RetryPolicy,
    batches: BTreeMap<String, RetryBatch>,
    schedule: BinaryHeap<Reverse<(Instant, String)>>,
    /// Millisecond stamp of the latest key handed out.
    stamp_millis: i64,
    /// `(tier, chunk index)` pairs already keyed under `stamp_millis`.
    stamped: HashSet<(Tier, usize)>,
}

impl RetryQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            batches: BTreeMap::new(),
            schedule: BinaryHeap::new(),
            stamp_millis: 0,
            stamped: HashSet::new(),
        }
    }

    /// The backoff policy.
    #[must_use]
    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Number of queued batches.
    #[must_use]
    pub fn len(&self) -> usize {
        self.batches.len()
    }

    /// Whether nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    /// Whether a batch with this key is queued.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.batches.contains_key(key)
    }

    /// Total records across all queued batches.
    #[must_use]
    pub fn record_count(&self) -> usize {
        self.batches.values().map(|b| b.records.len()).sum()
    }

    /// Queue a freshly failed chunk as attempt 1.
    pub fn enqueue(
        &mut self,
        tier: Tier,
        chunk_index: usize,
        records: Vec<EncryptedRecord>,
        now: Instant,
    ) -> RetryBatch {
        let enqueued_at = self.unique_stamp(tier, chunk_index);
        let batch = RetryBatch {
            key: RetryBatch::key_for(tier, enqueued_at, chunk_index),
            tier,
            attempt: 1,
            next_retry_at: now + self.policy.delay_for(1),
            enqueued_at,
            records,
        };
        debug!(
            "Queued {} records as {} for retry",
            batch.records.len(),
            batch.key
        );
        self.insert(batch.clone());
        batch
    }

    /// Re-queue a batch loaded from storage, counting its delay from `now`.
    pub fn restore(&mut self, persisted: PersistedBatch, now: Instant) {
        let attempt = persisted.attempt.max(1);
        self.insert(RetryBatch {
            key: persisted.key,
            tier: persisted.tier,
            attempt,
            next_retry_at: now + self.policy.delay_for(attempt),
            enqueued_at: persisted.enqueued_at,
            records: persisted.records,
        });
    }

    /// Put a batch back without consuming an attempt.
    pub fn reschedule(&mut self, mut batch: RetryBatch, now: Instant) -> RetryBatch {
        batch.next_retry_at = now + self.policy.delay_for(batch.attempt);
        batch.enqueued_at = Utc::now();
        self.insert(batch.clone());
        batch
    }

    /// Count a failed retry, re-queueing or dropping the batch.
    pub fn record_failure(&mut self, mut batch: RetryBatch, now: Instant) -> RetryOutcome {
        batch.attempt += 1;
        if batch.attempt > self.policy.max_retries {
            warn!(
                "Dropping retry batch {} with {} records after {} retries",
                batch.key,
                batch.records.len(),
                self.policy.max_retries
            );
            return RetryOutcome::Dropped(batch);
        }

        let next_retry_at = now + self.policy.delay_for(batch.attempt);
        batch.next_retry_at = next_retry_at;
        batch.enqueued_at = Utc::now();
        let attempt = batch.attempt;
        self.insert(batch);
        RetryOutcome::Rescheduled {
            attempt,
            next_retry_at,
        }
    }

    /// Earliest time any batch becomes due.
    pub fn next_retry_at(&mut self) -> Option<Instant> {
        while let Some(Reverse((at, key))) = self.schedule.peek() {
            if self.is_live(*at, key) {
                return Some(*at);
            }
            self.schedule.pop();
        }
        None
    }

    /// Remove and return every batch due at `now`, earliest first.
    pub fn take_due(&mut self, now: Instant) -> Vec<RetryBatch> {
        let mut due = Vec::new();
        while let Some(Reverse((at, _))) = self.schedule.peek() {
            if *at > now {
                break;
            }
            let Some(Reverse((at, key))) = self.schedule.pop() else {
                break;
            };
            if self.is_live(at, &key) {
                if let Some(batch) = self.batches.remove(&key) {
                    due.push(batch);
                }
            }
        }
        due
    }

    /// Remove and return every batch regardless of schedule, earliest first.
    pub fn take_all(&mut self) -> Vec<RetryBatch> {
        self.schedule.clear();
        let mut all: Vec<RetryBatch> = std::mem::take(&mut self.batches).into_values().collect();
        all.sort_by_key(|b| b.next_retry_at);
        all
    }

    /// Look up a queued batch.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&RetryBatch> {
        self.batches.get(key)
    }

    /// Remove a batch by key.
    pub fn remove(&mut self, key: &str) -> Option<RetryBatch> {
        self.batches.remove(key)
    }

    /// Enqueue time whose key no earlier batch of this queue has used.
    ///
    /// Stamps never go backwards; a repeated `(tier, chunk)` within one
    /// millisecond moves on to the next millisecond.
    fn unique_stamp(&mut self, tier: Tier, chunk_index: usize) -> DateTime<Utc> {
        let now = Utc::now();
        let now_millis = now.timestamp_millis();
        if now_millis > self.stamp_millis {
            self.stamp_millis = now_millis;
            self.stamped.clear();
        } else if self.stamped.contains(&(tier, chunk_index)) {
            self.stamp_millis += 1;
            self.stamped.clear();
        }
        self.stamped.insert((tier, chunk_index));

        if self.stamp_millis == now_millis {
            now
        } else {
            DateTime::from_timestamp_millis(self.stamp_millis).unwrap_or(now)
        }
    }

    fn insert(&mut self, batch: RetryBatch) {
        self.schedule
            .push(Reverse((batch.next_retry_at, batch.key.clone())));
        self.batches.insert(batch.key.clone(), batch);
    }

    fn is_live(&self, at: Instant, key: &str) -> bool {
        self.batches
            .get(key)
            .is_some_and(|batch| batch.next_retry_at == at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_support::record;

    fn queue() -> RetryQueue {
        RetryQueue::new(RetryPolicy::default())
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let policy = RetryPolicy::default();
        let delays: Vec<u64> = (1..=7)
            .map(|n| u64::try_from(policy.delay_for(n).as_millis()).unwrap())
            .collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16_000, 30_000, 30_000]);
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(200), Duration::from_secs(30));
    }

    #[test]
    fn test_enqueue_schedules_first_attempt() {
        let mut q = queue();
        let now = Instant::now();
        let batch = q.enqueue(Tier::Online, 0, vec![record(Tier::Online, 1, 1)], now);

        assert_eq!(batch.attempt, 1);
        assert_eq!(batch.next_retry_at, now + Duration::from_secs(1));
        assert!(batch.key.starts_with("online:"));
        assert!(batch.key.ends_with(":0"));
        assert_eq!(q.next_retry_at(), Some(now + Duration::from_secs(1)));
        assert_eq!(q.record_count(), 1);
    }

    #[test]
    fn test_same_chunk_enqueued_twice_keeps_both() {
        let mut q = queue();
        let now = Instant::now();
        let first = q.enqueue(Tier::Online, 0, vec![record(Tier::Online, 1, 1)], now);
        let second = q.enqueue(Tier::Online, 0, vec![record(Tier::Online, 1, 2)], now);

        assert_ne!(first.key, second.key);
        assert_eq!(q.len(), 2);
        assert_eq!(q.get(&first.key).unwrap().records, first.records);

        // A batch taken out for a retry must not be overwritten on return.
        let taken = q.take_all();
        let third = q.enqueue(Tier::Online, 0, Vec::new(), now);
        assert!(taken.iter().all(|b| b.key != third.key));
    }

    #[test]
    fn test_take_due_respects_schedule() {
        let mut q = queue();
        let now = Instant::now();
        q.enqueue(Tier::Online, 0, Vec::new(), now);

        assert!(q.take_due(now).is_empty());
        assert_eq!(q.len(), 1);

        let due = q.take_due(now + Duration::from_secs(1));
        assert_eq!(due.len(), 1);
        assert!(q.is_empty());
        assert_eq!(q.next_retry_at(), None);
    }

    #[test]
    fn test_failures_back_off_then_drop() {
        let mut q = queue();
        let mut now = Instant::now();
        q.enqueue(Tier::Offline, 3, vec![record(Tier::Offline, 1, 1)], now);

        let expected = [2000, 4000, 8000, 16_000];
        for (i, delay_ms) in expected.iter().enumerate() {
            now += Duration::from_secs(60);
            let mut due = q.take_due(now);
            assert_eq!(due.len(), 1);
            match q.record_failure(due.remove(0), now) {
                RetryOutcome::Rescheduled {
                    attempt,
                    next_retry_at,
                } => {
                    assert_eq!(attempt, u32::try_from(i).unwrap() + 2);
                    assert_eq!(next_retry_at, now + Duration::from_millis(*delay_ms));
                }
                RetryOutcome::Dropped(_) => panic!("dropped too early"),
            }
        }

        // Fifth failed retry exhausts the budget.
        now += Duration::from_secs(60);
        let mut due = q.take_due(now);
        assert!(matches!(
            q.record_failure(due.remove(0), now),
            RetryOutcome::Dropped(_)
        ));
        assert!(q.is_empty());
    }

    #[test]
    fn test_reschedule_keeps_attempt() {
        let mut q = queue();
        let now = Instant::now();
        q.enqueue(Tier::Online, 0, Vec::new(), now);
        let later = now + Duration::from_secs(5);
        let mut due = q.take_due(later);
        let batch = due.remove(0);

        let batch = q.record_failure(batch, later);
        assert!(matches!(batch, RetryOutcome::Rescheduled { attempt: 2, .. }));

        let mut due = q.take_due(later + Duration::from_secs(2));
        let again = q.reschedule(due.remove(0), later);
        assert_eq!(again.attempt, 2);
        assert_eq!(q.next_retry_at(), Some(later + Duration::from_secs(2)));
    }

    #[test]
    fn test_stale_heap_entries_are_skipped() {
        let mut q = queue();
        let now = Instant::now();
        let batch = q.enqueue(Tier::Online, 0, Vec::new(), now);
        q.remove(&batch.key);

        assert_eq!(q.next_retry_at(), None);
        assert!(q.take_due(now + Duration::from_secs(60)).is_empty());
    }

    #[test]
    fn test_take_all_ignores_schedule() {
        let mut q = queue();
        let now = Instant::now();
        q.enqueue(Tier::Online, 0, Vec::new(), now);
        q.enqueue(Tier::Offline, 1, Vec::new(), now);

        assert_eq!(q.take_all().len(), 2);
        assert!(q.is_empty());
        assert_eq!(q.next_retry_at(), None);
    }

    #[test]
    fn test_restore_from_persisted() {
        let mut q = queue();
        let now = Instant::now();
        q.restore(
            PersistedBatch {
                key: "offline:1700000000000:2".to_string(),
                tier: Tier::Offline,
                attempt: 3,
                enqueued_at: Utc::now(),
                records: vec![record(Tier::Offline, 1, 1)],
            },
            now,
        );

        assert!(q.contains("offline:1700000000000:2"));
        assert_eq!(q.next_retry_at(), Some(now + Duration::from_secs(4)));
    }

    #[test]
    fn test_to_persisted_round_trip() {
        let mut q = queue();
        let batch = q.enqueue(Tier::Online, 7, vec![record(Tier::Online, 1, 9)], Instant::now());
        let persisted = batch.to_persisted();
        assert_eq!(persisted.key, batch.key);
        assert_eq!(persisted.attempt, 1);
        assert_eq!(persisted.records, batch.records);
    }
}
