//! Job progress and skip diagnostics, readable while a job runs.
//!
//! ## Design
//!
//! - [`ProgressTracker`] and [`ErrorCollector`] are thin policies over the
//!   [`ProgressStore`] / [`ErrorStore`] capabilities injected into the job.
//! - [`TtlCache`] is the in-process store: a DashMap whose entries expire
//!   after the configured retention period. Each job id has exactly one
//!   writer, and readers always see the last complete snapshot.
//! - Percentages never go backwards. `-1` (failed) and `100` (complete) are
//!   terminal; updates arriving after either are dropped.

use crate::import::records::SkippedRecord;
use crate::import::schema::EntityKind;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rocket_okapi::okapi::schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Progress sentinel for a job that failed or was cancelled.
pub const PROGRESS_FAILED: i32 = -1;
/// Progress value of a finished job.
pub const PROGRESS_COMPLETE: i32 = 100;

/// Point-in-time view of one job's progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ProgressSnapshot {
    /// 0-100, or -1 after a failure.
    pub percentage: i32,
    pub message: String,
    pub updated_at: DateTime<Utc>,
}

impl ProgressSnapshot {
    pub fn new(percentage: i32, message: impl Into<String>) -> Self {
        Self {
            percentage,
            message: message.into(),
            updated_at: Utc::now(),
        }
    }

    /// Snapshot reported for job ids nothing has been recorded for.
    pub fn not_started() -> Self {
        Self::new(0, "Not started")
    }

    pub fn is_terminal(&self) -> bool {
        self.percentage == PROGRESS_FAILED || self.percentage >= PROGRESS_COMPLETE
    }
}

/// Storage for progress snapshots.
pub trait ProgressStore: Send + Sync {
    fn load(&self, job_id: &str) -> Option<ProgressSnapshot>;
    fn save(&self, job_id: &str, snapshot: ProgressSnapshot);

    /// Drop expired entries, returning how many were removed.
    fn purge_expired(&self) -> usize {
        0
    }
}

/// Storage for skipped-record logs, one list per job and entity type.
pub trait ErrorStore: Send + Sync {
    /// Append `record` unless the list already holds `retained_limit` entries.
    ///
    /// Returns whether the record was kept.
    fn append(
        &self,
        job_id: &str,
        entity: EntityKind,
        record: SkippedRecord,
        retained_limit: usize,
    ) -> bool;

    fn list(&self, job_id: &str, entity: EntityKind) -> Vec<SkippedRecord>;

    fn count(&self, job_id: &str, entity: EntityKind) -> usize;

    fn clear(&self, job_id: &str);

    /// Restart the expiry of every unexpired log of `job_id`.
    fn touch(&self, job_id: &str);

    fn purge_expired(&self) -> usize {
        0
    }
}

struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
}

/// Concurrent map whose entries expire `ttl` after their last write.
pub struct TtlCache<V> {
    entries: DashMap<String, CacheEntry<V>>,
    ttl: Duration,
}

impl<V: Clone> TtlCache<V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let expired = match self.entries.get(key) {
            Some(entry) if entry.expires_at > now => return Some(entry.value.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove_if(key, |_, entry| entry.expires_at <= now);
        }
        None
    }

    pub fn insert(&self, key: impl Into<String>, value: V) {
        self.entries.insert(
            key.into(),
            CacheEntry {
                value,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    /// Mutate the value under `key` in place, starting from `V::default()`
    /// when the key is absent or expired. Refreshes the expiry.
    pub fn update<T>(&self, key: &str, f: impl FnOnce(&mut V) -> T) -> T
    where
        V: Default,
    {
        let now = Instant::now();
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| CacheEntry {
                value: V::default(),
                expires_at: now,
            });
        if entry.expires_at <= now {
            entry.value = V::default();
        }
        entry.expires_at = now + self.ttl;
        f(&mut entry.value)
    }

    /// Restart the expiry of `key` if it has not expired yet.
    pub fn touch(&self, key: &str) -> bool {
        let now = Instant::now();
        match self.entries.get_mut(key) {
            Some(mut entry) if entry.expires_at > now => {
                entry.expires_at = now + self.ttl;
                true
            }
            _ => false,
        }
    }

    pub fn remove(&self, key: &str) {
        self.entries.remove(key);
    }

    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl ProgressStore for TtlCache<ProgressSnapshot> {
    fn load(&self, job_id: &str) -> Option<ProgressSnapshot> {
        self.get(job_id)
    }

    fn save(&self, job_id: &str, snapshot: ProgressSnapshot) {
        self.insert(job_id, snapshot);
    }

    fn purge_expired(&self) -> usize {
        TtlCache::purge_expired(self)
    }
}

fn skip_log_key(job_id: &str, entity: EntityKind) -> String {
    format!("{job_id}:{entity}")
}

impl ErrorStore for TtlCache<Vec<SkippedRecord>> {
    fn append(
        &self,
        job_id: &str,
        entity: EntityKind,
        record: SkippedRecord,
        retained_limit: usize,
    ) -> bool {
        self.update(&skip_log_key(job_id, entity), |records| {
            if records.len() >= retained_limit {
                return false;
            }
            records.push(record);
            true
        })
    }

    fn list(&self, job_id: &str, entity: EntityKind) -> Vec<SkippedRecord> {
        self.get(&skip_log_key(job_id, entity)).unwrap_or_default()
    }

    fn count(&self, job_id: &str, entity: EntityKind) -> usize {
        self.entries
            .get(&skip_log_key(job_id, entity))
            .filter(|entry| entry.expires_at > Instant::now())
            .map(|entry| entry.value.len())
            .unwrap_or(0)
    }

    fn clear(&self, job_id: &str) {
        for entity in [EntityKind::Customers, EntityKind::Subscriptions] {
            self.remove(&skip_log_key(job_id, entity));
        }
    }

    fn touch(&self, job_id: &str) {
        for entity in [EntityKind::Customers, EntityKind::Subscriptions] {
            TtlCache::touch(self, &skip_log_key(job_id, entity));
        }
    }

    fn purge_expired(&self) -> usize {
        TtlCache::purge_expired(self)
    }
}

/// Per-job progress with monotonic, terminal-aware updates.
#[derive(Clone)]
pub struct ProgressTracker {
    store: Arc<dyn ProgressStore>,
}

impl ProgressTracker {
    pub fn new(store: Arc<dyn ProgressStore>) -> Self {
        Self { store }
    }

    /// Reset `job_id` to 0, discarding any earlier state.
    pub fn start(&self, job_id: &str, message: &str) {
        self.store.save(job_id, ProgressSnapshot::new(0, message));
    }

    /// Record progress for `job_id`.
    ///
    /// `percentage` is clamped to 0..=100 and never lowered below the last
    /// recorded value. Returns `false` when the job has already finished or
    /// failed and the update was dropped.
    pub fn update(&self, job_id: &str, percentage: i32, message: &str) -> bool {
        let current = self.store.load(job_id);
        if current.as_ref().is_some_and(ProgressSnapshot::is_terminal) {
            log::debug!(
                "job {}: ignoring progress update after terminal state: {}% {}",
                job_id,
                percentage,
                message
            );
            return false;
        }

        let floor = current.map(|snapshot| snapshot.percentage).unwrap_or(0);
        let percentage = percentage.clamp(0, PROGRESS_COMPLETE).max(floor);
        self.store
            .save(job_id, ProgressSnapshot::new(percentage, message));
        true
    }

    pub fn complete(&self, job_id: &str, message: &str) -> bool {
        self.update(job_id, PROGRESS_COMPLETE, message)
    }

    /// Move `job_id` to the failure sentinel. No-op once terminal.
    pub fn fail(&self, job_id: &str, message: &str) -> bool {
        if self
            .store
            .load(job_id)
            .is_some_and(|snapshot| snapshot.is_terminal())
        {
            return false;
        }
        self.store
            .save(job_id, ProgressSnapshot::new(PROGRESS_FAILED, message));
        true
    }

    pub fn get(&self, job_id: &str) -> ProgressSnapshot {
        self.store
            .load(job_id)
            .unwrap_or_else(ProgressSnapshot::not_started)
    }

    pub fn purge_expired(&self) -> usize {
        self.store.purge_expired()
    }
}

/// Bounded per-job, per-entity log of skipped records.
#[derive(Clone)]
pub struct ErrorCollector {
    store: Arc<dyn ErrorStore>,
    retained_limit: usize,
}

impl ErrorCollector {
    pub fn new(store: Arc<dyn ErrorStore>, retained_limit: usize) -> Self {
        Self {
            store,
            retained_limit,
        }
    }

    pub fn record(&self, job_id: &str, entity: EntityKind, record: SkippedRecord) {
        let identifying_id = record.identifying_id.clone();
        if !self
            .store
            .append(job_id, entity, record, self.retained_limit)
        {
            log::debug!(
                "job {}: skip log for {} is full ({} entries), dropping entry for '{}'",
                job_id,
                entity,
                self.retained_limit,
                identifying_id
            );
        }
    }

    pub fn get(&self, job_id: &str, entity: EntityKind) -> Vec<SkippedRecord> {
        self.store.list(job_id, entity)
    }

    /// The first `limit` entries, and whether more are retained.
    pub fn first(
        &self,
        job_id: &str,
        entity: EntityKind,
        limit: usize,
    ) -> (Vec<SkippedRecord>, bool) {
        let mut records = self.store.list(job_id, entity);
        let has_more = records.len() > limit;
        records.truncate(limit);
        (records, has_more)
    }

    pub fn count(&self, job_id: &str, entity: EntityKind) -> usize {
        self.store.count(job_id, entity)
    }

    pub fn clear(&self, job_id: &str) {
        self.store.clear(job_id);
    }

    /// Keep a running job's skip logs alive while it makes progress.
    pub fn touch(&self, job_id: &str) {
        self.store.touch(job_id);
    }

    pub fn purge_expired(&self) -> usize {
        self.store.purge_expired()
    }
}
