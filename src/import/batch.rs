//! Chunked commit of validated records.
//!
//! Records are committed in fixed-size chunks, strictly one after another:
//!
//! 1. Child records whose parent key is not among the known parents are
//!    skipped as `referential` before anything is written.
//! 2. The remaining chunk is written with one bulk upsert.
//! 3. If the bulk upsert fails or times out, every record of the chunk is
//!    retried on its own. Records that still fail are skipped as
//!    `persistence`; the rest of the chunk is still written.
//!
//! Progress is reported after every chunk, interpolated across the phase's
//! reserved percentage range. Cancellation is checked before each chunk.

use crate::config::ImportConfig;
use crate::import::error::ImportError;
use crate::import::progress::{ErrorCollector, ProgressTracker};
use crate::import::records::{ImportRecord, SkipReason, SkippedRecord};
use crate::import::stats::EntityStats;
use crate::import::store::{RecordSink, StoreError};
use std::collections::HashSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// Percentage range reserved for one import phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseRange {
    pub start: i32,
    pub end: i32,
}

impl PhaseRange {
    pub const CUSTOMERS: PhaseRange = PhaseRange { start: 40, end: 65 };
    pub const SUBSCRIPTIONS: PhaseRange = PhaseRange { start: 70, end: 95 };

    /// Percentage after `done` of `total` chunks.
    pub fn at(&self, done: usize, total: usize) -> i32 {
        if total == 0 || done >= total {
            return self.end;
        }
        let span = i64::from(self.end - self.start);
        self.start + (span * done as i64 / total as i64) as i32
    }
}

/// Commits records for one job.
pub struct BatchImporter {
    job_id: String,
    config: ImportConfig,
    progress: ProgressTracker,
    errors: ErrorCollector,
    cancel: CancellationToken,
}

impl BatchImporter {
    pub fn new(
        job_id: impl Into<String>,
        config: ImportConfig,
        progress: ProgressTracker,
        errors: ErrorCollector,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            config,
            progress,
            errors,
            cancel,
        }
    }

    /// Commit `records` to `store`.
    ///
    /// With `known_parents` set, records whose [`ImportRecord::parent_key`]
    /// is not in the set are skipped as `referential`.
    ///
    /// The returned stats carry `imported` and `skipped`; `total` and
    /// `malformed` are counted while parsing and stay zero here.
    ///
    /// # Errors
    ///
    /// [`ImportError::Cancelled`] when the job is cancelled between chunks.
    /// Store failures never abort the import.
    pub async fn import<R, S>(
        &self,
        store: &S,
        records: Vec<R>,
        known_parents: Option<&HashSet<String>>,
        range: PhaseRange,
    ) -> Result<EntityStats, ImportError>
    where
        R: ImportRecord,
        S: RecordSink<R> + ?Sized,
    {
        let mut stats = EntityStats::default();
        let entity = R::ENTITY;

        if records.is_empty() {
            self.progress.update(
                &self.job_id,
                range.end,
                &format!("No {entity} to import"),
            );
            return Ok(stats);
        }

        let chunk_size = self.config.chunk_size.max(1);
        let chunk_count = records.len().div_ceil(chunk_size);
        log::info!(
            "job {}: importing {} {} in {} chunk(s) of up to {}",
            self.job_id,
            records.len(),
            entity,
            chunk_count,
            chunk_size
        );

        let mut remaining = records.into_iter();
        for chunk_idx in 0..chunk_count {
            if self.cancel.is_cancelled() {
                log::warn!(
                    "job {}: cancelled before {} chunk {}/{}",
                    self.job_id,
                    entity,
                    chunk_idx + 1,
                    chunk_count
                );
                return Err(ImportError::Cancelled);
            }

            let chunk: Vec<R> = remaining.by_ref().take(chunk_size).collect();
            let chunk = match known_parents {
                Some(known) => self.filter_orphans(chunk, known, &mut stats),
                None => chunk,
            };

            if !chunk.is_empty() {
                let (imported, skipped) = self.commit_chunk(store, &chunk).await;
                stats.imported += imported;
                stats.skipped += skipped;
            }

            self.progress.update(
                &self.job_id,
                range.at(chunk_idx + 1, chunk_count),
                &format!(
                    "Importing {}: chunk {}/{}, {} imported, {} skipped",
                    entity,
                    chunk_idx + 1,
                    chunk_count,
                    stats.imported,
                    stats.skipped
                ),
            );
            self.errors.touch(&self.job_id);

            if chunk_idx + 1 < chunk_count && !self.config.chunk_delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.chunk_delay) => {}
                    _ = self.cancel.cancelled() => {}
                }
            }
        }

        log::info!(
            "job {}: {} done, {} imported, {} skipped",
            self.job_id,
            entity,
            stats.imported,
            stats.skipped
        );
        Ok(stats)
    }

    fn filter_orphans<R: ImportRecord>(
        &self,
        chunk: Vec<R>,
        known: &HashSet<String>,
        stats: &mut EntityStats,
    ) -> Vec<R> {
        let (accepted, orphans): (Vec<R>, Vec<R>) = chunk
            .into_iter()
            .partition(|record| record.parent_key().is_none_or(|parent| known.contains(parent)));

        for orphan in orphans {
            let parent = orphan.parent_key().unwrap_or_default();
            log::debug!(
                "job {}: skipping {} '{}': parent '{}' does not exist",
                self.job_id,
                R::ENTITY,
                orphan.key(),
                parent
            );
            self.errors.record(
                &self.job_id,
                R::ENTITY,
                SkippedRecord::new(
                    R::ENTITY,
                    Some(orphan.key()),
                    SkipReason::Referential,
                    &format!("parent record '{parent}' does not exist"),
                ),
            );
            stats.skipped += 1;
        }

        accepted
    }

    /// Bulk upsert with per-record fallback. Returns `(imported, skipped)`.
    async fn commit_chunk<R, S>(&self, store: &S, chunk: &[R]) -> (usize, usize)
    where
        R: ImportRecord,
        S: RecordSink<R> + ?Sized,
    {
        let limit = self.config.chunk_timeout;
        let bulk = match timeout(limit, store.upsert_batch(chunk)).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(limit)),
        };

        match bulk {
            Ok(written) => {
                log::trace!(
                    "job {}: bulk upserted {} {} ({} rows affected)",
                    self.job_id,
                    chunk.len(),
                    R::ENTITY,
                    written
                );
                return (chunk.len(), 0);
            }
            Err(err) => log::warn!(
                "job {}: bulk upsert of {} {} failed, retrying one by one: {}",
                self.job_id,
                chunk.len(),
                R::ENTITY,
                err
            ),
        }

        let mut imported = 0;
        let mut skipped = 0;
        for record in chunk {
            let outcome = match timeout(limit, store.upsert_one(record)).await {
                Ok(result) => result,
                Err(_) => Err(StoreError::Timeout(limit)),
            };

            match outcome {
                Ok(()) => imported += 1,
                Err(err) => {
                    let skip = SkippedRecord::new(
                        R::ENTITY,
                        Some(record.key()),
                        SkipReason::Persistence,
                        &err.to_string(),
                    );
                    log::warn!(
                        "job {}: could not write {} '{}': {}",
                        self.job_id,
                        R::ENTITY,
                        skip.identifying_id,
                        skip.details
                    );
                    self.errors.record(&self.job_id, R::ENTITY, skip);
                    skipped += 1;
                }
            }
        }

        (imported, skipped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::import::progress::{ProgressSnapshot, TtlCache};
    use crate::import::records::{CustomerRecord, SubscriptionRecord};
    use crate::import::schema::{CUSTOMER_SCHEMA, EntityKind, SUBSCRIPTION_SCHEMA, map_row};
    use crate::test_support::MemoryStore;
    use std::sync::Arc;
    use std::time::Duration;

    /// Store whose bulk writes never finish, nor do single writes of `hanging` ids.
    struct StalledStore {
        inner: MemoryStore,
        hanging: HashSet<String>,
    }

    impl StalledStore {
        fn new(hanging: &[&str]) -> Self {
            Self {
                inner: MemoryStore::new(),
                hanging: hanging.iter().map(|id| id.to_string()).collect(),
            }
        }
    }

    #[rocket::async_trait]
    impl RecordSink<CustomerRecord> for StalledStore {
        async fn upsert_batch(&self, _records: &[CustomerRecord]) -> Result<u64, StoreError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(0)
        }

        async fn upsert_one(&self, record: &CustomerRecord) -> Result<(), StoreError> {
            if self.hanging.contains(&record.customer_id) {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            self.inner.upsert_one(record).await
        }
    }

    fn stalling_config() -> ImportConfig {
        ImportConfig {
            chunk_timeout: Duration::from_millis(50),
            ..config(10)
        }
    }

    fn config(chunk_size: usize) -> ImportConfig {
        ImportConfig {
            chunk_size,
            chunk_delay: Duration::ZERO,
            chunk_timeout: Duration::from_secs(5),
            progress_ttl: Duration::from_secs(60),
            skipped_inline_limit: 50,
            skipped_retained_limit: 1000,
            customer_table: "customers".into(),
            subscription_table: "subscriptions".into(),
            max_upload_mb: 1,
        }
    }

    fn importer(chunk_size: usize) -> (BatchImporter, ProgressTracker, ErrorCollector) {
        importer_with(config(chunk_size))
    }

    fn importer_with(config: ImportConfig) -> (BatchImporter, ProgressTracker, ErrorCollector) {
        let progress = ProgressTracker::new(Arc::new(TtlCache::<ProgressSnapshot>::new(
            Duration::from_secs(60),
        )));
        let errors = ErrorCollector::new(
            Arc::new(TtlCache::<Vec<SkippedRecord>>::new(Duration::from_secs(60))),
            1000,
        );
        let importer = BatchImporter::new(
            "job",
            config,
            progress.clone(),
            errors.clone(),
            CancellationToken::new(),
        );
        (importer, progress, errors)
    }

    fn customer(id: &str) -> CustomerRecord {
        let mut tokens = vec!["NULL".to_string(); 12];
        tokens[1] = format!("'{id}'");
        tokens[2] = "'Alice'".into();
        CustomerRecord::from_row(map_row(&CUSTOMER_SCHEMA, &tokens).unwrap())
    }

    fn subscription(id: &str, customer: &str) -> SubscriptionRecord {
        let mut tokens = vec!["NULL".to_string(); 34];
        tokens[1] = format!("'{id}'");
        tokens[2] = format!("'{customer}'");
        tokens[3] = "'Fiber'".into();
        SubscriptionRecord::from_row(map_row(&SUBSCRIPTION_SCHEMA, &tokens).unwrap())
    }

    #[test]
    fn test_phase_range_interpolation() {
        let range = PhaseRange::CUSTOMERS;
        assert_eq!(range.at(0, 4), 40);
        assert_eq!(range.at(2, 4), 52);
        assert_eq!(range.at(4, 4), 65);
        assert_eq!(range.at(0, 0), 65);
    }

    #[tokio::test]
    async fn test_import_commits_all_chunks() {
        let (importer, progress, _) = importer(2);
        let store = MemoryStore::new();
        let records: Vec<_> = (0..5).map(|idx| customer(&format!("P{idx}"))).collect();

        let stats = importer
            .import(&store, records, None, PhaseRange::CUSTOMERS)
            .await
            .unwrap();

        assert_eq!(stats.imported, 5);
        assert_eq!(stats.skipped, 0);
        assert_eq!(store.customer_count(), 5);
        assert_eq!(store.batch_calls(), 3);

        let snapshot = progress.get("job");
        assert_eq!(snapshot.percentage, 65);
        assert_eq!(snapshot.message, "Importing customers: chunk 3/3, 5 imported, 0 skipped");
    }

    #[tokio::test]
    async fn test_orphans_are_skipped_as_referential() {
        let (importer, _, errors) = importer(10);
        let store = MemoryStore::new();
        let known: HashSet<String> = ["P1".to_string()].into_iter().collect();

        let stats = importer
            .import(
                &store,
                vec![subscription("C1", "P1"), subscription("C2", "P2")],
                Some(&known),
                PhaseRange::SUBSCRIPTIONS,
            )
            .await
            .unwrap();

        assert_eq!(stats.imported, 1);
        assert_eq!(stats.skipped, 1);
        assert!(store.has_subscription("C1"));
        assert!(!store.has_subscription("C2"));

        let skipped = errors.get("job", EntityKind::Subscriptions);
        assert_eq!(skipped.len(), 1);
        assert_eq!(skipped[0].identifying_id, "C2");
        assert_eq!(skipped[0].reason, SkipReason::Referential);
    }

    #[tokio::test]
    async fn test_bulk_failure_falls_back_per_record() {
        let (importer, _, errors) = importer(10);
        let store = MemoryStore::new().fail_batches().fail_id("P2");

        let stats = importer
            .import(
                &store,
                vec![customer("P1"), customer("P2"), customer("P3")],
                None,
                PhaseRange::CUSTOMERS,
            )
            .await
            .unwrap();

        assert_eq!(stats.imported, 2);
        assert_eq!(stats.skipped, 1);
        assert!(store.has_customer("P1"));
        assert!(!store.has_customer("P2"));
        assert!(store.has_customer("P3"));

        let skipped = errors.get("job", EntityKind::Customers);
        assert_eq!(skipped[0].identifying_id, "P2");
        assert_eq!(skipped[0].reason, SkipReason::Persistence);
    }

    #[tokio::test]
    async fn test_empty_input_jumps_to_phase_end() {
        let (importer, progress, _) = importer(10);
        let store = MemoryStore::new();

        let stats = importer
            .import::<CustomerRecord, _>(&store, Vec::new(), None, PhaseRange::CUSTOMERS)
            .await
            .unwrap();

        assert_eq!(stats, EntityStats::default());
        assert_eq!(progress.get("job").percentage, 65);
        assert_eq!(store.batch_calls(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_before_first_chunk() {
        let (importer, _, _) = importer(10);
        importer.cancel.cancel();
        let store = MemoryStore::new();

        let result = importer
            .import(&store, vec![customer("P1")], None, PhaseRange::CUSTOMERS)
            .await;

        assert!(matches!(result, Err(ImportError::Cancelled)));
        assert_eq!(store.customer_count(), 0);
    }

    #[tokio::test]
    async fn test_bulk_timeout_falls_back_to_single_writes() {
        let (importer, _, errors) = importer_with(stalling_config());
        let store = StalledStore::new(&[]);

        let stats = importer
            .import(&store, vec![customer("P1"), customer("P2")], None, PhaseRange::CUSTOMERS)
            .await
            .unwrap();

        assert_eq!(stats.imported, 2);
        assert_eq!(stats.skipped, 0);
        assert!(store.inner.has_customer("P1"));
        assert!(store.inner.has_customer("P2"));
        assert_eq!(errors.count("job", EntityKind::Customers), 0);
    }

    #[tokio::test]
    async fn test_single_write_timeout_is_persistence_skip() {
        let (importer, _, errors) = importer_with(stalling_config());
        let store = StalledStore::new(&["P2"]);

        let stats = importer
            .import(
                &store,
                vec![customer("P1"), customer("P2"), customer("P3")],
                None,
                PhaseRange::CUSTOMERS,
            )
            .await
            .unwrap();

        assert_eq!(stats.imported, 2);
        assert_eq!(stats.skipped, 1);
        assert!(!store.inner.has_customer("P2"));
        assert!(store.inner.has_customer("P3"));

        let skipped = errors.get("job", EntityKind::Customers);
        assert_eq!(skipped.len(), 1);
        assert_eq!(skipped[0].identifying_id, "P2");
        assert_eq!(skipped[0].reason, SkipReason::Persistence);
        assert!(skipped[0].details.contains("timed out"));
    }
}
