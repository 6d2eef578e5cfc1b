//! Import job orchestration.
//!
//! A job runs strictly in sequence:
//!
//! | progress | phase |
//! |---|---|
//! | 0-10 | start, read and decode the dump |
//! | 15-35 | extract and validate customers, then subscriptions |
//! | 40-65 | commit customers |
//! | 66 | reload the known customer identifiers |
//! | 70-95 | commit subscriptions against that set |
//! | 100 | done |
//!
//! Any fatal error (or cancellation) moves the job to `-1` and is returned to
//! the caller; no partial result is produced.

use crate::config::ImportConfig;
use crate::import::batch::{BatchImporter, PhaseRange};
use crate::import::error::ImportError;
use crate::import::extractor::StatementExtractor;
use crate::import::progress::{ErrorCollector, ProgressSnapshot, ProgressTracker, TtlCache};
use crate::import::records::{CustomerRecord, ImportRecord, SkippedRecord, SubscriptionRecord};
use crate::import::schema::EntityKind;
use crate::import::stats::{EntityImportResult, EntityStats};
use crate::import::store::ImportStore;
use crate::import::tokenizer::parse_value_list;
use crate::import::validation::{RowRejection, prepare_row};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use rocket_okapi::okapi::schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::borrow::Cow;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Result of a finished import.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ImportResult {
    pub progress_id: String,
    pub customers: EntityImportResult,
    pub subscriptions: EntityImportResult,
}

/// Cancellation tokens of the jobs currently running.
#[derive(Clone, Default)]
pub struct JobRegistry {
    running: Arc<DashMap<String, CancellationToken>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `job_id` as running until the returned guard is dropped.
    ///
    /// # Errors
    ///
    /// [`ImportError::AlreadyRunning`] if a job with this id is in progress.
    pub fn register(&self, job_id: &str) -> Result<RunningJob, ImportError> {
        match self.running.entry(job_id.to_string()) {
            Entry::Occupied(_) => Err(ImportError::AlreadyRunning(job_id.to_string())),
            Entry::Vacant(slot) => {
                let token = CancellationToken::new();
                slot.insert(token.clone());
                Ok(RunningJob {
                    registry: self.clone(),
                    job_id: job_id.to_string(),
                    token,
                })
            }
        }
    }

    /// Request cancellation of `job_id`. Returns `false` if it is not running.
    pub fn cancel(&self, job_id: &str) -> bool {
        match self.running.get(job_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self, job_id: &str) -> bool {
        self.running.contains_key(job_id)
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }
}

/// Registration of a running job; deregisters on drop.
pub struct RunningJob {
    registry: JobRegistry,
    job_id: String,
    token: CancellationToken,
}

impl RunningJob {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for RunningJob {
    fn drop(&mut self) {
        self.registry.running.remove(&self.job_id);
    }
}

/// Shared state used by every job: progress, skip logs, running jobs and
/// configuration.
#[derive(Clone)]
pub struct ImportServices {
    pub progress: ProgressTracker,
    pub errors: ErrorCollector,
    pub registry: JobRegistry,
    pub config: ImportConfig,
}

impl ImportServices {
    /// Services backed by in-process TTL caches.
    pub fn new(config: ImportConfig) -> Self {
        let progress = ProgressTracker::new(Arc::new(TtlCache::<ProgressSnapshot>::new(
            config.progress_ttl,
        )));
        let errors = ErrorCollector::new(
            Arc::new(TtlCache::<Vec<SkippedRecord>>::new(config.progress_ttl)),
            config.skipped_retained_limit,
        );

        Self {
            progress,
            errors,
            registry: JobRegistry::new(),
            config,
        }
    }

    /// Drop expired progress and skip-log entries.
    pub fn purge_expired(&self) -> usize {
        self.progress.purge_expired() + self.errors.purge_expired()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Fresh random job id.
pub fn new_job_id() -> String {
    Uuid::new_v4().to_string()
}

/// One import run against a store.
pub struct ImportJob<'a, S: ImportStore + ?Sized> {
    job_id: String,
    store: &'a S,
    services: &'a ImportServices,
}

impl<'a, S: ImportStore + ?Sized> ImportJob<'a, S> {
    pub fn new(job_id: impl Into<String>, store: &'a S, services: &'a ImportServices) -> Self {
        Self {
            job_id: job_id.into(),
            store,
            services,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Import `dump` and return per-entity results.
    ///
    /// # Errors
    ///
    /// [`ImportError::AlreadyRunning`] is returned without touching the
    /// running job's progress. Every other error leaves the job at `-1`,
    /// including a panic inside the pipeline, which surfaces as
    /// [`ImportError::Panicked`].
    pub async fn run(&self, dump: &[u8]) -> Result<ImportResult, ImportError> {
        let running = self.services.registry.register(&self.job_id)?;
        let progress = &self.services.progress;

        progress.start(&self.job_id, "Starting import");
        self.services.errors.clear(&self.job_id);
        log::info!("job {}: import started ({} bytes)", self.job_id, dump.len());

        let outcome = AssertUnwindSafe(self.execute(dump, running.token()))
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| Err(ImportError::Panicked(panic_message(&*payload))));

        match outcome {
            Ok(result) => {
                progress.complete(
                    &self.job_id,
                    &format!(
                        "Import complete: {} customers and {} subscriptions imported, {} skipped",
                        result.customers.imported,
                        result.subscriptions.imported,
                        result.customers.skipped + result.subscriptions.skipped
                    ),
                );
                log::info!(
                    "job {}: import complete: customers {}/{} imported, subscriptions {}/{} imported",
                    self.job_id,
                    result.customers.imported,
                    result.customers.total,
                    result.subscriptions.imported,
                    result.subscriptions.total
                );
                Ok(result)
            }
            Err(ImportError::Cancelled) => {
                log::warn!("job {}: import cancelled", self.job_id);
                progress.fail(&self.job_id, "Import cancelled");
                Err(ImportError::Cancelled)
            }
            Err(err) => {
                log::error!("job {}: import failed: {}", self.job_id, err);
                progress.fail(&self.job_id, &format!("Import failed: {err}"));
                Err(err)
            }
        }
    }

    async fn execute(
        &self,
        dump: &[u8],
        cancel: &CancellationToken,
    ) -> Result<ImportResult, ImportError> {
        let config = &self.services.config;
        let progress = &self.services.progress;

        progress.update(&self.job_id, 5, "Reading dump");
        let text = self.decode(dump);
        progress.update(
            &self.job_id,
            10,
            &format!("Read {} lines", text.lines().count()),
        );

        let customer_extractor = StatementExtractor::new(&config.customer_table)?;
        let subscription_extractor = StatementExtractor::new(&config.subscription_table)?;

        progress.update(&self.job_id, 15, "Parsing customers");
        let (customers, mut customer_stats) =
            self.parse::<CustomerRecord>(&customer_extractor, &text);
        progress.update(
            &self.job_id,
            20,
            &format!("Parsed {} customers, parsing subscriptions", customers.len()),
        );

        let (subscriptions, mut subscription_stats) =
            self.parse::<SubscriptionRecord>(&subscription_extractor, &text);
        progress.update(
            &self.job_id,
            35,
            &format!("Parsed {} subscriptions", subscriptions.len()),
        );
        drop(text);

        if cancel.is_cancelled() {
            return Err(ImportError::Cancelled);
        }

        let importer = BatchImporter::new(
            self.job_id.clone(),
            config.clone(),
            progress.clone(),
            self.services.errors.clone(),
            cancel.clone(),
        );

        let committed = importer
            .import(self.store, customers, None, PhaseRange::CUSTOMERS)
            .await?;
        customer_stats.merge(committed);

        if cancel.is_cancelled() {
            return Err(ImportError::Cancelled);
        }
        progress.update(&self.job_id, 66, "Loading known customers");
        self.services.errors.touch(&self.job_id);
        let known = self
            .store
            .known_customer_ids()
            .await
            .map_err(ImportError::KnownCustomers)?;
        log::debug!("job {}: {} known customers", self.job_id, known.len());

        let committed = importer
            .import(
                self.store,
                subscriptions,
                Some(&known),
                PhaseRange::SUBSCRIPTIONS,
            )
            .await?;
        subscription_stats.merge(committed);

        Ok(ImportResult {
            progress_id: self.job_id.clone(),
            customers: self.entity_result(EntityKind::Customers, customer_stats),
            subscriptions: self.entity_result(EntityKind::Subscriptions, subscription_stats),
        })
    }

    fn decode<'d>(&self, dump: &'d [u8]) -> Cow<'d, str> {
        let text = String::from_utf8_lossy(dump);
        if let Cow::Owned(_) = text {
            log::warn!(
                "job {}: dump is not valid UTF-8, invalid sequences were replaced",
                self.job_id
            );
        }
        text
    }

    /// Extract, tokenize, map and validate every row of `R`'s table.
    ///
    /// Validation failures are recorded as skipped records; short rows and
    /// rows that fail to tokenize are only logged.
    fn parse<R: ImportRecord>(
        &self,
        extractor: &StatementExtractor,
        dump: &str,
    ) -> (Vec<R>, EntityStats) {
        let extraction = extractor.extract(dump);
        if extraction.dropped > 0 {
            log::warn!(
                "job {}: dropped {} incomplete `{}` statement(s)",
                self.job_id,
                extraction.dropped,
                extractor.table()
            );
        }

        let mut records = Vec::new();
        let mut stats = EntityStats::default();

        for statement in &extraction.statements {
            for row in parse_value_list(&statement.values) {
                let tokens = match row {
                    Ok(tokens) => tokens,
                    Err(err) => {
                        log::warn!(
                            "job {}: dropping unparseable `{}` row in statement at line {}: {}",
                            self.job_id,
                            extractor.table(),
                            statement.line,
                            err
                        );
                        continue;
                    }
                };
                stats.total += 1;

                match prepare_row::<R>(&self.job_id, &tokens) {
                    Ok(record) => records.push(record),
                    Err(RowRejection::Shape(err)) => {
                        log::debug!(
                            "job {}: ignoring row in statement at line {}: {}",
                            self.job_id,
                            statement.line,
                            err
                        );
                        stats.malformed += 1;
                    }
                    Err(RowRejection::Skipped(skipped)) => {
                        log::debug!(
                            "job {}: {} '{}' failed validation: {}",
                            self.job_id,
                            R::ENTITY,
                            skipped.identifying_id,
                            skipped.details
                        );
                        self.services.errors.record(&self.job_id, R::ENTITY, skipped);
                        stats.skipped += 1;
                    }
                }
            }
        }

        log::info!(
            "job {}: parsed {} {} rows from {} statement(s): {} valid, {} invalid, {} malformed",
            self.job_id,
            stats.total,
            R::ENTITY,
            extraction.statements.len(),
            records.len(),
            stats.skipped,
            stats.malformed
        );
        (records, stats)
    }

    fn entity_result(&self, entity: EntityKind, stats: EntityStats) -> EntityImportResult {
        let limit = self.services.config.skipped_inline_limit;
        let (skipped_records, has_more) = self.services.errors.first(&self.job_id, entity, limit);
        let mut result = EntityImportResult::new(stats, skipped_records, limit);
        result.has_more_skipped |= has_more;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::import::progress::PROGRESS_FAILED;
    use crate::import::records::SkipReason;
    use crate::import::store::{RecordSink, StoreError};
    use crate::test_support::MemoryStore;
    use std::collections::HashSet;
    use std::time::Duration;

    /// Store whose writes panic, as a broken driver would.
    struct PanickingStore;

    #[rocket::async_trait]
    impl RecordSink<CustomerRecord> for PanickingStore {
        async fn upsert_batch(&self, _records: &[CustomerRecord]) -> Result<u64, StoreError> {
            panic!("customer pool poisoned");
        }

        async fn upsert_one(&self, _record: &CustomerRecord) -> Result<(), StoreError> {
            panic!("customer pool poisoned");
        }
    }

    #[rocket::async_trait]
    impl RecordSink<SubscriptionRecord> for PanickingStore {
        async fn upsert_batch(&self, _records: &[SubscriptionRecord]) -> Result<u64, StoreError> {
            panic!("subscription pool poisoned");
        }

        async fn upsert_one(&self, _record: &SubscriptionRecord) -> Result<(), StoreError> {
            panic!("subscription pool poisoned");
        }
    }

    #[rocket::async_trait]
    impl ImportStore for PanickingStore {
        async fn known_customer_ids(&self) -> Result<HashSet<String>, StoreError> {
            Ok(HashSet::new())
        }
    }

    fn services() -> ImportServices {
        ImportServices::new(ImportConfig {
            chunk_size: 2,
            chunk_delay: Duration::ZERO,
            chunk_timeout: Duration::from_secs(5),
            progress_ttl: Duration::from_secs(60),
            skipped_inline_limit: 1,
            skipped_retained_limit: 100,
            customer_table: "customers".into(),
            subscription_table: "subscriptions".into(),
            max_upload_mb: 1,
        })
    }

    fn subscription_row(id: &str, customer: &str) -> String {
        let mut values = vec!["NULL".to_string(); 34];
        values[0] = "1".into();
        values[1] = format!("'{id}'");
        values[2] = format!("'{customer}'");
        values[3] = "'Fiber 20M'".into();
        format!("({})", values.join(","))
    }

    #[test]
    fn test_registry_rejects_duplicate_job() {
        let registry = JobRegistry::new();
        let guard = registry.register("job").unwrap();
        assert!(matches!(
            registry.register("job"),
            Err(ImportError::AlreadyRunning(_))
        ));
        assert!(registry.cancel("job"));
        assert!(guard.token().is_cancelled());

        drop(guard);
        assert!(!registry.is_running("job"));
        assert!(!registry.cancel("job"));
    }

    #[tokio::test]
    async fn test_inline_skips_are_capped() {
        let services = services();
        let store = MemoryStore::new();
        let dump = format!(
            "INSERT INTO subscriptions VALUES {},{},{};\n",
            subscription_row("C1", "P9"),
            subscription_row("C2", "P9"),
            subscription_row("", "P9"),
        );

        let result = ImportJob::new("job", &store, &services)
            .run(dump.as_bytes())
            .await
            .unwrap();

        assert_eq!(result.subscriptions.total, 3);
        assert_eq!(result.subscriptions.skipped, 3);
        assert_eq!(result.subscriptions.skipped_records.len(), 1);
        assert_eq!(result.subscriptions.skipped_records[0].reason, SkipReason::Validation);
        assert!(result.subscriptions.has_more_skipped);
        assert_eq!(services.errors.count("job", EntityKind::Subscriptions), 3);
    }

    #[tokio::test]
    async fn test_invalid_table_fails_job() {
        let mut services = services();
        services.config.customer_table = "customers; DROP".into();
        let store = MemoryStore::new();

        let err = ImportJob::new("job", &store, &services)
            .run(b"")
            .await
            .unwrap_err();

        assert!(matches!(err, ImportError::InvalidTable(_)));
        assert_eq!(services.progress.get("job").percentage, PROGRESS_FAILED);
        assert!(!services.registry.is_running("job"));
    }

    #[tokio::test]
    async fn test_known_customer_failure_is_fatal() {
        let services = services();
        let store = MemoryStore::new().fail_known_ids();

        let err = ImportJob::new("job", &store, &services)
            .run(b"")
            .await
            .unwrap_err();

        assert!(matches!(err, ImportError::KnownCustomers(_)));
        let snapshot = services.progress.get("job");
        assert_eq!(snapshot.percentage, PROGRESS_FAILED);
        assert!(snapshot.message.starts_with("Import failed"));
    }

    #[tokio::test]
    async fn test_invalid_utf8_is_decoded_lossily() {
        let services = services();
        let store = MemoryStore::new();
        let mut dump = b"INSERT INTO customers VALUES (1,'P1','Al\xffce',NULL,NULL,NULL,NULL,NULL,NULL,NULL,NULL,NULL);\n".to_vec();
        dump.extend_from_slice(b"-- end\n");

        let result = ImportJob::new("job", &store, &services)
            .run(&dump)
            .await
            .unwrap();

        assert_eq!(result.customers.imported, 1);
        assert!(store.has_customer("P1"));
    }

    #[tokio::test]
    async fn test_store_panic_fails_job() {
        let services = services();
        let dump = "INSERT INTO customers VALUES (1,'P1','Alice',NULL,NULL,NULL,NULL,NULL,NULL,NULL,NULL,NULL);\n";

        let err = ImportJob::new("job", &PanickingStore, &services)
            .run(dump.as_bytes())
            .await
            .unwrap_err();

        match err {
            ImportError::Panicked(message) => assert_eq!(message, "customer pool poisoned"),
            other => panic!("expected a panic error, got {other:?}"),
        }
        let snapshot = services.progress.get("job");
        assert_eq!(snapshot.percentage, PROGRESS_FAILED);
        assert!(snapshot.message.contains("customer pool poisoned"));
        assert!(!services.registry.is_running("job"));
    }
}
