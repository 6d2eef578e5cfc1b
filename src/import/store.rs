//! Target store capability used by the batch importer.
//!
//! The importer only needs three things from the store: a bulk upsert for a
//! chunk, a single-record upsert for the fallback path, and the set of parent
//! identifiers already present. [`PgImportStore`](crate::import::postgres::PgImportStore)
//! is the production implementation; tests use
//! [`MemoryStore`](crate::test_support::MemoryStore).

use crate::import::records::{CustomerRecord, ImportRecord, SubscriptionRecord};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("store rejected write: {0}")]
    Rejected(String),
}

/// Idempotent writes for one record type.
#[rocket::async_trait]
pub trait RecordSink<R: ImportRecord>: Send + Sync {
    /// Upsert a whole chunk atomically, keyed by [`ImportRecord::key`].
    ///
    /// Returns the number of records written.
    async fn upsert_batch(&self, records: &[R]) -> Result<u64, StoreError>;

    /// Upsert one record.
    async fn upsert_one(&self, record: &R) -> Result<(), StoreError>;
}

/// Everything an import job writes to or reads from.
#[rocket::async_trait]
pub trait ImportStore: RecordSink<CustomerRecord> + RecordSink<SubscriptionRecord> {
    /// Customer identifiers currently present in the store.
    async fn known_customer_ids(&self) -> Result<HashSet<String>, StoreError>;
}

/// Store handle shared through Rocket state.
pub type SharedImportStore = Arc<dyn ImportStore>;

/// Collapse records sharing a key, keeping the last occurrence in its
/// original position.
pub fn dedupe_by_key<R: ImportRecord>(records: &[R]) -> Vec<&R> {
    let last_index: HashMap<&str, usize> = records
        .iter()
        .enumerate()
        .map(|(idx, record)| (record.key(), idx))
        .collect();

    records
        .iter()
        .enumerate()
        .filter(|(idx, record)| last_index.get(record.key()) == Some(idx))
        .map(|(_, record)| record)
        .collect()
}
