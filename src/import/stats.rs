//! Import counters and per-entity results.

use crate::import::records::SkippedRecord;
use rocket_okapi::okapi::schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Counters for one entity type across a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntityStats {
    /// Rows tokenized from the dump.
    pub total: usize,
    /// Records committed to the store.
    pub imported: usize,
    /// Rows recorded as skipped (validation, referential or persistence).
    pub skipped: usize,
    /// Rows dropped before validation because they had too few values.
    pub malformed: usize,
}

impl EntityStats {
    /// Sum another set of counters into this one.
    pub fn merge(&mut self, other: EntityStats) {
        self.total += other.total;
        self.imported += other.imported;
        self.skipped += other.skipped;
        self.malformed += other.malformed;
    }
}

/// Outcome of importing one entity type, as returned to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct EntityImportResult {
    pub imported: usize,
    pub skipped: usize,
    pub total: usize,
    /// The first skipped records, capped at the inline limit.
    pub skipped_records: Vec<SkippedRecord>,
    /// Whether more skipped records exist than `skipped_records` holds.
    pub has_more_skipped: bool,
}

impl EntityImportResult {
    pub fn new(stats: EntityStats, skipped_records: Vec<SkippedRecord>, inline_limit: usize) -> Self {
        Self {
            imported: stats.imported,
            skipped: stats.skipped,
            total: stats.total,
            has_more_skipped: stats.skipped > inline_limit || skipped_records.len() > inline_limit,
            skipped_records: skipped_records.into_iter().take(inline_limit).collect(),
        }
    }
}
