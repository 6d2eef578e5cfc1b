//! SQL dump import pipeline.
//!
//! Imports customers and their subscriptions from a dump of `INSERT`
//! statements into the target store:
//!
//! 1. **Extraction** (`extractor`) - finds complete `INSERT INTO <table>` statements
//! 2. **Tokenization** (`tokenizer`) - splits `VALUES` clauses into rows and literal tokens
//! 3. **Mapping** (`schema`, `records`) - positional tokens to typed records
//! 4. **Validation** (`validation`, `sanitize`) - required fields, identifier format, length limits
//! 5. **Commit** (`batch`, `store`, `postgres`) - chunked upserts with per-record fallback
//! 6. **Orchestration** (`job`) - phases, progress (`progress`) and the final result
//!
//! Rows that cannot be imported never abort a job; they are recorded as
//! [`SkippedRecord`]s and reported alongside the counts.
//!
//! # Example Usage
//!
//! ```rust,ignore
//! use import_server::config::ImportConfig;
//! use import_server::import::{ImportJob, ImportServices, PgImportStore};
//!
//! let services = ImportServices::new(ImportConfig::from_env());
//! let store = PgImportStore::new(pool);
//!
//! let result = ImportJob::new("nightly", &store, &services)
//!     .run(&dump_bytes)
//!     .await?;
//!
//! println!("Imported {} customers", result.customers.imported);
//! ```

pub mod batch;
pub mod error;
pub mod extractor;
pub mod job;
pub mod postgres;
pub mod progress;
pub mod records;
pub mod sanitize;
pub mod schema;
pub mod stats;
pub mod store;
pub mod tokenizer;
pub mod validation;

pub use batch::{BatchImporter, PhaseRange};
pub use error::ImportError;
pub use job::{ImportJob, ImportResult, ImportServices, JobRegistry, new_job_id};
pub use postgres::PgImportStore;
pub use progress::{ErrorCollector, ProgressSnapshot, ProgressTracker};
pub use records::{CustomerRecord, ImportRecord, SkipReason, SkippedRecord, SubscriptionRecord};
pub use schema::EntityKind;
pub use stats::EntityImportResult;
pub use store::{ImportStore, RecordSink, SharedImportStore, StoreError};
