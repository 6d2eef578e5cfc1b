use crate::import::store::StoreError;
use thiserror::Error;

/// Errors that abort an import job.
///
/// Everything recoverable (malformed statements, rejected rows, failed
/// record writes) is handled inside the pipeline; only these reach the caller,
/// after the job's progress has been moved to the failure sentinel.
#[derive(Debug, Error)]
pub enum ImportError {
    #[error("failed to read dump: {0}")]
    Read(#[from] std::io::Error),
    #[error("invalid dump table name `{0}`")]
    InvalidTable(String),
    #[error("failed to load known customer identifiers: {0}")]
    KnownCustomers(#[source] StoreError),
    #[error("import {0} is already running")]
    AlreadyRunning(String),
    #[error("import cancelled")]
    Cancelled,
    #[error("import panicked: {0}")]
    Panicked(String),
}
