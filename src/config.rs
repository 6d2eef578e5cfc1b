use std::env;
use std::time::Duration;

fn env_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .unwrap_or(default)
}

fn env_duration_millis(key: &str, default_millis: u64) -> Duration {
    env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or_else(|| Duration::from_millis(default_millis))
}

fn env_duration_secs(key: &str, default_secs: u64) -> Duration {
    env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or_else(|| Duration::from_secs(default_secs))
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| default.to_string())
}

/// Tuning knobs for import jobs.
#[derive(Debug, Clone)]
pub struct ImportConfig {
    /// Records per bulk upsert.
    pub chunk_size: usize,
    /// Pause between chunks.
    pub chunk_delay: Duration,
    /// Upper bound on a single bulk or per-record store call.
    pub chunk_timeout: Duration,
    /// Retention of progress snapshots and skip logs.
    pub progress_ttl: Duration,
    /// Skipped records returned inline in a result.
    pub skipped_inline_limit: usize,
    /// Skipped records kept per job and entity type.
    pub skipped_retained_limit: usize,
    /// Dump table holding customers.
    pub customer_table: String,
    /// Dump table holding subscriptions.
    pub subscription_table: String,
    /// HTTP body limit for uploaded dumps, in MiB.
    pub max_upload_mb: usize,
}

impl ImportConfig {
    pub fn from_env() -> Self {
        Self {
            chunk_size: env_usize("IMPORT_CHUNK_SIZE", 500).max(1),
            chunk_delay: env_duration_millis("IMPORT_CHUNK_DELAY_MS", 100),
            chunk_timeout: env_duration_millis("IMPORT_CHUNK_TIMEOUT_MS", 300_000),
            progress_ttl: env_duration_secs("IMPORT_PROGRESS_TTL_SECS", 3600),
            skipped_inline_limit: env_usize("IMPORT_SKIPPED_INLINE_LIMIT", 50),
            skipped_retained_limit: env_usize("IMPORT_SKIPPED_RETAINED_LIMIT", 10_000),
            customer_table: env_string("IMPORT_CUSTOMER_TABLE", "customers"),
            subscription_table: env_string("IMPORT_SUBSCRIPTION_TABLE", "subscriptions"),
            max_upload_mb: env_usize("IMPORT_MAX_UPLOAD_MB", 256).max(1),
        }
    }
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self::from_env()
    }
}
