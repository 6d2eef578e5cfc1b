//! Text scrubbing for stored values and skip diagnostics.
//!
//! - [`truncate_with_ellipsis`] fits a value into a storage column, marking the cut.
//! - [`scrub_details`] turns raw error text (which may carry connection strings,
//!   credentials or SQL statements from the database driver) into a short,
//!   single-line message safe to hand back to API callers.

use regex::Regex;
use std::sync::OnceLock;

/// Marker appended to truncated values.
pub const ELLIPSIS: &str = "...";

/// Maximum length of a skip diagnostic.
pub const MAX_DETAILS_LEN: usize = 500;

static CONNECTION_STRING: OnceLock<Regex> = OnceLock::new();
static CREDENTIAL: OnceLock<Regex> = OnceLock::new();
static SQL_FRAGMENT: OnceLock<Regex> = OnceLock::new();

fn connection_string_regex() -> &'static Regex {
    CONNECTION_STRING.get_or_init(|| {
        Regex::new(r"(?i)\b(?:postgres(?:ql)?|mysql|mariadb|redis)://\S+")
            .expect("Invalid connection string regex")
    })
}

fn credential_regex() -> &'static Regex {
    CREDENTIAL.get_or_init(|| {
        Regex::new(r"(?i)\b(password|passwd|pwd|secret|token)\s*[=:]\s*\S+")
            .expect("Invalid credential regex")
    })
}

fn sql_fragment_regex() -> &'static Regex {
    SQL_FRAGMENT.get_or_init(|| {
        Regex::new(r"(?is)\b(?:insert\s+into|update\s+\S+\s+set|delete\s+from|select\s.+?\sfrom)\b.*$")
            .expect("Invalid SQL fragment regex")
    })
}

/// Truncate `value` to at most `limit` characters.
///
/// Returns `None` when the value already fits. Otherwise the result is exactly
/// `limit` characters long and ends with [`ELLIPSIS`] (or as much of it as fits
/// when `limit` is shorter than the marker).
pub fn truncate_with_ellipsis(value: &str, limit: usize) -> Option<String> {
    if value.chars().count() <= limit {
        return None;
    }

    let marker_len = ELLIPSIS.chars().count();
    if limit <= marker_len {
        return Some(ELLIPSIS.chars().take(limit).collect());
    }

    let mut truncated: String = value.chars().take(limit - marker_len).collect();
    truncated.push_str(ELLIPSIS);
    Some(truncated)
}

/// Redact credentials and SQL text, collapse whitespace and cap the length.
pub fn scrub_details(raw: &str) -> String {
    let redacted = connection_string_regex().replace_all(raw, "[connection redacted]");
    let redacted = credential_regex().replace_all(&redacted, "$1=[redacted]");
    let stripped = sql_fragment_regex().replace(&redacted, "[sql omitted]");

    let collapsed = stripped.split_whitespace().collect::<Vec<_>>().join(" ");
    truncate_with_ellipsis(&collapsed, MAX_DETAILS_LEN).unwrap_or(collapsed)
}
