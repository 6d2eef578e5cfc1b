//! Row validation and sanitizing.
//!
//! Validation and sanitizing are driven entirely by the entity's
//! [`EntitySchema`](crate::import::schema::EntitySchema):
//!
//! - **Validation** rejects a row when a required column is absent or an
//!   identifier column contains anything other than `[A-Za-z0-9_-]` or is
//!   longer than its column limit. Every failed check is reported, not just
//!   the first.
//! - **Sanitizing** truncates non-identifier text values longer than their
//!   column limit, appending an ellipsis. Truncation is logged but never
//!   rejects a row.
//!
//! [`prepare_row`] chains mapping, validation, sanitizing and record
//! construction into one per-row outcome.

use crate::import::records::{ImportRecord, SkipReason, SkippedRecord};
use crate::import::sanitize::truncate_with_ellipsis;
use crate::import::schema::{ColumnKind, FieldValue, MappedRow, RowShapeError, map_row};
use regex::Regex;
use std::sync::OnceLock;

static IDENTIFIER: OnceLock<Regex> = OnceLock::new();

fn identifier_regex() -> &'static Regex {
    IDENTIFIER.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("Invalid identifier regex"))
}

/// Whether `value` is a well-formed external identifier.
pub fn is_valid_identifier(value: &str) -> bool {
    identifier_regex().is_match(value)
}

/// Check required and identifier columns.
///
/// # Errors
///
/// Returns one message per failed check.
pub fn validate(row: &MappedRow) -> Result<(), Vec<String>> {
    let mut failures = Vec::new();

    for (column, value) in row.schema.columns.iter().zip(&row.values) {
        if column.kind != ColumnKind::Text {
            continue;
        }
        let text = match value {
            FieldValue::Text(text) => text.as_deref().filter(|t| !t.trim().is_empty()),
            _ => None,
        };

        match text {
            None if column.required => failures.push(format!("{} is required", column.name)),
            Some(text) if column.identifier && !is_valid_identifier(text) => failures.push(format!(
                "{} '{}' has invalid format (allowed: letters, digits, '_' and '-')",
                column.name, text
            )),
            Some(text) if column.identifier => {
                let len = text.chars().count();
                if let Some(limit) = column.max_len.filter(|limit| len > *limit) {
                    failures.push(format!(
                        "{} is {} characters long (maximum {})",
                        column.name, len, limit
                    ));
                }
            }
            _ => {}
        }
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(failures)
    }
}

/// A text value cut down to its column limit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Truncation {
    pub column: &'static str,
    pub original_len: usize,
    pub limit: usize,
}

/// Truncate over-length text values in place.
pub fn sanitize(row: &mut MappedRow) -> Vec<Truncation> {
    let mut truncations = Vec::new();

    for (column, value) in row.schema.columns.iter().zip(row.values.iter_mut()) {
        if column.identifier {
            continue;
        }
        let (Some(limit), FieldValue::Text(Some(text))) = (column.max_len, value) else {
            continue;
        };
        if let Some(truncated) = truncate_with_ellipsis(text, limit) {
            truncations.push(Truncation {
                column: column.name,
                original_len: text.chars().count(),
                limit,
            });
            *text = truncated;
        }
    }

    truncations
}

/// Why a row did not produce a record.
#[derive(Debug, Clone, PartialEq)]
pub enum RowRejection {
    /// Too few values; only logged, never reported as a skipped record.
    Shape(RowShapeError),
    Skipped(SkippedRecord),
}

/// Turn one token list into a typed record.
///
/// Truncations are logged under `job_id`.
///
/// # Errors
///
/// [`RowRejection::Shape`] for short rows, [`RowRejection::Skipped`] with a
/// `validation` reason when any required or identifier check fails.
pub fn prepare_row<R: ImportRecord>(job_id: &str, tokens: &[String]) -> Result<R, RowRejection> {
    let mut row = map_row(R::schema(), tokens).map_err(RowRejection::Shape)?;

    if let Err(failures) = validate(&row) {
        return Err(RowRejection::Skipped(SkippedRecord::new(
            R::ENTITY,
            row.key(),
            SkipReason::Validation,
            &failures.join("; "),
        )));
    }

    for truncation in sanitize(&mut row) {
        log::warn!(
            "job {}: truncated {}.{} for '{}' from {} to {} characters",
            job_id,
            R::ENTITY,
            truncation.column,
            row.key().unwrap_or_default(),
            truncation.original_len,
            truncation.limit
        );
    }

    Ok(R::from_row(row))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::import::records::{CustomerRecord, MISSING_ID, SubscriptionRecord};
    use crate::import::schema::{CUSTOMER_SCHEMA, EntityKind};

    fn customer_tokens(id: &str, name: &str) -> Vec<String> {
        let mut tokens = vec!["NULL".to_string(); 12];
        tokens[0] = "1".into();
        tokens[1] = format!("'{id}'");
        tokens[2] = format!("'{name}'");
        tokens
    }

    fn subscription_tokens(id: &str, customer: &str) -> Vec<String> {
        let mut tokens = vec!["NULL".to_string(); 34];
        tokens[1] = format!("'{id}'");
        tokens[2] = format!("'{customer}'");
        tokens[3] = "'Fiber 20'".into();
        tokens
    }

    #[test]
    fn test_identifier_format() {
        assert!(is_valid_identifier("CUST-001_a"));
        assert!(!is_valid_identifier("CUST 001"));
        assert!(!is_valid_identifier("C1;DROP"));
        assert!(!is_valid_identifier(""));
    }

    #[test]
    fn test_validate_reports_every_failure() {
        let row = map_row(&CUSTOMER_SCHEMA, &customer_tokens("bad id", "")).unwrap();
        let failures = validate(&row).unwrap_err();
        assert_eq!(failures.len(), 2);
        assert!(failures[0].starts_with("customer_id 'bad id' has invalid format"));
        assert_eq!(failures[1], "name is required");
    }

    #[test]
    fn test_sanitize_truncates_to_limit() {
        let long_name = "n".repeat(300);
        let mut row = map_row(&CUSTOMER_SCHEMA, &customer_tokens("P1", &long_name)).unwrap();
        let truncations = sanitize(&mut row);

        assert_eq!(
            truncations,
            vec![Truncation {
                column: "name",
                original_len: 300,
                limit: 255
            }]
        );
        let name = row.text("name").unwrap();
        assert_eq!(name.chars().count(), 255);
        assert!(name.ends_with("..."));
    }

    #[test]
    fn test_prepare_row_builds_record() {
        let record: CustomerRecord = prepare_row("job", &customer_tokens("P1", "O''Brien")).unwrap();
        assert_eq!(record.customer_id, "P1");
        assert_eq!(record.name, "O'Brien");
    }

    #[test]
    fn test_prepare_row_rejects_empty_identifier() {
        let rejection = prepare_row::<SubscriptionRecord>("job", &subscription_tokens("", "P1"))
            .unwrap_err();
        let RowRejection::Skipped(skipped) = rejection else {
            panic!("expected a skipped record");
        };
        assert_eq!(skipped.entity_type, EntityKind::Subscriptions);
        assert_eq!(skipped.reason, SkipReason::Validation);
        assert_eq!(skipped.identifying_id, MISSING_ID);
        assert!(skipped.details.contains("subscription_id is required"));
    }

    #[test]
    fn test_prepare_row_shape_error() {
        let tokens = vec!["'P1'".to_string(), "'Alice'".to_string()];
        assert!(matches!(
            prepare_row::<CustomerRecord>("job", &tokens),
            Err(RowRejection::Shape(_))
        ));
    }

    #[test]
    fn test_validate_rejects_overlong_identifier() {
        let id = format!("{}X", "A".repeat(120));
        let row = map_row(&CUSTOMER_SCHEMA, &customer_tokens(&id, "Alice")).unwrap();
        let failures = validate(&row).unwrap_err();
        assert_eq!(failures, vec!["customer_id is 121 characters long (maximum 100)"]);
    }

    #[test]
    fn test_sanitize_never_truncates_identifiers() {
        let id = "A".repeat(120);
        let mut row = map_row(&CUSTOMER_SCHEMA, &customer_tokens(&id, "Alice")).unwrap();
        assert!(sanitize(&mut row).is_empty());
        assert_eq!(row.key(), Some(id.as_str()));
    }

    #[test]
    fn test_prepare_row_stores_validated_identifier() {
        let record: CustomerRecord = prepare_row("job", &customer_tokens(" P1 ", "Alice")).unwrap();
        assert_eq!(record.customer_id, "P1");
        assert!(is_valid_identifier(&record.customer_id));
    }
}
