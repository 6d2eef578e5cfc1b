//! Locates `INSERT INTO <table> ... VALUES ...;` statements in a dump.
//!
//! The dump is scanned line by line. A statement starts on a line that begins
//! with `INSERT INTO <table>` (case-insensitive, with optional backtick or
//! double-quote identifier quoting and an optional schema prefix) and ends on
//! the first line whose trimmed content ends with `;`. Continuation lines are
//! joined with a single space.
//!
//! Statements for other tables are ignored. A statement that never terminates,
//! is interrupted by another `INSERT`, or has no `VALUES` keyword is dropped
//! with a warning; the rest of the dump is still processed.

use crate::import::error::ImportError;
use regex::Regex;
use std::sync::OnceLock;

static ANY_INSERT: OnceLock<Regex> = OnceLock::new();
static VALUES_KEYWORD: OnceLock<Regex> = OnceLock::new();

fn any_insert_regex() -> &'static Regex {
    ANY_INSERT.get_or_init(|| Regex::new(r"(?i)^\s*INSERT\s").expect("Invalid insert regex"))
}

fn values_regex() -> &'static Regex {
    VALUES_KEYWORD.get_or_init(|| Regex::new(r"(?i)\bVALUES\b").expect("Invalid values regex"))
}

/// The `VALUES` clause of one complete statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    /// 1-based line number where the statement started.
    pub line: usize,
    /// Text between the `VALUES` keyword and the terminating `;`.
    pub values: String,
}

/// Outcome of scanning a dump for one table.
#[derive(Debug, Default)]
pub struct Extraction {
    pub statements: Vec<Statement>,
    /// Statements that were started but could not be completed.
    pub dropped: usize,
}

/// Extracts `VALUES` clauses for a single target table.
pub struct StatementExtractor {
    table: String,
    start: Regex,
}

struct Pending {
    line: usize,
    text: String,
}

impl StatementExtractor {
    /// Build an extractor for `table`.
    ///
    /// # Errors
    ///
    /// [`ImportError::InvalidTable`] when the name contains anything other than
    /// letters, digits and underscores.
    pub fn new(table: &str) -> Result<Self, ImportError> {
        if table.is_empty() || !table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(ImportError::InvalidTable(table.to_string()));
        }

        let pattern = format!(
            r#"(?i)^\s*INSERT\s+(?:IGNORE\s+)?INTO\s+(?:[`"]?\w+[`"]?\.)?[`"]?{}[`"]?(?:\s|\(|$)"#,
            regex::escape(table)
        );
        let start = Regex::new(&pattern).map_err(|_| ImportError::InvalidTable(table.to_string()))?;

        Ok(Self {
            table: table.to_string(),
            start,
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Scan `dump` and return every complete `VALUES` clause for this table.
    pub fn extract(&self, dump: &str) -> Extraction {
        let mut extraction = Extraction::default();
        let mut pending: Option<Pending> = None;

        for (index, line) in dump.lines().enumerate() {
            let line_no = index + 1;

            if pending.is_some() && any_insert_regex().is_match(line) {
                if let Some(stale) = pending.take() {
                    log::warn!(
                        "dropping unterminated `{}` statement starting at line {}: interrupted by a new INSERT at line {}",
                        self.table,
                        stale.line,
                        line_no
                    );
                    extraction.dropped += 1;
                }
            }

            match pending.as_mut() {
                Some(current) => {
                    current.text.push(' ');
                    current.text.push_str(line.trim());
                }
                None => {
                    if !self.start.is_match(line) {
                        continue;
                    }
                    pending = Some(Pending {
                        line: line_no,
                        text: line.trim().to_string(),
                    });
                }
            }

            if line.trim_end().ends_with(';') {
                if let Some(done) = pending.take() {
                    match self.values_clause(&done.text) {
                        Some(values) => extraction.statements.push(Statement {
                            line: done.line,
                            values,
                        }),
                        None => {
                            log::warn!(
                                "dropping `{}` statement at line {}: no VALUES clause found",
                                self.table,
                                done.line
                            );
                            extraction.dropped += 1;
                        }
                    }
                }
            }
        }

        if let Some(stale) = pending {
            log::warn!(
                "dropping unterminated `{}` statement starting at line {}: reached end of dump",
                self.table,
                stale.line
            );
            extraction.dropped += 1;
        }

        extraction
    }

    fn values_clause(&self, statement: &str) -> Option<String> {
        let keyword = values_regex().find(statement)?;
        let body = statement[keyword.end()..].trim_end();
        let body = body.strip_suffix(';').unwrap_or(body).trim();
        if body.is_empty() {
            None
        } else {
            Some(body.to_string())
        }
    }
}
