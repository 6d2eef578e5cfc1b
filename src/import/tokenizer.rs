//! SQL literal tokenization for `VALUES` clauses.
//!
//! Two layers live here:
//!
//! - **Value-list splitting** (`split_rows`): cuts the text following a
//!   statement's `VALUES` keyword into the bodies of its `( ... )` tuples.
//! - **Field tokenization** (`tokenize_row`): splits one tuple body into raw
//!   literal tokens, leaving quote characters in place.
//!
//! Both scanners share the same quoting rules:
//!
//! - `'` or `"` outside a string opens a string closed by the same character
//! - a backslash escapes the character that follows it (`\'`, `\\`, `\n`, ...)
//! - a doubled closing quote (`''` inside `'...'`) is an escaped quote
//!
//! Raw tokens are decoded into values with [`unquote_literal`].

use thiserror::Error;

/// Failure to split or tokenize a value list.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenizeError {
    #[error("unterminated {quote} quote opened at offset {offset}")]
    UnterminatedQuote { quote: char, offset: usize },
    #[error("unbalanced parenthesis at offset {offset}")]
    UnbalancedParenthesis { offset: usize },
}

/// Tracks whether a scanner is inside a quoted literal.
///
/// Returns how many characters the caller should consume for the current
/// position: 2 for escape pairs and doubled quotes, otherwise 1.
#[derive(Debug, Default)]
struct QuoteState {
    open: Option<(char, usize)>,
}

impl QuoteState {
    fn inside(&self) -> bool {
        self.open.is_some()
    }

    fn step(&mut self, chars: &[char], i: usize, offset: usize) -> usize {
        let c = chars[i];
        match self.open {
            Some((quote, _)) => {
                if c == '\\' && i + 1 < chars.len() {
                    return 2;
                }
                if c == quote {
                    if chars.get(i + 1) == Some(&quote) {
                        return 2;
                    }
                    self.open = None;
                }
                1
            }
            None => {
                if c == '\'' || c == '"' {
                    self.open = Some((c, offset));
                }
                1
            }
        }
    }

    fn finish(&self) -> Result<(), TokenizeError> {
        match self.open {
            Some((quote, offset)) => Err(TokenizeError::UnterminatedQuote { quote, offset }),
            None => Ok(()),
        }
    }
}

/// Split one row (the text between its enclosing parentheses) into raw tokens.
///
/// Tokens keep their surrounding quotes and escape sequences; whitespace
/// outside quotes at either end of a token is trimmed. An empty or
/// whitespace-only row yields no tokens.
///
/// # Errors
///
/// [`TokenizeError::UnterminatedQuote`] when a string literal never closes.
pub fn tokenize_row(row: &str) -> Result<Vec<String>, TokenizeError> {
    if row.trim().is_empty() {
        return Ok(Vec::new());
    }

    let chars: Vec<char> = row.chars().collect();
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quotes = QuoteState::default();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        if !quotes.inside() && c == ',' {
            tokens.push(current.trim().to_string());
            current.clear();
            i += 1;
            continue;
        }

        let consumed = quotes.step(&chars, i, i);
        current.extend(&chars[i..i + consumed]);
        i += consumed;
    }

    quotes.finish()?;
    tokens.push(current.trim().to_string());

    Ok(tokens)
}

/// Split a `VALUES` clause into the bodies of its tuples.
///
/// `(1,'a'),(2,'b')` yields `["1,'a'", "2,'b'"]`. Parentheses inside string
/// literals, and nested parentheses such as `NOW()`, do not end a tuple.
/// Commas and whitespace between tuples are ignored.
///
/// Each entry is either the raw tuple body or the error that stopped the
/// scan at that point; an unterminated literal consumes the rest of the clause.
pub fn split_rows(values: &str) -> Vec<Result<&str, TokenizeError>> {
    let indexed: Vec<(usize, char)> = values.char_indices().collect();
    let chars: Vec<char> = indexed.iter().map(|(_, c)| *c).collect();

    let mut rows = Vec::new();
    let mut quotes = QuoteState::default();
    let mut depth = 0usize;
    let mut row_start = 0usize;
    let mut i = 0;

    while i < chars.len() {
        let (offset, c) = indexed[i];

        if quotes.inside() {
            i += quotes.step(&chars, i, offset);
            continue;
        }

        match c {
            '(' => {
                if depth == 0 {
                    row_start = offset + 1;
                }
                depth += 1;
            }
            ')' => {
                if depth == 0 {
                    rows.push(Err(TokenizeError::UnbalancedParenthesis { offset }));
                } else {
                    depth -= 1;
                    if depth == 0 {
                        rows.push(Ok(&values[row_start..offset]));
                    }
                }
            }
            '\'' | '"' if depth > 0 => {
                quotes.step(&chars, i, offset);
            }
            _ => {}
        }
        i += 1;
    }

    if let Err(err) = quotes.finish() {
        rows.push(Err(err));
    } else if depth > 0 {
        rows.push(Err(TokenizeError::UnbalancedParenthesis {
            offset: row_start.saturating_sub(1),
        }));
    }

    rows
}

/// Split a full `VALUES` clause into token lists, one per well-formed row.
///
/// Rows that fail to split or tokenize are returned as errors in place so
/// the caller can report them and continue with the remaining rows.
pub fn parse_value_list(values: &str) -> Vec<Result<Vec<String>, TokenizeError>> {
    split_rows(values)
        .into_iter()
        .map(|row| row.and_then(tokenize_row))
        .collect()
}

/// Decode a raw token into its literal value.
///
/// - `NULL` (any case) and empty input map to `None`
/// - one layer of matching `'` or `"` quotes is stripped and escapes decoded
/// - an empty string literal maps to `None`
/// - unquoted tokens (numbers, keywords) are returned as-is
pub fn unquote_literal(token: &str) -> Option<String> {
    let token = token.trim();
    if token.is_empty() || token.eq_ignore_ascii_case("NULL") {
        return None;
    }

    let first = token.chars().next()?;
    let decoded = if (first == '\'' || first == '"') && token.len() >= 2 && token.ends_with(first)
    {
        unescape(&token[1..token.len() - 1], first)
    } else {
        token.to_string()
    };

    if decoded.is_empty() {
        None
    } else {
        Some(decoded)
    }
}

fn unescape(inner: &str, quote: char) -> String {
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some('n') => out.push('\n'),
                Some('r') => out.push('\r'),
                Some('t') => out.push('\t'),
                Some('0') => out.push('\0'),
                Some('Z') => out.push('\x1a'),
                Some(other) => out.push(other),
                None => out.push('\\'),
            },
            c if c == quote && chars.peek() == Some(&quote) => {
                chars.next();
                out.push(quote);
            }
            c => out.push(c),
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_simple_row() {
        let tokens = tokenize_row("1, 'P1', 'Alice', NULL").unwrap();
        assert_eq!(tokens, vec!["1", "'P1'", "'Alice'", "NULL"]);
    }

    #[test]
    fn test_tokenize_empty_row() {
        assert!(tokenize_row("").unwrap().is_empty());
        assert!(tokenize_row("   ").unwrap().is_empty());
    }

    #[test]
    fn test_tokenize_keeps_trailing_token() {
        assert_eq!(tokenize_row("'a',2").unwrap(), vec!["'a'", "2"]);
        assert_eq!(tokenize_row("'a',").unwrap(), vec!["'a'", ""]);
    }

    #[test]
    fn test_tokenize_commas_inside_quotes() {
        let tokens = tokenize_row("'Jl. Merdeka, No. 5', \"x,y\"").unwrap();
        assert_eq!(tokens, vec!["'Jl. Merdeka, No. 5'", "\"x,y\""]);
    }

    #[test]
    fn test_tokenize_escaped_quotes() {
        let tokens = tokenize_row(r"'O''Brien', 'it\'s', 'back\\'").unwrap();
        assert_eq!(tokens, vec!["'O''Brien'", r"'it\'s'", r"'back\\'"]);
    }

    #[test]
    fn test_tokenize_unterminated_quote_fails() {
        let err = tokenize_row("1, 'open").unwrap_err();
        assert_eq!(
            err,
            TokenizeError::UnterminatedQuote {
                quote: '\'',
                offset: 3
            }
        );
    }

    #[test]
    fn test_unquote_literal_recovers_content() {
        assert_eq!(unquote_literal("'O''Brien'"), Some("O'Brien".to_string()));
        assert_eq!(unquote_literal(r"'it\'s'"), Some("it's".to_string()));
        assert_eq!(unquote_literal(r#""say \"hi\"""#), Some("say \"hi\"".to_string()));
        assert_eq!(unquote_literal(r"'a\\b'"), Some(r"a\b".to_string()));
        assert_eq!(unquote_literal(r"'line\nbreak'"), Some("line\nbreak".to_string()));
        assert_eq!(unquote_literal("42"), Some("42".to_string()));
    }

    #[test]
    fn test_unquote_literal_absent_values() {
        assert_eq!(unquote_literal("NULL"), None);
        assert_eq!(unquote_literal("null"), None);
        assert_eq!(unquote_literal("''"), None);
        assert_eq!(unquote_literal(""), None);
    }

    #[test]
    fn test_escaped_literals_survive_tokenize_then_unquote() {
        let originals = ["O'Brien", "it's \"quoted\"", r"C:\temp\", "a),(b", "''"];
        for original in originals {
            let escaped = original.replace('\\', r"\\").replace('\'', "''");
            let row = format!("1,'{escaped}',2");
            let tokens = tokenize_row(&row).unwrap();
            assert_eq!(tokens.len(), 3, "row {row}");
            assert_eq!(unquote_literal(&tokens[1]).as_deref(), Some(original));
        }
    }

    #[test]
    fn test_split_rows_basic() {
        let rows = split_rows("(1,'a'),(2,'b'),\n(3,'c')");
        let rows: Vec<&str> = rows.into_iter().map(Result::unwrap).collect();
        assert_eq!(rows, vec!["1,'a'", "2,'b'", "3,'c'"]);
    }

    #[test]
    fn test_split_rows_ignores_boundaries_inside_literals() {
        let rows = split_rows("(1,'x),(y'),(2,NOW())");
        let rows: Vec<&str> = rows.into_iter().map(Result::unwrap).collect();
        assert_eq!(rows, vec!["1,'x),(y'", "2,NOW()"]);
    }

    #[test]
    fn test_split_rows_reports_unterminated_literal() {
        let rows = split_rows("(1,'ok'),(2,'broken)");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0], Ok("1,'ok'"));
        assert!(matches!(
            rows[1],
            Err(TokenizeError::UnterminatedQuote { quote: '\'', .. })
        ));
    }

    #[test]
    fn test_parse_value_list() {
        let rows = parse_value_list("(1,'P1','Alice'),(2,'P2','Bob')");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].as_ref().unwrap(), &vec!["2", "'P2'", "'Bob'"]);
    }
}
