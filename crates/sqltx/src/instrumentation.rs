//! Tracing instrumentation for transactional work.
//!
//! Span names used by the manager, plus the SQL sanitizer applied before a
//! statement reaches a log line. Literal values are masked; positional
//! placeholders (`$1`, `$2`, ...) are kept so a logged statement still lines
//! up with its parameter list.
//!
//! ## Spans
//!
//! - `sqltx.transaction`: one `execute_transaction` call, retries included
//! - `sqltx.optimistic_lock`: one versioned update
//! - `sqltx.distributed_lock`: one locked region
//! - `sqltx.batch`: one `execute_batch` call

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

/// Span names for manager operations.
pub mod span_names {
    /// Span for a transaction, across retries.
    pub const TRANSACTION: &str = "sqltx.transaction";
    /// Span for a versioned update.
    pub const OPTIMISTIC_LOCK: &str = "sqltx.optimistic_lock";
    /// Span for a region guarded by an advisory lock.
    pub const DISTRIBUTED_LOCK: &str = "sqltx.distributed_lock";
    /// Span for a chunked batch.
    pub const BATCH: &str = "sqltx.batch";
}

/// Positional placeholders, quoted strings (`''` escapes, possibly
/// unterminated) and standalone numbers, in that priority.
#[allow(clippy::expect_used)]
static LITERAL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?P<param>\$\d+)|'(?:[^']|'')*'?|\b\d+(?:\.\d+)?\b").expect("valid literal pattern")
});

const ELLIPSIS: &str = "...";

/// How statements are rendered into logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SanitizationConfig {
    /// Mask literal values.
    pub enabled: bool,
    /// Longest statement recorded, in bytes; longer ones are cut with `...`.
    pub max_length: usize,
    /// Replacement for each masked literal.
    pub placeholder: String,
}

impl Default for SanitizationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_length: 2048,
            placeholder: "?".to_string(),
        }
    }
}

impl SanitizationConfig {
    /// Log statements verbatim and uncut.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            max_length: usize::MAX,
            placeholder: String::new(),
        }
    }

    /// Render `sql` for a log line.
    #[must_use]
    pub fn sanitize(&self, sql: &str) -> String {
        let rendered = if self.enabled {
            mask_literals(sql, &self.placeholder)
        } else {
            sql.to_string()
        };
        truncate(rendered, self.max_length)
    }
}

fn mask_literals(sql: &str, placeholder: &str) -> String {
    LITERAL_RE
        .replace_all(sql, |caps: &Captures<'_>| match caps.name("param") {
            Some(param) => param.as_str().to_string(),
            None => placeholder.to_string(),
        })
        .into_owned()
}

/// Cut to at most `max_len` bytes on a character boundary, marking the cut.
fn truncate(s: String, max_len: usize) -> String {
    if s.len() <= max_len {
        return s;
    }
    let budget = max_len.saturating_sub(ELLIPSIS.len());
    let end = s
        .char_indices()
        .map(|(i, _)| i)
        .take_while(|&i| i <= budget)
        .last()
        .unwrap_or(0);
    format!("{}{ELLIPSIS}", &s[..end])
}

/// Leading keyword of a statement, normalized for span fields.
#[must_use]
pub fn extract_operation(sql: &str) -> &'static str {
    let keyword: String = sql
        .trim_start()
        .chars()
        .take_while(char::is_ascii_alphabetic)
        .map(|c| c.to_ascii_uppercase())
        .collect();

    match keyword.as_str() {
        "SELECT" | "WITH" => "SELECT",
        "INSERT" => "INSERT",
        "UPDATE" => "UPDATE",
        "DELETE" => "DELETE",
        "MERGE" | "UPSERT" => "MERGE",
        "CALL" | "EXEC" | "EXECUTE" => "CALL",
        "CREATE" => "CREATE",
        "ALTER" => "ALTER",
        "DROP" | "TRUNCATE" => "DROP",
        _ => "OTHER",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn masked(sql: &str) -> String {
        mask_literals(sql, "?")
    }

    #[test]
    fn test_extract_operation() {
        assert_eq!(extract_operation("  select id from users"), "SELECT");
        assert_eq!(extract_operation("WITH x AS (SELECT 1) SELECT * FROM x"), "SELECT");
        assert_eq!(extract_operation("INSERT INTO users VALUES ($1)"), "INSERT");
        assert_eq!(extract_operation("update users set name = $1"), "UPDATE");
        assert_eq!(extract_operation("CALL refresh_totals()"), "CALL");
        assert_eq!(extract_operation("TRUNCATE audit"), "DROP");
        assert_eq!(extract_operation("VACUUM"), "OTHER");
        assert_eq!(extract_operation(""), "OTHER");
    }

    #[test]
    fn test_string_literals_masked() {
        assert_eq!(
            masked("SELECT * FROM users WHERE name = 'Alice'"),
            "SELECT * FROM users WHERE name = ?"
        );
        assert_eq!(
            masked("INSERT INTO t VALUES ('a', 'b')"),
            "INSERT INTO t VALUES (?, ?)"
        );
        assert_eq!(masked("WHERE name = 'O''Brien'"), "WHERE name = ?");
        assert_eq!(masked("WHERE name = 'unterminated"), "WHERE name = ?");
    }

    #[test]
    fn test_numbers_masked_but_not_identifiers() {
        assert_eq!(
            masked("SELECT col1 FROM t2 WHERE id = 42 AND score > 9.5"),
            "SELECT col1 FROM t2 WHERE id = ? AND score > ?"
        );
    }

    #[test]
    fn test_placeholders_survive() {
        assert_eq!(
            masked("UPDATE t SET a = $1, b = 5 WHERE id = $12"),
            "UPDATE t SET a = $1, b = ? WHERE id = $12"
        );
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("hello".into(), 10), "hello");
        assert_eq!(truncate("hello world".into(), 8), "hello...");
        assert_eq!(truncate("ééééé".into(), 6), "é...");
    }

    #[test]
    fn test_disabled_logs_verbatim() {
        let sql = "SELECT * FROM users WHERE name = 'Alice'";
        assert_eq!(SanitizationConfig::disabled().sanitize(sql), sql);
    }

    #[test]
    fn test_default_masks_and_cuts() {
        let config = SanitizationConfig {
            max_length: 16,
            ..SanitizationConfig::default()
        };
        assert_eq!(config.sanitize("DELETE FROM t WHERE id = 9"), "DELETE FROM t...");
        assert_eq!(
            SanitizationConfig::default().sanitize("DELETE FROM t WHERE id = 9"),
            "DELETE FROM t WHERE id = ?"
        );
    }
}
