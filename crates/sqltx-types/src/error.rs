//! Driver error types and transient-failure classification.

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Vendor error codes that signal a deadlock victim.
///
/// `40P01` is PostgreSQL, `1205` SQL Server, `1213` MySQL/MariaDB.
pub const DEADLOCK_CODES: &[&str] = &["40P01", "1205", "1213"];

/// SQLSTATE for a serialization failure.
pub const SERIALIZATION_FAILURE_CODE: &str = "40001";

static TRANSIENT_RE: Lazy<Regex> = Lazy::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new(
        r"(?i)connection\s+time(d\s+)?\s*out|deadlock|serialization\s+failure|could\s+not\s+serialize|connection\s+(lost|reset|terminated)|temporary\s+failure",
    )
    .expect("transient pattern is a valid regex")
});

/// A failure reported by the database or the driver.
///
/// The code is whatever the driver surfaces (SQLSTATE, vendor error number);
/// the message is the human-readable text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{}", render(.code, .message))]
pub struct DbError {
    /// Vendor or SQLSTATE error code, if the driver provided one.
    pub code: Option<String>,
    /// Error message.
    pub message: String,
}

impl DbError {
    /// Create an error with a message and no code.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }

    /// Create an error with a vendor code.
    #[must_use]
    pub fn with_code(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            message: message.into(),
        }
    }

    /// Whether this failure is expected to clear up on its own.
    ///
    /// Matches connection timeouts, deadlocks, serialization failures, lost
    /// connections and temporary failures. Constraint violations, syntax
    /// errors and permission problems are not transient.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        self.is_deadlock()
            || self.code.as_deref() == Some(SERIALIZATION_FAILURE_CODE)
            || TRANSIENT_RE.is_match(&self.message)
    }

    /// Whether this failure is a deadlock, by vendor code or message.
    #[must_use]
    pub fn is_deadlock(&self) -> bool {
        if let Some(code) = self.code.as_deref() {
            if DEADLOCK_CODES.contains(&code) {
                return true;
            }
        }
        self.message.to_ascii_lowercase().contains("deadlock")
    }

    /// Whether the connection that produced this error should be discarded.
    #[must_use]
    pub fn is_connection_loss(&self) -> bool {
        let message = self.message.to_ascii_lowercase();
        message.contains("connection lost")
            || message.contains("connection reset")
            || message.contains("connection terminated")
            || message.contains("connection closed")
    }
}

fn render(code: &Option<String>, message: &str) -> String {
    match code {
        Some(code) => format!("[{code}] {message}"),
        None => message.to_string(),
    }
}

/// Errors converting column values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TypeError {
    /// The row has no column with this name.
    #[error("column '{0}' not found")]
    ColumnNotFound(String),

    /// The column holds a different type than requested.
    #[error("type mismatch: expected {expected}, got {actual}")]
    TypeMismatch {
        /// Requested type.
        expected: &'static str,
        /// Type actually present.
        actual: String,
    },
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_transient_messages() {
        for message in [
            "connection timeout after 5000ms",
            "Connection timed out",
            "deadlock detected",
            "could not serialize access due to concurrent update",
            "serialization failure",
            "server closed: connection lost",
            "Connection reset by peer",
            "temporary failure in name resolution",
        ] {
            assert!(DbError::new(message).is_transient(), "{message}");
        }
    }

    #[test]
    fn test_terminal_messages() {
        for message in [
            "duplicate key value violates unique constraint \"users_pkey\"",
            "syntax error at or near \"SELEC\"",
            "permission denied for table accounts",
            "null value in column \"name\" violates not-null constraint",
        ] {
            assert!(!DbError::new(message).is_transient(), "{message}");
        }
    }

    #[test]
    fn test_deadlock_by_code() {
        assert!(DbError::with_code("40P01", "victim").is_deadlock());
        assert!(DbError::with_code("1205", "chosen as victim").is_deadlock());
        assert!(!DbError::with_code("23505", "unique").is_deadlock());
        assert!(DbError::with_code("40001", "retry").is_transient());
    }

    #[test]
    fn test_display() {
        assert_eq!(DbError::new("boom").to_string(), "boom");
        assert_eq!(
            DbError::with_code("23505", "unique violation").to_string(),
            "[23505] unique violation"
        );
    }

    proptest! {
        #[test]
        fn constraint_violations_never_transient(table in "[a-z]{1,12}", column in "[a-z]{1,12}") {
            let err = DbError::with_code(
                "23505",
                format!("duplicate key value violates unique constraint \"{table}_{column}_key\""),
            );
            prop_assert!(!err.is_transient());
        }

        #[test]
        fn deadlock_message_always_transient(prefix in "[a-zA-Z ]{0,20}", suffix in "[a-zA-Z ]{0,20}") {
            let err = DbError::new(format!("{prefix}deadlock detected{suffix}"));
            prop_assert!(err.is_transient());
            prop_assert!(err.is_deadlock());
        }
    }
}
