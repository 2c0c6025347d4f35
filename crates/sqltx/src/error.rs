//! Transaction manager error types.

use std::time::Duration;

use sqltx_pool::PoolError;
use sqltx_types::DbError;
use thiserror::Error;

use crate::result::FailureKind;

/// Errors raised while running a unit of work.
///
/// These never cross the manager's public entry points; they are folded
/// into a [`TransactionResult`](crate::TransactionResult) there. Closures
/// passed to the locking helpers return them.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum Error {
    /// The driver failed outside any particular operation (begin, commit).
    #[error("database error: {0}")]
    Database(#[from] DbError),

    /// One of the transaction's operations failed.
    #[error("operation {index} failed: {source}")]
    Operation {
        /// Position of the operation in the transaction.
        index: usize,
        /// Whether the operation allows a transient failure to be retried.
        retryable: bool,
        /// Driver error.
        #[source]
        source: DbError,
    },

    /// No connection could be obtained.
    #[error("connection pool error: {0}")]
    Pool(#[from] PoolError),

    /// The attempt ran past its deadline.
    #[error("transaction timed out after {elapsed:?} (limit {limit:?})")]
    Timeout {
        /// Time spent before the attempt was abandoned.
        elapsed: Duration,
        /// Configured limit.
        limit: Duration,
    },

    /// An optimistic-lock write lost against a concurrent writer.
    #[error("version conflict on {table} id {id}: {reason}")]
    Conflict {
        /// Table being updated.
        table: String,
        /// Record id, rendered.
        id: String,
        /// What did not match.
        reason: String,
    },

    /// The record to update does not exist.
    #[error("no row in {table} with id {id}")]
    NotFound {
        /// Table being read.
        table: String,
        /// Record id, rendered.
        id: String,
    },

    /// An advisory lock was not granted in time.
    #[error("could not acquire lock '{key}' within {timeout:?}")]
    LockTimeout {
        /// Lock key.
        key: String,
        /// Configured wait.
        timeout: Duration,
    },

    /// Bad arguments (identifiers, batch size, configuration).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Failure reported by caller-supplied code.
    #[error("{0}")]
    Application(String),
}

impl Error {
    /// Wrap an application failure.
    #[must_use]
    pub fn application(message: impl Into<String>) -> Self {
        Self::Application(message.into())
    }

    /// The driver error underneath, if any.
    #[must_use]
    pub fn db_error(&self) -> Option<&DbError> {
        match self {
            Self::Database(e) | Self::Operation { source: e, .. } => Some(e),
            Self::Pool(PoolError::Connect(e)) => Some(e),
            _ => None,
        }
    }

    /// Whether running the whole transaction again may succeed.
    ///
    /// Only transient driver errors qualify, and only when the failing
    /// operation allows retries. Pool exhaustion and timeouts are surfaced
    /// to the caller instead.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Database(e) => e.is_transient(),
            Self::Operation {
                retryable, source, ..
            } => *retryable && source.is_transient(),
            Self::Pool(PoolError::Connect(e)) => e.is_transient(),
            _ => false,
        }
    }

    /// Whether the driver reported a deadlock.
    #[must_use]
    pub fn is_deadlock(&self) -> bool {
        self.db_error().is_some_and(DbError::is_deadlock)
    }

    /// Whether the connection in use should be discarded.
    #[must_use]
    pub fn is_connection_loss(&self) -> bool {
        match self {
            Self::Database(e) | Self::Operation { source: e, .. } => e.is_connection_loss(),
            Self::Timeout { .. } => true,
            _ => false,
        }
    }

    /// Caller-facing classification.
    #[must_use]
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Database(_) | Self::Operation { .. } | Self::Pool(PoolError::Connect(_)) => {
                if self.db_error().is_some_and(DbError::is_transient) {
                    FailureKind::Transient
                } else {
                    FailureKind::Terminal
                }
            }
            Self::Pool(PoolError::Timeout { .. }) => FailureKind::ResourceExhausted,
            Self::Pool(_) => FailureKind::Terminal,
            Self::Timeout { .. } => FailureKind::Timeout,
            Self::Conflict { .. } => FailureKind::Conflict,
            Self::NotFound { .. } | Self::Application(_) => FailureKind::Terminal,
            Self::LockTimeout { .. } => FailureKind::LockTimeout,
            Self::InvalidInput(_) => FailureKind::InvalidInput,
        }
    }
}

/// Result type for manager internals and locked closures.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    fn deadlock() -> DbError {
        DbError::with_code("40P01", "deadlock detected")
    }

    #[test]
    fn test_transient_database_error_is_retryable() {
        assert!(Error::Database(deadlock()).is_retryable());
        assert!(Error::Database(DbError::new("connection timed out")).is_retryable());
        assert!(!Error::Database(DbError::new("duplicate key value")).is_retryable());
    }

    #[test]
    fn test_operation_flag_disables_retry() {
        let retryable = Error::Operation {
            index: 0,
            retryable: true,
            source: deadlock(),
        };
        let pinned = Error::Operation {
            index: 0,
            retryable: false,
            source: deadlock(),
        };
        assert!(retryable.is_retryable());
        assert!(!pinned.is_retryable());
        assert_eq!(pinned.kind(), FailureKind::Transient);
    }

    #[test]
    fn test_pool_timeout_is_resource_exhaustion() {
        let err = Error::Pool(PoolError::Timeout {
            waited: Duration::from_secs(1),
        });
        assert!(!err.is_retryable());
        assert_eq!(err.kind(), FailureKind::ResourceExhausted);
    }

    #[test]
    fn test_kinds() {
        let conflict = Error::Conflict {
            table: "docs".into(),
            id: "1".into(),
            reason: "stale".into(),
        };
        assert_eq!(conflict.kind(), FailureKind::Conflict);
        assert!(!conflict.is_retryable());

        let lock = Error::LockTimeout {
            key: "k".into(),
            timeout: Duration::from_millis(10),
        };
        assert_eq!(lock.kind(), FailureKind::LockTimeout);

        let timeout = Error::Timeout {
            elapsed: Duration::from_secs(2),
            limit: Duration::from_secs(1),
        };
        assert_eq!(timeout.kind(), FailureKind::Timeout);
        assert!(timeout.is_connection_loss());

        assert_eq!(
            Error::Database(DbError::new("syntax error")).kind(),
            FailureKind::Terminal
        );
        assert_eq!(
            Error::InvalidInput("x".into()).kind(),
            FailureKind::InvalidInput
        );
    }

    #[test]
    fn test_deadlock_detection_through_wrappers() {
        let err = Error::Operation {
            index: 2,
            retryable: true,
            source: DbError::with_code("1205", "chosen as deadlock victim"),
        };
        assert!(err.is_deadlock());
        assert!(!Error::Database(DbError::new("timeout")).is_deadlock());
    }

    #[test]
    fn test_display() {
        let err = Error::Operation {
            index: 1,
            retryable: true,
            source: DbError::with_code("23505", "duplicate key"),
        };
        assert_eq!(err.to_string(), "operation 1 failed: [23505] duplicate key");
    }
}
