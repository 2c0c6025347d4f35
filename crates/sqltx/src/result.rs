//! The value every manager entry point returns.

use std::time::Duration;

use serde::Serialize;
use sqltx_pool::PoolStatus;
use thiserror::Error;

use crate::context::{TransactionId, TransactionStatus};
use crate::error::Error;

/// Coarse classification of a failure, for callers deciding what to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Transient driver failure that outlasted the retry budget.
    Transient,
    /// Data or query failure; retrying will not help.
    Terminal,
    /// No pooled connection became available; apply backpressure.
    ResourceExhausted,
    /// Optimistic-lock version mismatch.
    Conflict,
    /// Advisory lock not granted in time.
    LockTimeout,
    /// The transaction ran past its deadline.
    Timeout,
    /// The request itself was malformed.
    InvalidInput,
}

/// Why a unit of work failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct TransactionFailure {
    /// Classification.
    pub kind: FailureKind,
    /// Human-readable cause.
    pub message: String,
    /// Batch chunks committed before the failure; zero outside batches.
    pub committed_chunks: usize,
}

impl From<&Error> for TransactionFailure {
    fn from(err: &Error) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
            committed_chunks: 0,
        }
    }
}

impl From<Error> for TransactionFailure {
    fn from(err: Error) -> Self {
        Self::from(&err)
    }
}

/// Outcome of a manager call.
///
/// Success carries the data; failure carries a [`TransactionFailure`].
/// Internal transaction state is never exposed beyond the final status.
#[derive(Debug, Clone)]
pub struct TransactionResult<T> {
    /// Id of the transaction (or of the batch).
    pub transaction_id: TransactionId,
    /// Wall time from the call to its result, retries and backoff included.
    pub duration: Duration,
    /// Retries performed.
    pub retry_count: u32,
    /// Status the last attempt ended in.
    pub status: TransactionStatus,
    /// Data or failure.
    pub outcome: Result<T, TransactionFailure>,
}

impl<T> TransactionResult<T> {
    /// Whether the work succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    /// The data, on success.
    #[must_use]
    pub fn data(&self) -> Option<&T> {
        self.outcome.as_ref().ok()
    }

    /// The failure, on error.
    #[must_use]
    pub fn error(&self) -> Option<&TransactionFailure> {
        self.outcome.as_ref().err()
    }

    /// Whether some work was committed before the failure. Only batches
    /// can end up here.
    #[must_use]
    pub fn is_partial(&self) -> bool {
        self.error().is_some_and(|f| f.committed_chunks > 0)
    }

    /// Drop the metadata.
    pub fn into_result(self) -> Result<T, TransactionFailure> {
        self.outcome
    }

    /// Map the data, keeping the metadata.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> TransactionResult<U> {
        TransactionResult {
            transaction_id: self.transaction_id,
            duration: self.duration,
            retry_count: self.retry_count,
            status: self.status,
            outcome: self.outcome.map(f),
        }
    }
}

/// Snapshot of manager activity.
#[derive(Debug, Clone, Serialize)]
pub struct TransactionStatistics {
    /// Attempts currently running.
    pub active: usize,
    /// Transactions committed.
    pub committed: u64,
    /// Attempts rolled back.
    pub rolled_back: u64,
    /// Transactions that ended in failure.
    pub failed: u64,
    /// Retries performed.
    pub retries: u64,
    /// Deadlocks reported by the driver.
    pub deadlocks: u64,
    /// Optimistic-lock conflicts.
    pub conflicts: u64,
    /// Advisory locks not granted in time.
    pub lock_timeouts: u64,
    /// Transactions flagged by the stale monitor.
    pub stale: u64,
    /// Connection pool snapshot.
    pub pool: PoolStatus,
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqltx_types::DbError;

    fn result<T>(outcome: Result<T, TransactionFailure>) -> TransactionResult<T> {
        TransactionResult {
            transaction_id: TransactionId::new(),
            duration: Duration::from_millis(5),
            retry_count: 0,
            status: TransactionStatus::Committed,
            outcome,
        }
    }

    #[test]
    fn test_success_accessors() {
        let r = result(Ok(3));
        assert!(r.is_success());
        assert_eq!(r.data(), Some(&3));
        assert!(r.error().is_none());
        assert!(!r.is_partial());
        assert_eq!(r.map(|v| v * 2).into_result(), Ok(6));
    }

    #[test]
    fn test_failure_from_error() {
        let failure = TransactionFailure::from(Error::Database(DbError::new("syntax error")));
        assert_eq!(failure.kind, FailureKind::Terminal);
        assert_eq!(failure.message, "database error: syntax error");

        let r: TransactionResult<()> = result(Err(failure));
        assert!(!r.is_success());
        assert!(r.data().is_none());
        assert!(!r.is_partial());
    }

    #[test]
    fn test_partial() {
        let failure = TransactionFailure {
            kind: FailureKind::Terminal,
            message: "boom".into(),
            committed_chunks: 2,
        };
        let r: TransactionResult<()> = result(Err(failure));
        assert!(r.is_partial());
    }
}
