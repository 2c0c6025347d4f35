//! Per-attempt transaction state.

use std::fmt;
use std::time::{Duration, Instant};

use serde::Serialize;
use sqltx_pool::{Pool, PooledConnection};
use sqltx_types::QueryResult;
use uuid::Uuid;

use crate::config::TransactionConfig;
use crate::error::{Error, Result};
use crate::instrumentation::SanitizationConfig;
use crate::operation::DatabaseOperation;

/// Identifier of one `execute_transaction` call, shared by its retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId(Uuid);

impl TransactionId {
    /// Generate a random id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The underlying UUID.
    #[must_use]
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Lifecycle of a transaction attempt.
///
/// ```text
/// Pending ──► Active ──► Committed
///    │          │
///    └────► Error ◄┘
///             │
///             ▼
///        RolledBack
/// ```
///
/// `Committed` and `RolledBack` are terminal. `Error` is where an attempt
/// rests only when no rollback took place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    /// Created, no connection yet.
    Pending,
    /// Connection held and transaction begun.
    Active,
    /// All operations committed.
    Committed,
    /// Rolled back after a failure.
    RolledBack,
    /// Failed; rollback pending or not performed.
    Error,
}

impl TransactionStatus {
    /// Whether no further transition is possible.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Committed | Self::RolledBack)
    }

    /// Whether `self -> next` is a legal transition.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Active)
                | (Self::Pending, Self::Error)
                | (Self::Active, Self::Committed)
                | (Self::Active, Self::Error)
                | (Self::Error, Self::RolledBack)
        )
    }

    /// Move to `next` if legal.
    pub(crate) fn advance(&mut self, next: Self) -> bool {
        if self.can_transition_to(next) {
            *self = next;
            true
        } else {
            tracing::warn!(from = ?self, to = ?next, "ignoring illegal transaction state change");
            false
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Committed => "committed",
            Self::RolledBack => "rolled_back",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

/// State of one attempt.
///
/// Owns the borrowed connection from acquisition until the manager takes
/// it back for rollback and release. If the attempt is abandoned with a
/// transaction still open on the connection, dropping the context marks
/// the connection unhealthy so the pool closes it rather than reusing it.
pub(crate) struct TransactionContext {
    id: TransactionId,
    config: TransactionConfig,
    attempt: u32,
    started_at: Instant,
    status: TransactionStatus,
    connection: Option<PooledConnection>,
    /// `begin` succeeded and neither commit nor rollback has.
    in_flight: bool,
}

impl TransactionContext {
    pub(crate) fn new(id: TransactionId, config: TransactionConfig, attempt: u32) -> Self {
        Self {
            id,
            config,
            attempt,
            started_at: Instant::now(),
            status: TransactionStatus::Pending,
            connection: None,
            in_flight: false,
        }
    }

    pub(crate) fn id(&self) -> TransactionId {
        self.id
    }

    pub(crate) fn config(&self) -> &TransactionConfig {
        &self.config
    }

    pub(crate) fn status(&self) -> TransactionStatus {
        self.status
    }

    pub(crate) fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub(crate) fn in_flight(&self) -> bool {
        self.in_flight
    }

    /// Acquire, begin, run every operation in order, commit.
    pub(crate) async fn run(
        &mut self,
        pool: &Pool,
        operations: &[DatabaseOperation],
        sanitization: &SanitizationConfig,
    ) -> Result<Vec<QueryResult>> {
        let conn = self.connection.insert(pool.get().await?);
        tracing::trace!(
            transaction_id = %self.id,
            attempt = self.attempt,
            connection_id = conn.id(),
            "connection acquired"
        );

        conn.begin(self.config.isolation_level).await?;
        self.in_flight = true;
        self.status.advance(TransactionStatus::Active);

        let mut results = Vec::with_capacity(operations.len());
        for (index, op) in operations.iter().enumerate() {
            tracing::trace!(
                transaction_id = %self.id,
                index,
                statement = %sanitization.sanitize(&op.query),
                "executing operation"
            );
            let result = conn
                .query(&op.query, &op.params)
                .await
                .map_err(|source| Error::Operation {
                    index,
                    retryable: op.retryable,
                    source,
                })?;
            results.push(result);
        }

        conn.commit().await?;
        self.in_flight = false;
        self.status.advance(TransactionStatus::Committed);
        Ok(results)
    }

    /// Record a failed attempt.
    pub(crate) fn fail(&mut self) {
        self.status.advance(TransactionStatus::Error);
    }

    /// Record a successful rollback.
    pub(crate) fn rolled_back(&mut self) {
        self.in_flight = false;
        self.status.advance(TransactionStatus::RolledBack);
    }

    /// Hand the connection back to the manager.
    pub(crate) fn take_connection(&mut self) -> Option<PooledConnection> {
        self.connection.take()
    }
}

impl Drop for TransactionContext {
    fn drop(&mut self) {
        if self.in_flight {
            if let Some(conn) = self.connection.as_mut() {
                tracing::debug!(
                    transaction_id = %self.id,
                    connection_id = conn.id(),
                    "abandoned with an open transaction, discarding connection"
                );
                conn.mark_unhealthy();
            }
        }
    }
}

impl fmt::Debug for TransactionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionContext")
            .field("id", &self.id)
            .field("attempt", &self.attempt)
            .field("status", &self.status)
            .field("in_flight", &self.in_flight)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let mut status = TransactionStatus::Pending;
        assert!(status.advance(TransactionStatus::Active));
        assert!(status.advance(TransactionStatus::Committed));
        assert!(status.is_terminal());
    }

    #[test]
    fn test_failure_transitions() {
        let mut status = TransactionStatus::Pending;
        assert!(status.advance(TransactionStatus::Error));
        assert!(!status.is_terminal());
        assert!(status.advance(TransactionStatus::RolledBack));
        assert!(status.is_terminal());
    }

    #[test]
    fn test_terminal_states_are_final() {
        for terminal in [TransactionStatus::Committed, TransactionStatus::RolledBack] {
            for next in [
                TransactionStatus::Pending,
                TransactionStatus::Active,
                TransactionStatus::Committed,
                TransactionStatus::RolledBack,
                TransactionStatus::Error,
            ] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_illegal_transition_is_ignored() {
        let mut status = TransactionStatus::Pending;
        assert!(!status.advance(TransactionStatus::Committed));
        assert_eq!(status, TransactionStatus::Pending);
    }

    #[test]
    fn test_transaction_ids_are_unique() {
        let a = TransactionId::new();
        let b = TransactionId::new();
        assert_ne!(a, b);
        assert_eq!(a.to_string().len(), 36);
    }

    #[test]
    fn test_new_context_is_pending() {
        let ctx = TransactionContext::new(TransactionId::new(), TransactionConfig::default(), 0);
        assert_eq!(ctx.status(), TransactionStatus::Pending);
        assert!(!ctx.in_flight());
    }
}
