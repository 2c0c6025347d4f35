//! Notifications about transaction lifecycle events.
//!
//! The manager reports what happens through an injected
//! [`TransactionObserver`]. The default, [`TracingObserver`], turns each
//! event into a structured `tracing` record; applications that want metrics
//! or alerts plug in their own implementation.

use std::time::Duration;

use crate::context::TransactionId;

/// Something worth reporting happened.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum TransactionEvent {
    /// An attempt started.
    Started {
        /// Transaction id.
        transaction_id: TransactionId,
        /// Zero-based attempt number.
        attempt: u32,
        /// Number of operations.
        operations: usize,
    },
    /// The transaction committed.
    Committed {
        /// Transaction id.
        transaction_id: TransactionId,
        /// Time since the call started.
        duration: Duration,
        /// Retries it took.
        retry_count: u32,
    },
    /// An attempt was rolled back.
    RolledBack {
        /// Transaction id.
        transaction_id: TransactionId,
        /// The failure that caused it.
        reason: String,
    },
    /// Rolling back an attempt failed; the original error still stands.
    RollbackFailed {
        /// Transaction id.
        transaction_id: TransactionId,
        /// The rollback failure.
        error: String,
    },
    /// A failed attempt will be retried after `delay`.
    Retrying {
        /// Transaction id.
        transaction_id: TransactionId,
        /// Retry number about to run, starting at 1.
        retry_count: u32,
        /// Backoff before it.
        delay: Duration,
        /// The failure being retried.
        error: String,
    },
    /// The driver reported a deadlock.
    DeadlockDetected {
        /// Transaction id.
        transaction_id: TransactionId,
        /// The driver error.
        error: String,
    },
    /// The stale monitor found an attempt past its timeout.
    StaleTransaction {
        /// Transaction id.
        transaction_id: TransactionId,
        /// How long the attempt had been running.
        elapsed: Duration,
        /// Its configured limit.
        timeout: Duration,
    },
    /// An advisory lock was granted.
    LockAcquired {
        /// Lock key.
        key: String,
        /// Time spent waiting for it.
        waited: Duration,
    },
    /// An advisory lock was released.
    LockReleased {
        /// Lock key.
        key: String,
        /// How long it was held.
        held: Duration,
    },
}

/// Receiver of [`TransactionEvent`]s.
///
/// Called inline on the task running the transaction; implementations must
/// not block.
pub trait TransactionObserver: Send + Sync {
    /// Handle one event.
    fn on_event(&self, event: &TransactionEvent);
}

/// Writes every event to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl TransactionObserver for TracingObserver {
    fn on_event(&self, event: &TransactionEvent) {
        match event {
            TransactionEvent::Started {
                transaction_id,
                attempt,
                operations,
            } => {
                tracing::debug!(%transaction_id, attempt, operations, "transaction started");
            }
            TransactionEvent::Committed {
                transaction_id,
                duration,
                retry_count,
            } => {
                tracing::debug!(
                    %transaction_id,
                    duration_ms = duration.as_millis() as u64,
                    retry_count,
                    "transaction committed"
                );
            }
            TransactionEvent::RolledBack {
                transaction_id,
                reason,
            } => {
                tracing::info!(%transaction_id, %reason, "transaction rolled back");
            }
            TransactionEvent::RollbackFailed {
                transaction_id,
                error,
            } => {
                tracing::error!(%transaction_id, %error, "rollback failed");
            }
            TransactionEvent::Retrying {
                transaction_id,
                retry_count,
                delay,
                error,
            } => {
                tracing::info!(
                    %transaction_id,
                    retry_count,
                    delay_ms = delay.as_millis() as u64,
                    %error,
                    "retrying transaction"
                );
            }
            TransactionEvent::DeadlockDetected {
                transaction_id,
                error,
            } => {
                tracing::warn!(%transaction_id, %error, "deadlock detected");
            }
            TransactionEvent::StaleTransaction {
                transaction_id,
                elapsed,
                timeout,
            } => {
                tracing::warn!(
                    %transaction_id,
                    elapsed_ms = elapsed.as_millis() as u64,
                    timeout_ms = timeout.as_millis() as u64,
                    "stale transaction, forcing rollback"
                );
            }
            TransactionEvent::LockAcquired { key, waited } => {
                tracing::debug!(%key, waited_ms = waited.as_millis() as u64, "advisory lock acquired");
            }
            TransactionEvent::LockReleased { key, held } => {
                tracing::debug!(%key, held_ms = held.as_millis() as u64, "advisory lock released");
            }
        }
    }
}
