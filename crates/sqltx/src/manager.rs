//! The transaction manager.
//!
//! Every attempt runs on one pooled connection: acquire, begin, execute the
//! operations in order, commit. A failed attempt is rolled back on the same
//! connection, the connection is released, and the whole attempt is re-run
//! after an exponential backoff when the failure is transient.
//!
//! Attempts in progress are kept in a registry so the stale monitor can
//! find those past their timeout and cancel them.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use sqltx_pool::{Pool, PoolError};
use sqltx_types::QueryResult;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::{ManagerConfig, TransactionConfig, TransactionOptions};
use crate::context::{TransactionContext, TransactionId, TransactionStatus};
use crate::error::{Error, Result};
use crate::instrumentation::{extract_operation, span_names};
use crate::observer::{TracingObserver, TransactionEvent, TransactionObserver};
use crate::operation::DatabaseOperation;
use crate::result::{TransactionFailure, TransactionResult, TransactionStatistics};

/// Upper bound on a rollback issued after a failure.
const ROLLBACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Runs units of work against a [`Pool`] with retry, rollback, locking and
/// batching.
///
/// The manager is a cheap handle; clones share the pool, statistics and
/// stale monitor.
///
/// # Example
///
/// ```rust,ignore
/// use sqltx::{DatabaseOperation, ManagerConfig, TransactionManager, TransactionOptions};
///
/// let manager = TransactionManager::new(pool, ManagerConfig::default())?;
///
/// let result = manager
///     .execute_transaction(
///         &[
///             DatabaseOperation::new("UPDATE accounts SET balance = balance - $1 WHERE id = $2")
///                 .bind(25)
///                 .bind("alice"),
///             DatabaseOperation::new("UPDATE accounts SET balance = balance + $1 WHERE id = $2")
///                 .bind(25)
///                 .bind("bob"),
///         ],
///         TransactionOptions::default(),
///     )
///     .await;
///
/// assert!(result.is_success());
/// ```
#[derive(Clone)]
pub struct TransactionManager {
    pub(crate) inner: Arc<ManagerInner>,
}

pub(crate) struct ManagerInner {
    pub(crate) pool: Pool,
    pub(crate) config: ManagerConfig,
    observer: Arc<dyn TransactionObserver>,
    active: Mutex<HashMap<TransactionId, ActiveAttempt>>,
    pub(crate) stats: Mutex<StatsInner>,
    shutdown: CancellationToken,
}

struct ActiveAttempt {
    started: Instant,
    timeout: Duration,
    cancel: CancellationToken,
    flagged: bool,
}

#[derive(Debug, Default)]
pub(crate) struct StatsInner {
    pub(crate) committed: u64,
    pub(crate) rolled_back: u64,
    pub(crate) failed: u64,
    pub(crate) retries: u64,
    pub(crate) deadlocks: u64,
    pub(crate) conflicts: u64,
    pub(crate) lock_timeouts: u64,
    pub(crate) stale: u64,
}

impl TransactionManager {
    /// Create a manager that reports events through `tracing`.
    ///
    /// Starts the stale-transaction monitor, so this must be called from
    /// within a Tokio runtime.
    pub fn new(pool: Pool, config: ManagerConfig) -> Result<Self> {
        Self::with_observer(pool, config, Arc::new(TracingObserver))
    }

    /// Create a manager with a custom observer.
    pub fn with_observer(
        pool: Pool,
        config: ManagerConfig,
        observer: Arc<dyn TransactionObserver>,
    ) -> Result<Self> {
        config.validate()?;

        let inner = Arc::new(ManagerInner {
            pool,
            config,
            observer,
            active: Mutex::new(HashMap::new()),
            stats: Mutex::new(StatsInner::default()),
            shutdown: CancellationToken::new(),
        });
        spawn_stale_monitor(&inner);

        Ok(Self { inner })
    }

    /// The pool transactions run on.
    #[must_use]
    pub fn pool(&self) -> &Pool {
        &self.inner.pool
    }

    /// The manager configuration.
    #[must_use]
    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    /// Run `operations` as one transaction.
    ///
    /// On success the data holds one [`QueryResult`] per operation, in
    /// order. On failure nothing from the failing attempt is committed.
    /// Transient failures rerun the whole transaction up to `max_retries`
    /// times, waiting `retry_delay * 2^n` before retry `n + 1`.
    pub async fn execute_transaction(
        &self,
        operations: &[DatabaseOperation],
        options: TransactionOptions,
    ) -> TransactionResult<Vec<QueryResult>> {
        let config = options.resolve(&self.inner.config.transaction);
        let transaction_id = TransactionId::new();
        let span = tracing::debug_span!(
            span_names::TRANSACTION,
            transaction_id = %transaction_id,
            operations = operations.len(),
            first_operation = operations.first().map_or("NONE", |op| extract_operation(&op.query)),
            isolation = %config.isolation_level,
        );

        self.run_with_retry(transaction_id, config, operations)
            .instrument(span)
            .await
    }

    async fn run_with_retry(
        &self,
        transaction_id: TransactionId,
        config: TransactionConfig,
        operations: &[DatabaseOperation],
    ) -> TransactionResult<Vec<QueryResult>> {
        let started = Instant::now();
        let mut retry_count = 0;

        loop {
            let (status, outcome) = self
                .run_attempt(transaction_id, &config, operations, retry_count)
                .await;

            let err = match outcome {
                Ok(results) => {
                    self.inner.stats.lock().committed += 1;
                    self.emit(&TransactionEvent::Committed {
                        transaction_id,
                        duration: started.elapsed(),
                        retry_count,
                    });
                    return TransactionResult {
                        transaction_id,
                        duration: started.elapsed(),
                        retry_count,
                        status,
                        outcome: Ok(results),
                    };
                }
                Err(err) => err,
            };

            if retry_count < config.max_retries && err.is_retryable() {
                let delay = config.backoff(retry_count);
                retry_count += 1;
                self.inner.stats.lock().retries += 1;
                self.emit(&TransactionEvent::Retrying {
                    transaction_id,
                    retry_count,
                    delay,
                    error: err.to_string(),
                });
                tokio::time::sleep(delay).await;
                continue;
            }

            self.inner.stats.lock().failed += 1;
            tracing::debug!(
                %transaction_id,
                retry_count,
                retryable = err.is_retryable(),
                error = %err,
                "transaction failed"
            );
            return TransactionResult {
                transaction_id,
                duration: started.elapsed(),
                retry_count,
                status,
                outcome: Err(TransactionFailure::from(err)),
            };
        }
    }

    /// One attempt, bounded by the configured timeout and by the stale
    /// monitor.
    async fn run_attempt(
        &self,
        transaction_id: TransactionId,
        config: &TransactionConfig,
        operations: &[DatabaseOperation],
        attempt: u32,
    ) -> (TransactionStatus, Result<Vec<QueryResult>>) {
        let mut ctx = TransactionContext::new(transaction_id, config.clone(), attempt);
        if self.inner.shutdown.is_cancelled() {
            ctx.fail();
            return (ctx.status(), Err(Error::Pool(PoolError::PoolClosed)));
        }

        let registration = self.register(&ctx);
        self.emit(&TransactionEvent::Started {
            transaction_id,
            attempt,
            operations: operations.len(),
        });

        let limit = config.timeout;
        let attempt_started = Instant::now();
        let outcome = tokio::select! {
            result = ctx.run(&self.inner.pool, operations, &self.inner.config.sanitization) => result,
            () = tokio::time::sleep(limit) => Err(Error::Timeout {
                elapsed: attempt_started.elapsed(),
                limit,
            }),
            () = registration.cancel.cancelled() => Err(Error::Timeout {
                elapsed: attempt_started.elapsed(),
                limit,
            }),
        };
        drop(registration);

        match outcome {
            Ok(results) => {
                if let Some(conn) = ctx.take_connection() {
                    self.inner.pool.release(conn);
                }
                (ctx.status(), Ok(results))
            }
            Err(err) => {
                self.recover(&mut ctx, &err).await;
                (ctx.status(), Err(err))
            }
        }
    }

    /// Roll back (if configured and a transaction is open) and release.
    async fn recover(&self, ctx: &mut TransactionContext, err: &Error) {
        ctx.fail();

        if ctx.config().enable_deadlock_detection && err.is_deadlock() {
            self.inner.stats.lock().deadlocks += 1;
            self.emit(&TransactionEvent::DeadlockDetected {
                transaction_id: ctx.id(),
                error: err.to_string(),
            });
        }

        let Some(mut conn) = ctx.take_connection() else {
            return;
        };

        if ctx.in_flight() && ctx.config().enable_auto_rollback {
            let rollback_error = match tokio::time::timeout(ROLLBACK_TIMEOUT, conn.rollback()).await
            {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(_) => Some(format!("rollback timed out after {ROLLBACK_TIMEOUT:?}")),
            };

            match rollback_error {
                None => {
                    ctx.rolled_back();
                    self.inner.stats.lock().rolled_back += 1;
                    self.emit(&TransactionEvent::RolledBack {
                        transaction_id: ctx.id(),
                        reason: err.to_string(),
                    });
                }
                Some(error) => {
                    tracing::warn!(
                        transaction_id = %ctx.id(),
                        connection_id = conn.id(),
                        elapsed_ms = ctx.elapsed().as_millis() as u64,
                        %error,
                        original_error = %err,
                        "rollback failed"
                    );
                    self.emit(&TransactionEvent::RollbackFailed {
                        transaction_id: ctx.id(),
                        error,
                    });
                }
            }
        }

        // A connection still inside a transaction, or one whose last
        // statement was cut off, must not be reused.
        if ctx.in_flight() || err.is_connection_loss() {
            conn.mark_unhealthy();
        }
        self.inner.pool.release(conn);
    }

    fn register(&self, ctx: &TransactionContext) -> Registration<'_> {
        let cancel = self.inner.shutdown.child_token();
        self.inner.active.lock().insert(
            ctx.id(),
            ActiveAttempt {
                started: Instant::now(),
                timeout: ctx.config().timeout,
                cancel: cancel.clone(),
                flagged: false,
            },
        );
        Registration {
            inner: &self.inner,
            id: ctx.id(),
            cancel,
        }
    }

    /// Cancel every running attempt that has outlived its timeout.
    ///
    /// Cancelled attempts fail with a timeout and go through rollback. The
    /// background monitor calls this every `stale_check_interval`; returns
    /// the number of attempts flagged by this call.
    pub fn reap_stale_transactions(&self) -> usize {
        self.inner.reap_stale()
    }

    /// Snapshot of manager activity and the pool.
    #[must_use]
    pub fn statistics(&self) -> TransactionStatistics {
        let active = self.inner.active.lock().len();
        let stats = self.inner.stats.lock();
        TransactionStatistics {
            active,
            committed: stats.committed,
            rolled_back: stats.rolled_back,
            failed: stats.failed,
            retries: stats.retries,
            deadlocks: stats.deadlocks,
            conflicts: stats.conflicts,
            lock_timeouts: stats.lock_timeouts,
            stale: stats.stale,
            pool: self.inner.pool.status(),
        }
    }

    /// Stop the stale monitor, cancel running attempts and close the pool.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.pool.close().await;
        tracing::info!("transaction manager shut down");
    }

    pub(crate) fn emit(&self, event: &TransactionEvent) {
        self.inner.observer.on_event(event);
    }
}

impl ManagerInner {
    fn reap_stale(&self) -> usize {
        let stale: Vec<_> = {
            let mut active = self.active.lock();
            active
                .iter_mut()
                .filter(|(_, a)| !a.flagged && a.started.elapsed() > a.timeout)
                .map(|(id, a)| {
                    a.flagged = true;
                    a.cancel.cancel();
                    (*id, a.started.elapsed(), a.timeout)
                })
                .collect()
        };

        if !stale.is_empty() {
            self.stats.lock().stale += stale.len() as u64;
        }
        for (transaction_id, elapsed, timeout) in &stale {
            self.observer.on_event(&TransactionEvent::StaleTransaction {
                transaction_id: *transaction_id,
                elapsed: *elapsed,
                timeout: *timeout,
            });
        }
        stale.len()
    }
}

/// Registry entry for a running attempt; removed on drop, whichever way
/// the attempt ends.
struct Registration<'a> {
    inner: &'a ManagerInner,
    id: TransactionId,
    cancel: CancellationToken,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.inner.active.lock().remove(&self.id);
    }
}

fn spawn_stale_monitor(inner: &Arc<ManagerInner>) {
    let weak: Weak<ManagerInner> = Arc::downgrade(inner);
    let period = inner.config.stale_check_interval;
    let shutdown = inner.shutdown.clone();

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                () = shutdown.cancelled() => break,
            }
            let Some(inner) = weak.upgrade() else {
                break;
            };
            let flagged = inner.reap_stale();
            if flagged > 0 {
                tracing::debug!(flagged, "stale monitor cancelled transactions");
            }
        }

        tracing::debug!("stale monitor stopped");
    });
}

impl std::fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionManager")
            .field("config", &self.inner.config)
            .field("pool", &self.inner.pool)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use sqltx_testing::MockDatabase;

    #[derive(Default)]
    struct Collect(Mutex<Vec<TransactionEvent>>);

    impl TransactionObserver for Collect {
        fn on_event(&self, event: &TransactionEvent) {
            self.0.lock().push(event.clone());
        }
    }

    async fn manager(observer: Arc<Collect>) -> TransactionManager {
        let db = MockDatabase::new();
        let pool = Pool::builder()
            .min_connections(0)
            .max_connections(2)
            .build(db.factory())
            .await
            .unwrap();
        TransactionManager::with_observer(pool, ManagerConfig::default(), observer).unwrap()
    }

    #[tokio::test]
    async fn test_reap_flags_overdue_attempts_once() {
        let observer = Arc::new(Collect::default());
        let manager = manager(Arc::clone(&observer)).await;

        let id = TransactionId::new();
        let cancel = CancellationToken::new();
        manager.inner.active.lock().insert(
            id,
            ActiveAttempt {
                started: Instant::now() - Duration::from_secs(10),
                timeout: Duration::from_secs(1),
                cancel: cancel.clone(),
                flagged: false,
            },
        );

        assert_eq!(manager.reap_stale_transactions(), 1);
        assert!(cancel.is_cancelled());
        assert_eq!(manager.reap_stale_transactions(), 0);
        assert_eq!(manager.statistics().stale, 1);

        let events = observer.0.lock();
        assert!(matches!(
            events.as_slice(),
            [TransactionEvent::StaleTransaction { transaction_id, .. }] if *transaction_id == id
        ));
    }

    #[tokio::test]
    async fn test_reap_ignores_attempts_within_timeout() {
        let manager = manager(Arc::new(Collect::default())).await;
        manager.inner.active.lock().insert(
            TransactionId::new(),
            ActiveAttempt {
                started: Instant::now(),
                timeout: Duration::from_secs(60),
                cancel: CancellationToken::new(),
                flagged: false,
            },
        );
        assert_eq!(manager.reap_stale_transactions(), 0);
        assert_eq!(manager.statistics().active, 1);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_registered_attempts() {
        let manager = manager(Arc::new(Collect::default())).await;
        let ctx = TransactionContext::new(TransactionId::new(), TransactionConfig::default(), 0);
        let registration = manager.register(&ctx);
        assert_eq!(manager.statistics().active, 1);

        manager.shutdown().await;
        assert!(registration.cancel.is_cancelled());
        assert!(manager.pool().is_closed());

        drop(registration);
        assert_eq!(manager.statistics().active, 0);
    }
}
