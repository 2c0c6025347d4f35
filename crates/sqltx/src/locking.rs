//! Optimistic (versioned row) and distributed (advisory lock) execution.

use std::future::Future;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use regex::Regex;
use sqltx_pool::PooledConnection;
use sqltx_types::{Row, SqlValue};
use tracing::Instrument;

use crate::context::{TransactionId, TransactionStatus};
use crate::error::{Error, Result};
use crate::instrumentation::span_names;
use crate::manager::TransactionManager;
use crate::observer::TransactionEvent;
use crate::result::{TransactionFailure, TransactionResult};

/// Column every versioned table is keyed by.
pub(crate) const ID_COLUMN: &str = "id";

/// Extra wait granted to the driver beyond the lock timeout before the
/// request is abandoned.
const LOCK_GRACE: Duration = Duration::from_secs(1);

impl TransactionManager {
    /// Update one row guarded by a version column.
    ///
    /// Reads the row by id, checks that `version_column` equals
    /// `expected_version`, applies `update_fn`, and writes the result with
    /// the version bumped to `expected_version + 1`. The write is
    /// conditional on the version still being `expected_version`, so a
    /// concurrent writer makes it a [`Conflict`](crate::FailureKind::Conflict)
    /// rather than a lost update.
    ///
    /// Single attempt, autocommit; conflicts are never retried here.
    /// Changes `update_fn` makes to the id or version columns are ignored.
    pub async fn execute_with_optimistic_lock<F>(
        &self,
        table: &str,
        record_id: impl Into<SqlValue>,
        version_column: &str,
        expected_version: i64,
        update_fn: F,
    ) -> TransactionResult<Row>
    where
        F: FnOnce(Row) -> Row,
    {
        let transaction_id = TransactionId::new();
        let started = Instant::now();
        let record_id = record_id.into();
        let span = tracing::debug_span!(
            span_names::OPTIMISTIC_LOCK,
            %transaction_id,
            table,
            record_id = %record_id,
            expected_version,
        );

        let outcome = self
            .versioned_update(table, &record_id, version_column, expected_version, update_fn)
            .instrument(span)
            .await;

        let status = match &outcome {
            Ok(_) => {
                self.inner.stats.lock().committed += 1;
                TransactionStatus::Committed
            }
            Err(err) => {
                let mut stats = self.inner.stats.lock();
                stats.failed += 1;
                if matches!(err, Error::Conflict { .. }) {
                    stats.conflicts += 1;
                }
                TransactionStatus::Error
            }
        };

        TransactionResult {
            transaction_id,
            duration: started.elapsed(),
            retry_count: 0,
            status,
            outcome: outcome.map_err(TransactionFailure::from),
        }
    }

    async fn versioned_update<F>(
        &self,
        table: &str,
        record_id: &SqlValue,
        version_column: &str,
        expected_version: i64,
        update_fn: F,
    ) -> Result<Row>
    where
        F: FnOnce(Row) -> Row,
    {
        validate_identifier(table)?;
        validate_identifier(version_column)?;

        let mut conn = self.inner.pool.get().await?;

        let select = format!("SELECT * FROM {table} WHERE {ID_COLUMN} = $1");
        let current = conn
            .query(&select, std::slice::from_ref(record_id))
            .await?
            .rows
            .into_iter()
            .next()
            .ok_or_else(|| Error::NotFound {
                table: table.to_string(),
                id: record_id.to_string(),
            })?;

        let found = current
            .get_i64(version_column)
            .map_err(|e| Error::InvalidInput(e.to_string()))?;
        if found != expected_version {
            return Err(Error::Conflict {
                table: table.to_string(),
                id: record_id.to_string(),
                reason: format!("expected version {expected_version}, found {found}"),
            });
        }

        let next_version = expected_version.checked_add(1).ok_or_else(|| {
            Error::InvalidInput(format!(
                "{version_column} {expected_version} cannot be incremented"
            ))
        })?;
        let mut updated = update_fn(current);
        updated.set(ID_COLUMN, record_id.clone());
        updated.set(version_column, next_version);

        let mut assignments = Vec::new();
        let mut params = Vec::new();
        for (column, value) in updated.iter() {
            if column.eq_ignore_ascii_case(ID_COLUMN) || column.eq_ignore_ascii_case(version_column)
            {
                continue;
            }
            validate_identifier(column)?;
            params.push(value.clone());
            assignments.push(format!("{column} = ${}", params.len()));
        }
        params.push(SqlValue::Int(next_version));
        assignments.push(format!("{version_column} = ${}", params.len()));
        params.push(record_id.clone());
        let id_param = params.len();
        params.push(SqlValue::Int(expected_version));
        let version_param = params.len();

        let update = format!(
            "UPDATE {table} SET {} WHERE {ID_COLUMN} = ${id_param} AND {version_column} = ${version_param}",
            assignments.join(", ")
        );
        let result = conn.query(&update, &params).await?;
        if result.rows_affected == 0 {
            return Err(Error::Conflict {
                table: table.to_string(),
                id: record_id.to_string(),
                reason: format!("version {expected_version} was replaced concurrently"),
            });
        }

        tracing::debug!(
            connection_id = conn.id(),
            version = next_version,
            "versioned update applied"
        );
        Ok(updated)
    }

    /// Run `operation` while holding the advisory lock `key`.
    ///
    /// The lock is taken on a dedicated pooled connection and released
    /// after `operation` finishes, whether it succeeded or not. If the lock
    /// is not granted within `timeout` the result is a
    /// [`LockTimeout`](crate::FailureKind::LockTimeout) failure and
    /// `operation` is never called. A failed release is logged, and the
    /// connection is closed so the server drops the lock with the session.
    ///
    /// The locked region counts once in [`statistics`](Self::statistics),
    /// as committed or failed; transactions run inside it count on their own.
    pub async fn execute_with_distributed_lock<T, F, Fut>(
        &self,
        key: &str,
        timeout: Duration,
        operation: F,
    ) -> TransactionResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let transaction_id = TransactionId::new();
        let started = Instant::now();
        let span = tracing::debug_span!(span_names::DISTRIBUTED_LOCK, %transaction_id, key);

        let outcome = self
            .locked(key, timeout, operation)
            .instrument(span)
            .await;

        let status = match &outcome {
            Ok(_) => {
                self.inner.stats.lock().committed += 1;
                TransactionStatus::Committed
            }
            Err(err) => {
                let mut stats = self.inner.stats.lock();
                stats.failed += 1;
                if matches!(err, Error::LockTimeout { .. }) {
                    stats.lock_timeouts += 1;
                }
                TransactionStatus::Error
            }
        };

        TransactionResult {
            transaction_id,
            duration: started.elapsed(),
            retry_count: 0,
            status,
            outcome: outcome.map_err(TransactionFailure::from),
        }
    }

    async fn locked<T, F, Fut>(&self, key: &str, timeout: Duration, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if key.is_empty() {
            return Err(Error::InvalidInput("lock key cannot be empty".into()));
        }

        let mut conn = self.inner.pool.get().await?;
        let wait_started = Instant::now();
        let granted = match tokio::time::timeout(
            timeout.saturating_add(LOCK_GRACE),
            conn.try_advisory_lock(key, timeout),
        )
        .await
        {
            Ok(granted) => granted?,
            Err(_) => {
                // The request may still be granted server-side; closing the
                // session is the only way to be sure it is not.
                conn.mark_unhealthy();
                false
            }
        };
        if !granted {
            tracing::debug!(key, timeout_ms = timeout.as_millis() as u64, "lock not granted");
            return Err(Error::LockTimeout {
                key: key.to_string(),
                timeout,
            });
        }

        self.emit(&TransactionEvent::LockAcquired {
            key: key.to_string(),
            waited: wait_started.elapsed(),
        });
        let mut lock = HeldLock {
            conn,
            key,
            acquired_at: Instant::now(),
            released: false,
        };

        let result = operation().await;
        self.release_lock(&mut lock).await;
        result
    }

    async fn release_lock(&self, lock: &mut HeldLock<'_>) {
        match lock.conn.advisory_unlock(lock.key).await {
            Ok(()) => {
                lock.released = true;
                self.emit(&TransactionEvent::LockReleased {
                    key: lock.key.to_string(),
                    held: lock.acquired_at.elapsed(),
                });
            }
            Err(e) => {
                tracing::warn!(
                    key = lock.key,
                    connection_id = lock.conn.id(),
                    error = %e,
                    "failed to release advisory lock, closing its connection"
                );
            }
        }
    }
}

/// An advisory lock held on a pooled connection.
///
/// Unless released explicitly, dropping it closes the connection, which
/// ends the session and with it the lock.
struct HeldLock<'a> {
    conn: PooledConnection,
    key: &'a str,
    acquired_at: Instant,
    released: bool,
}

impl Drop for HeldLock<'_> {
    fn drop(&mut self) {
        if !self.released {
            self.conn.mark_unhealthy();
        }
    }
}

/// Validate a table or column name before it is spliced into SQL.
pub(crate) fn validate_identifier(name: &str) -> Result<()> {
    #[allow(clippy::expect_used)]
    static IDENTIFIER_RE: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,62}$").expect("valid identifier pattern")
    });

    if name.is_empty() {
        return Err(Error::InvalidInput("identifier cannot be empty".into()));
    }

    if !IDENTIFIER_RE.is_match(name) {
        return Err(Error::InvalidInput(format!(
            "invalid identifier '{name}': must start with a letter or underscore, \
             contain only alphanumerics and underscores, and be 1-63 characters"
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_identifier_valid() {
        assert!(validate_identifier("my_table").is_ok());
        assert!(validate_identifier("Table123").is_ok());
        assert!(validate_identifier("_private").is_ok());
        assert!(validate_identifier("row_version").is_ok());
    }

    #[test]
    fn test_validate_identifier_invalid() {
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("123abc").is_err());
        assert!(validate_identifier("table-name").is_err());
        assert!(validate_identifier("table name").is_err());
        assert!(validate_identifier("table;DROP TABLE users").is_err());
        assert!(validate_identifier("t$1").is_err());
        assert!(validate_identifier(&"a".repeat(64)).is_err());
    }
}
