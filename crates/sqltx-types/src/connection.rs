//! The driver connection contract.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::DbError;
use crate::isolation::IsolationLevel;
use crate::row::QueryResult;
use crate::value::SqlValue;

/// A live connection to the database.
///
/// Implementations wrap a real driver connection. A connection is only ever
/// used by one task at a time; statements on it run strictly in sequence.
#[async_trait]
pub trait Connection: Send {
    /// Execute a parameterized statement.
    async fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<QueryResult, DbError>;

    /// Begin a transaction at the given isolation level.
    async fn begin(&mut self, isolation: IsolationLevel) -> Result<(), DbError>;

    /// Commit the open transaction.
    async fn commit(&mut self) -> Result<(), DbError>;

    /// Roll back the open transaction.
    async fn rollback(&mut self) -> Result<(), DbError>;

    /// Try to take a named server-side advisory lock, waiting at most `timeout`.
    ///
    /// Returns `Ok(false)` when the lock is held elsewhere for the whole wait.
    async fn try_advisory_lock(&mut self, key: &str, timeout: Duration) -> Result<bool, DbError>;

    /// Release a named advisory lock held by this connection.
    async fn advisory_unlock(&mut self, key: &str) -> Result<(), DbError>;

    /// Cheap liveness probe, typically `SELECT 1`.
    async fn ping(&mut self) -> Result<(), DbError>;
}

/// Opens new connections for a pool.
///
/// Credentials, URLs and TLS are the factory's concern.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Open a new connection.
    async fn connect(&self) -> Result<Box<dyn Connection>, DbError>;
}

/// Shared, type-erased connection factory.
pub type DynConnectionFactory = std::sync::Arc<dyn ConnectionFactory>;
