//! Pool error types.

use std::time::Duration;

use sqltx_types::DbError;
use thiserror::Error;

/// Errors returned by the connection pool.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum PoolError {
    /// No connection became available within the acquire timeout.
    #[error("timed out after {waited:?} waiting for a pooled connection")]
    Timeout {
        /// How long the caller waited.
        waited: Duration,
    },

    /// The pool has been closed.
    #[error("connection pool is closed")]
    PoolClosed,

    /// Opening a new connection failed.
    #[error("failed to open connection: {0}")]
    Connect(#[source] DbError),

    /// Invalid pool configuration.
    #[error("invalid pool configuration: {0}")]
    Configuration(String),
}

impl PoolError {
    /// Whether this error means the pool is saturated.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
