//! Connection lifecycle bookkeeping.

use std::time::{Duration, Instant};

/// Where a pooled connection currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Sitting in the available set.
    Idle,
    /// Lent out to a caller.
    InUse,
    /// Taken out by the health sweep.
    Checking,
}

/// Metadata the pool tracks for each connection.
#[derive(Debug, Clone)]
pub struct ConnectionMetadata {
    /// Unique connection id within the pool.
    pub id: u64,
    /// When the connection was opened.
    pub created_at: Instant,
    /// When the connection was last handed out or returned.
    pub last_used_at: Instant,
    /// When the health sweep last pinged it.
    pub last_checked_at: Option<Instant>,
    /// Number of checkouts served.
    pub use_count: u64,
    /// Cleared by a failed health check or by the borrower.
    pub healthy: bool,
    /// Current lifecycle state.
    pub state: ConnectionState,
}

impl ConnectionMetadata {
    pub(crate) fn new(id: u64) -> Self {
        let now = Instant::now();
        Self {
            id,
            created_at: now,
            last_used_at: now,
            last_checked_at: None,
            use_count: 0,
            healthy: true,
            state: ConnectionState::Idle,
        }
    }

    /// Time since the connection was opened.
    #[must_use]
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Time since the connection was last used.
    #[must_use]
    pub fn idle_time(&self) -> Duration {
        self.last_used_at.elapsed()
    }

    /// Whether the connection has sat idle longer than `idle_timeout`.
    #[must_use]
    pub fn is_idle_expired(&self, idle_timeout: Duration) -> bool {
        self.idle_time() > idle_timeout
    }
}

/// Result of pinging one connection.
#[derive(Debug, Clone)]
pub struct HealthCheckResult {
    /// Connection that was checked.
    pub connection_id: u64,
    /// Whether the ping succeeded.
    pub healthy: bool,
    /// Round-trip time of the ping.
    pub latency: Duration,
    /// Failure message, if any.
    pub error: Option<String>,
}
