//! Fault injection rules for the mock database.

use std::time::Duration;

use sqltx_types::DbError;

/// The driver call a fault fires on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultPoint {
    /// Opening a connection.
    Connect,
    /// `begin`.
    Begin,
    /// `query`; narrowed by the fault's SQL substring.
    Query,
    /// `commit`.
    Commit,
    /// `rollback`.
    Rollback,
    /// `ping`.
    Ping,
    /// `try_advisory_lock`.
    Lock,
    /// `advisory_unlock`.
    Unlock,
}

/// One injected failure.
#[derive(Debug, Clone)]
pub struct Fault {
    pub(crate) point: FaultPoint,
    pub(crate) sql_contains: Option<String>,
    pub(crate) error: DbError,
    pub(crate) remaining: Option<u32>,
}

impl Fault {
    /// Fail every call at `point` with `error`.
    #[must_use]
    pub fn new(point: FaultPoint, error: DbError) -> Self {
        Self {
            point,
            sql_contains: None,
            error,
            remaining: None,
        }
    }

    /// Fail queries whose text contains `needle`.
    #[must_use]
    pub fn query(needle: impl Into<String>, error: DbError) -> Self {
        Self {
            point: FaultPoint::Query,
            sql_contains: Some(needle.into()),
            error,
            remaining: None,
        }
    }

    /// Only fire the first `count` times, then stay quiet.
    #[must_use]
    pub fn times(mut self, count: u32) -> Self {
        self.remaining = Some(count);
        self
    }

    pub(crate) fn matches(&self, point: FaultPoint, sql: Option<&str>) -> bool {
        if self.point != point || self.remaining == Some(0) {
            return false;
        }
        match (&self.sql_contains, sql) {
            (Some(needle), Some(sql)) => sql.contains(needle.as_str()),
            (Some(_), None) => false,
            (None, _) => true,
        }
    }

    /// Consume one firing and return the error.
    pub(crate) fn fire(&mut self) -> DbError {
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining = remaining.saturating_sub(1);
        }
        self.error.clone()
    }
}

/// Artificial latency on a driver call.
#[derive(Debug, Clone)]
pub struct Latency {
    pub(crate) point: FaultPoint,
    pub(crate) sql_contains: Option<String>,
    pub(crate) delay: Duration,
}

impl Latency {
    /// Delay queries containing `needle` by `delay`.
    #[must_use]
    pub fn query(needle: impl Into<String>, delay: Duration) -> Self {
        Self {
            point: FaultPoint::Query,
            sql_contains: Some(needle.into()),
            delay,
        }
    }

    /// Delay every `ping` by `delay`.
    #[must_use]
    pub fn ping(delay: Duration) -> Self {
        Self {
            point: FaultPoint::Ping,
            sql_contains: None,
            delay,
        }
    }

    pub(crate) fn applies(&self, point: FaultPoint, sql: Option<&str>) -> bool {
        if self.point != point {
            return false;
        }
        match (&self.sql_contains, sql) {
            (Some(needle), Some(sql)) => sql.contains(needle.as_str()),
            (Some(_), None) => false,
            (None, _) => true,
        }
    }
}
