//! Transaction and manager configuration.

use std::time::Duration;

use sqltx_types::IsolationLevel;

use crate::error::Error;
use crate::instrumentation::SanitizationConfig;

/// Resolved settings for one transaction.
///
/// The manager holds the process-wide defaults; each call may overlay a
/// [`TransactionOptions`]. A resolved config never changes once the
/// transaction has started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,

    /// Base backoff; attempt `n` waits `retry_delay * 2^n`.
    pub retry_delay: Duration,

    /// Upper bound on a single attempt.
    pub timeout: Duration,

    /// Isolation level passed to `begin`.
    pub isolation_level: IsolationLevel,

    /// Report deadlocks to the observer.
    pub enable_deadlock_detection: bool,

    /// Roll back on failure before releasing the connection.
    pub enable_auto_rollback: bool,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_millis(1000),
            timeout: Duration::from_secs(30),
            isolation_level: IsolationLevel::ReadCommitted,
            enable_deadlock_detection: true,
            enable_auto_rollback: true,
        }
    }
}

impl TransactionConfig {
    /// Create a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the retry limit.
    #[must_use]
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Set the base retry delay.
    #[must_use]
    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Set the per-attempt timeout.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the isolation level.
    #[must_use]
    pub fn isolation_level(mut self, level: IsolationLevel) -> Self {
        self.isolation_level = level;
        self
    }

    /// Enable or disable deadlock reporting.
    #[must_use]
    pub fn deadlock_detection(mut self, enabled: bool) -> Self {
        self.enable_deadlock_detection = enabled;
        self
    }

    /// Enable or disable rollback on failure.
    #[must_use]
    pub fn auto_rollback(mut self, enabled: bool) -> Self {
        self.enable_auto_rollback = enabled;
        self
    }

    /// Delay before retry number `retry_count + 1`.
    ///
    /// Exponential and uncapped; saturates instead of overflowing.
    #[must_use]
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let factor = 1u32.checked_shl(retry_count).unwrap_or(u32::MAX);
        self.retry_delay.saturating_mul(factor)
    }
}

/// Per-call overrides for [`TransactionConfig`]. Unset fields keep the
/// manager's default.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionOptions {
    /// Override `max_retries`.
    pub max_retries: Option<u32>,
    /// Override `retry_delay`.
    pub retry_delay: Option<Duration>,
    /// Override `timeout`.
    pub timeout: Option<Duration>,
    /// Override `isolation_level`.
    pub isolation_level: Option<IsolationLevel>,
    /// Override `enable_deadlock_detection`.
    pub enable_deadlock_detection: Option<bool>,
    /// Override `enable_auto_rollback`.
    pub enable_auto_rollback: Option<bool>,
}

impl TransactionOptions {
    /// No overrides.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the retry limit.
    #[must_use]
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    /// Override the base retry delay.
    #[must_use]
    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = Some(delay);
        self
    }

    /// Override the per-attempt timeout.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Override the isolation level.
    #[must_use]
    pub fn isolation_level(mut self, level: IsolationLevel) -> Self {
        self.isolation_level = Some(level);
        self
    }

    /// Override deadlock reporting.
    #[must_use]
    pub fn deadlock_detection(mut self, enabled: bool) -> Self {
        self.enable_deadlock_detection = Some(enabled);
        self
    }

    /// Override rollback on failure.
    #[must_use]
    pub fn auto_rollback(mut self, enabled: bool) -> Self {
        self.enable_auto_rollback = Some(enabled);
        self
    }

    /// Overlay these options on `defaults`.
    #[must_use]
    pub fn resolve(&self, defaults: &TransactionConfig) -> TransactionConfig {
        TransactionConfig {
            max_retries: self.max_retries.unwrap_or(defaults.max_retries),
            retry_delay: self.retry_delay.unwrap_or(defaults.retry_delay),
            timeout: self.timeout.unwrap_or(defaults.timeout),
            isolation_level: self.isolation_level.unwrap_or(defaults.isolation_level),
            enable_deadlock_detection: self
                .enable_deadlock_detection
                .unwrap_or(defaults.enable_deadlock_detection),
            enable_auto_rollback: self
                .enable_auto_rollback
                .unwrap_or(defaults.enable_auto_rollback),
        }
    }
}

/// Configuration for a [`TransactionManager`](crate::TransactionManager).
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Defaults for every transaction.
    pub transaction: TransactionConfig,

    /// Pause between chunks of a batch.
    pub batch_delay: Duration,

    /// Interval of the stale-transaction monitor.
    pub stale_check_interval: Duration,

    /// How statements are rendered in logs.
    pub sanitization: SanitizationConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            transaction: TransactionConfig::default(),
            batch_delay: Duration::from_millis(100),
            stale_check_interval: Duration::from_secs(30),
            sanitization: SanitizationConfig::default(),
        }
    }
}

impl ManagerConfig {
    /// Create a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the transaction defaults.
    #[must_use]
    pub fn transaction(mut self, config: TransactionConfig) -> Self {
        self.transaction = config;
        self
    }

    /// Set the pause between batch chunks.
    #[must_use]
    pub fn batch_delay(mut self, delay: Duration) -> Self {
        self.batch_delay = delay;
        self
    }

    /// Set the stale-transaction monitor interval.
    #[must_use]
    pub fn stale_check_interval(mut self, interval: Duration) -> Self {
        self.stale_check_interval = interval;
        self
    }

    /// Set the statement sanitization used in logs.
    #[must_use]
    pub fn sanitization(mut self, config: SanitizationConfig) -> Self {
        self.sanitization = config;
        self
    }

    /// Check the configuration for unusable values.
    pub fn validate(&self) -> Result<(), Error> {
        if self.transaction.timeout.is_zero() {
            return Err(Error::InvalidInput(
                "transaction timeout must be non-zero".into(),
            ));
        }
        if self.stale_check_interval.is_zero() {
            return Err(Error::InvalidInput(
                "stale_check_interval must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_defaults() {
        let config = TransactionConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.retry_delay, Duration::from_millis(1000));
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert_eq!(config.isolation_level, IsolationLevel::ReadCommitted);
        assert!(config.enable_deadlock_detection);
        assert!(config.enable_auto_rollback);

        let manager = ManagerConfig::default();
        assert_eq!(manager.batch_delay, Duration::from_millis(100));
        assert_eq!(manager.stale_check_interval, Duration::from_secs(30));
    }

    #[test]
    fn test_backoff_doubles() {
        let config = TransactionConfig::new().retry_delay(Duration::from_millis(100));
        assert_eq!(config.backoff(0), Duration::from_millis(100));
        assert_eq!(config.backoff(1), Duration::from_millis(200));
        assert_eq!(config.backoff(3), Duration::from_millis(800));
    }

    #[test]
    fn test_backoff_saturates() {
        let config = TransactionConfig::new().retry_delay(Duration::from_secs(1));
        assert_eq!(config.backoff(40), Duration::from_secs(1).saturating_mul(u32::MAX));
        let huge = TransactionConfig::new().retry_delay(Duration::MAX);
        assert_eq!(huge.backoff(5), Duration::MAX);
    }

    #[test]
    fn test_options_overlay() {
        let defaults = TransactionConfig::default();
        let resolved = TransactionOptions::new()
            .max_retries(0)
            .isolation_level(IsolationLevel::Serializable)
            .resolve(&defaults);

        assert_eq!(resolved.max_retries, 0);
        assert_eq!(resolved.isolation_level, IsolationLevel::Serializable);
        assert_eq!(resolved.retry_delay, defaults.retry_delay);
        assert_eq!(resolved.timeout, defaults.timeout);
        assert!(resolved.enable_auto_rollback);
    }

    #[test]
    fn test_empty_options_resolve_to_defaults() {
        let defaults = TransactionConfig::new().max_retries(7);
        assert_eq!(TransactionOptions::default().resolve(&defaults), defaults);
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let config =
            ManagerConfig::new().transaction(TransactionConfig::new().timeout(Duration::ZERO));
        assert!(config.validate().is_err());
        assert!(ManagerConfig::default().validate().is_ok());
    }

    proptest! {
        #[test]
        fn prop_backoff_never_shrinks(delay_ms in 0u64..10_000, retry in 0u32..64) {
            let config = TransactionConfig::new().retry_delay(Duration::from_millis(delay_ms));
            prop_assert!(config.backoff(retry + 1) >= config.backoff(retry));
            prop_assert!(config.backoff(retry) >= config.retry_delay);
        }
    }
}
