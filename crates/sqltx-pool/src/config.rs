//! Pool configuration.

use std::time::Duration;

use crate::error::PoolError;

/// Configuration for a connection pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Connections kept open even when idle.
    pub min_connections: u32,

    /// Upper bound on open connections, busy or idle.
    pub max_connections: u32,

    /// How long `get()` waits for a connection before failing.
    pub acquire_timeout: Duration,

    /// Idle connections older than this are closed by the health sweep.
    pub idle_timeout: Duration,

    /// Interval between background health sweeps.
    pub health_check_interval: Duration,

    /// Ping each connection before handing it out.
    pub test_on_checkout: bool,

    /// Longest a health or checkout ping may take before the connection is
    /// treated as dead.
    pub ping_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: 2,
            max_connections: 20,
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(300),
            health_check_interval: Duration::from_secs(60),
            test_on_checkout: false,
            ping_timeout: Duration::from_secs(5),
        }
    }
}

impl PoolConfig {
    /// Create a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse the pooling keys out of an ADO.NET-style connection string.
    ///
    /// Durations are whole seconds. Keys the pool does not own (server,
    /// credentials, ...) are ignored so the same string can be handed to the
    /// driver's connection factory.
    ///
    /// ```text
    /// Server=db;Min Pool Size=2;Max Pool Size=50;Connection Timeout=10;
    /// ```
    pub fn from_connection_string(conn_str: &str) -> Result<Self, PoolError> {
        let mut config = Self::default();

        for part in conn_str.split(';') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }

            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| PoolError::Configuration(format!("invalid key-value: {part}")))?;

            let key = key.trim().to_lowercase();
            let value = value.trim();

            match key.as_str() {
                "min pool size" | "minpoolsize" | "min connections" => {
                    config.min_connections = parse_count(&key, value)?;
                }
                "max pool size" | "maxpoolsize" | "max connections" => {
                    config.max_connections = parse_count(&key, value)?;
                }
                "connection timeout" | "connect timeout" | "acquire timeout" => {
                    config.acquire_timeout = parse_secs(&key, value)?;
                }
                "idle timeout" | "connection idle timeout" => {
                    config.idle_timeout = parse_secs(&key, value)?;
                }
                "health check interval" => {
                    config.health_check_interval = parse_secs(&key, value)?;
                }
                "ping timeout" | "health check timeout" => {
                    config.ping_timeout = parse_secs(&key, value)?;
                }
                "test on checkout" | "testoncheckout" => {
                    config.test_on_checkout = value.eq_ignore_ascii_case("true")
                        || value.eq_ignore_ascii_case("yes")
                        || value == "1";
                }
                _ => {
                    tracing::debug!(key = key, "ignoring non-pool connection string option");
                }
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Set the minimum number of connections.
    #[must_use]
    pub fn min_connections(mut self, count: u32) -> Self {
        self.min_connections = count;
        self
    }

    /// Set the maximum number of connections.
    #[must_use]
    pub fn max_connections(mut self, count: u32) -> Self {
        self.max_connections = count;
        self
    }

    /// Set the connection acquisition timeout.
    #[must_use]
    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Set the idle connection timeout.
    #[must_use]
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set the background health check interval.
    #[must_use]
    pub fn health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    /// Enable or disable pinging connections on checkout.
    #[must_use]
    pub fn test_on_checkout(mut self, enabled: bool) -> Self {
        self.test_on_checkout = enabled;
        self
    }

    /// Set the ping timeout.
    #[must_use]
    pub fn ping_timeout(mut self, timeout: Duration) -> Self {
        self.ping_timeout = timeout;
        self
    }

    /// Check the configuration for inconsistent values.
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.max_connections == 0 {
            return Err(PoolError::Configuration(
                "max_connections must be greater than zero".into(),
            ));
        }
        if self.min_connections > self.max_connections {
            return Err(PoolError::Configuration(format!(
                "min_connections ({}) exceeds max_connections ({})",
                self.min_connections, self.max_connections
            )));
        }
        if self.acquire_timeout.is_zero() {
            return Err(PoolError::Configuration(
                "acquire_timeout must be non-zero".into(),
            ));
        }
        if self.ping_timeout.is_zero() {
            return Err(PoolError::Configuration(
                "ping_timeout must be non-zero".into(),
            ));
        }
        if self.health_check_interval.is_zero() {
            return Err(PoolError::Configuration(
                "health_check_interval must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

fn parse_count(key: &str, value: &str) -> Result<u32, PoolError> {
    value
        .parse()
        .map_err(|_| PoolError::Configuration(format!("invalid {key}: {value}")))
}

fn parse_secs(key: &str, value: &str) -> Result<Duration, PoolError> {
    let secs: u64 = value
        .parse()
        .map_err(|_| PoolError::Configuration(format!("invalid {key}: {value}")))?;
    Ok(Duration::from_secs(secs))
}
