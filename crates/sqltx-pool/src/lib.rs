//! # sqltx-pool
//!
//! Bounded, health-checked connection pool for the sqltx transaction layer.
//!
//! The pool hands out connections produced by a driver-supplied
//! [`ConnectionFactory`](sqltx_types::ConnectionFactory), never more than
//! `max_connections` at once, and serves blocked callers strictly in arrival
//! order.
//!
//! - Lazy growth up to `max_connections` over a warm floor of `min_connections`
//! - FIFO wait queue bounded by `acquire_timeout`
//! - Background sweep evicting idle connections, pinging the rest and
//!   topping the pool back up
//! - Optional ping on checkout
//!
//! ```rust,ignore
//! use std::time::Duration;
//! use sqltx_pool::Pool;
//!
//! let pool = Pool::builder()
//!     .max_connections(20)
//!     .acquire_timeout(Duration::from_secs(5))
//!     .build(factory)
//!     .await?;
//!
//! {
//!     let mut conn = pool.get().await?;
//!     conn.query("SELECT 1", &[]).await?;
//! } // back in the pool here
//!
//! let status = pool.status();
//! tracing::info!(in_use = status.in_use, waiting = status.waiting, "pool status");
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod config;
pub mod error;
pub mod lifecycle;
pub mod pool;

pub use config::PoolConfig;
pub use error::PoolError;
pub use lifecycle::{ConnectionMetadata, ConnectionState, HealthCheckResult};
pub use pool::{Pool, PoolBuilder, PoolMetrics, PoolStatus, PooledConnection};
