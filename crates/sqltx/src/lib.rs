//! # sqltx
//!
//! Transactional execution over a pooled database connection.
//!
//! The [`TransactionManager`] runs multi-statement units of work on
//! connections borrowed from a [`Pool`], and returns every outcome as a
//! [`TransactionResult`] rather than an error.
//!
//! ## Features
//!
//! - **Retry**: transient failures (deadlocks, serialization failures, lost
//!   connections) rerun the whole transaction with exponential backoff
//! - **Rollback**: failed attempts are rolled back on their own connection,
//!   which is always released exactly once
//! - **Timeouts**: each attempt has a deadline, and a background monitor
//!   cancels transactions that outlive it
//! - **Optimistic locking**: versioned single-row updates with conflict
//!   detection
//! - **Distributed locking**: regions guarded by a server-side advisory lock
//! - **Batching**: large operation lists split into atomic chunks
//! - **Observability**: lifecycle events through a pluggable
//!   [`TransactionObserver`], `tracing` spans with sanitized SQL
//!
//! ## Example
//!
//! ```rust,ignore
//! use sqltx::{DatabaseOperation, ManagerConfig, Pool, TransactionManager, TransactionOptions};
//!
//! let pool = Pool::builder().max_connections(20).build(factory).await?;
//! let manager = TransactionManager::new(pool, ManagerConfig::default())?;
//!
//! let result = manager
//!     .execute_transaction(
//!         &[DatabaseOperation::new("INSERT INTO audit (event) VALUES ($1)").bind("login")],
//!         TransactionOptions::default(),
//!     )
//!     .await;
//!
//! match result.outcome {
//!     Ok(rows) => println!("{} statements committed", rows.len()),
//!     Err(failure) => eprintln!("{:?}: {}", failure.kind, failure.message),
//! }
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod config;
pub mod context;
pub mod error;
pub mod instrumentation;
pub mod observer;
pub mod operation;
pub mod result;

mod batch;
mod locking;
mod manager;

// Configuration
pub use config::{ManagerConfig, TransactionConfig, TransactionOptions};

// Core types
pub use context::{TransactionId, TransactionStatus};
pub use error::{Error, Result};
pub use manager::TransactionManager;
pub use operation::DatabaseOperation;
pub use result::{FailureKind, TransactionFailure, TransactionResult, TransactionStatistics};

// Observability
pub use instrumentation::SanitizationConfig;
pub use observer::{TracingObserver, TransactionEvent, TransactionObserver};

// Re-exports from the pool and driver contract
pub use sqltx_pool::{Pool, PoolBuilder, PoolConfig, PoolError, PoolStatus};
pub use sqltx_types::{
    Connection, ConnectionFactory, DbError, DynConnectionFactory, IsolationLevel, QueryResult,
    Row, SqlValue,
};
