//! # sqltx-testing
//!
//! In-memory database driver for exercising the sqltx pool and transaction
//! manager without a server.
//!
//! The mock journals every driver call, keeps a log of committed statements,
//! supports fault injection per call site and artificial query latency, and
//! implements advisory locks that are released when their session drops.
//!
//! ## Example
//!
//! ```rust,ignore
//! use sqltx_testing::{Fault, FaultPoint, MockDatabase};
//! use sqltx_types::DbError;
//!
//! let db = MockDatabase::new();
//! db.inject(Fault::new(FaultPoint::Commit, DbError::with_code("40P01", "deadlock")).times(1));
//!
//! let pool = Pool::builder().build(db.factory()).await?;
//! // first commit fails with a deadlock, the retry succeeds
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod fault;
pub mod mock;

pub use fault::{Fault, FaultPoint, Latency};
pub use mock::{
    FOREIGN_SESSION, JournalEntry, JournalEvent, MockConnection, MockDatabase, MockFactory,
    Statement,
};
