//! # sqltx-types
//!
//! Value types shared by the sqltx crates, and the [`Connection`] contract a
//! database driver implements to be pooled and driven by the transaction
//! manager.
//!
//! The database itself is opaque here: a connection can run a parameterized
//! statement, manage a transaction, take advisory locks and answer a health
//! check. Everything else is the driver's business.
//!
//! ## Example
//!
//! ```rust,ignore
//! use sqltx_types::{Connection, IsolationLevel, SqlValue};
//!
//! conn.begin(IsolationLevel::Serializable).await?;
//! let result = conn
//!     .query("UPDATE accounts SET balance = balance - $1 WHERE id = $2", &[
//!         SqlValue::from(25),
//!         SqlValue::from("acct-1"),
//!     ])
//!     .await?;
//! assert_eq!(result.rows_affected, 1);
//! conn.commit().await?;
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod connection;
pub mod error;
pub mod isolation;
pub mod row;
pub mod value;

pub use connection::{Connection, ConnectionFactory, DynConnectionFactory};
pub use error::{DbError, TypeError};
pub use isolation::IsolationLevel;
pub use row::{QueryResult, Row};
pub use value::SqlValue;
