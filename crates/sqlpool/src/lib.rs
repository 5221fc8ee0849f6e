//! # sqlpool
//!
//! Async database connection pool with reuse limits, per-connection
//! prepared-statement caching, and abandonment reaping.
//!
//! The pool sits between application code and a raw physical connection
//! abstraction (see `sqlpool-client`): a small number of expensive
//! physical connections is multiplexed into many short-lived logical
//! connections. Each checkout arms a reaper ticket so connections
//! abandoned by their callers are forcibly reclaimed, and each physical
//! connection carries its own statement cache so repeated preparation of
//! the same statement skips the driver entirely.
//!
//! ## Features
//!
//! - Reuse limits by checkout count and connection age
//! - Per-connection prepared statement cache with error purging
//! - Abandoned-connection detection with captured open-site backtraces
//! - Intermittent connection validation via a configurable query
//! - Fixed-format lifecycle event lines for log-scraping tooling
//!
//! ## Example
//!
//! ```rust,ignore
//! use sqlpool::{Pool, PoolOptions, StatementSpec};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let pool = Pool::builder()
//!     .options(
//!         PoolOptions::new()
//!             .max_size(16)
//!             .abandoned_connection_timeout(Duration::from_secs(300))
//!             .validation_query("SELECT 1"),
//!     )
//!     .build(Arc::new(factory))
//!     .await?;
//!
//! let conn = pool.checkout().await?;
//! let logical = conn.checkout()?;
//! let stmt = logical.prepare(StatementSpec::prepared("SELECT name FROM users")).await?;
//! let rows = stmt.query(&[]).await?;
//! stmt.close().await?; // parked in the cache, not closed
//! logical.close(); // connection returns to the pool
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

mod cache;
pub mod config;
pub mod conn;
pub mod error;
pub mod events;
pub mod pool;
mod reaper;

// Re-export commonly used types
pub use config::PoolOptions;
pub use conn::{
    ConnectionInitializer, ConnectionListener, LogicalConnection, PooledConnection, Statement,
    StatementListener,
};
pub use error::PoolError;
pub use events::{ConnId, EventSink, PoolEvent, StmtId, TracingSink};
pub use pool::{Pool, PoolBuilder, ShutdownHook};

// Re-export the physical abstraction so applications depend on one crate.
pub use sqlpool_client::{
    ClientError, ConnectionFactory, PhysicalConnection, PreparedStatement, SqlValue,
    StatementKind, StatementSpec, same_connection,
};
