//! Physical connection and factory traits.
//!
//! A physical connection is the expensive, one-at-a-time resource the pool
//! multiplexes. The pool never inspects what is behind these traits; it
//! only sequences prepare/close operations and ownership transitions.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::ClientError;
use crate::statement::{PreparedStatement, StatementSpec};
use crate::value::SqlValue;

/// A raw database connection as exposed by a driver.
///
/// Exactly one pool-side owner holds a physical connection at a time, and
/// only that owner destroys it.
#[async_trait]
pub trait PhysicalConnection: Send + Sync {
    /// Prepare the server-side statement described by `spec`.
    async fn prepare(&self, spec: &StatementSpec) -> Result<Arc<dyn PreparedStatement>, ClientError>;

    /// Run a one-shot statement and return its first row, if any.
    ///
    /// The statement is plain (not prepared): it closes as soon as the call
    /// returns and implementations must not retain it.
    async fn query_row(&self, sql: &str) -> Result<Option<Vec<SqlValue>>, ClientError>;

    /// Run a one-shot statement that returns no rows; returns the affected
    /// row count. Plain-statement semantics as for [`query_row`].
    ///
    /// [`query_row`]: PhysicalConnection::query_row
    async fn execute(&self, sql: &str) -> Result<u64, ClientError>;

    /// Close the physical connection and release its server resources.
    async fn close(&self) -> Result<(), ClientError>;

    /// The raw connection at the bottom of the decorator chain.
    ///
    /// Decorators forward this to the connection they wrap; raw driver
    /// connections return themselves. Pool code relies on this to verify
    /// that a connection initializer still delegates to the connection it
    /// was given.
    fn raw(&self) -> &dyn PhysicalConnection;
}

/// Whether two connection handles refer to the same underlying object.
///
/// Compares the data addresses of the trait objects, ignoring vtable
/// metadata, so a handle and the `raw()` result of a decorator around it
/// compare equal.
#[must_use]
pub fn same_connection(a: &dyn PhysicalConnection, b: &dyn PhysicalConnection) -> bool {
    std::ptr::addr_eq(a, b)
}

/// Produces new physical connections for the pool.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Establish a new physical connection.
    ///
    /// Every call must return a newly established connection. Calls may
    /// block, fail, or never return; the pool bounds each call with its
    /// login-timeout deadline and drops the future on expiry, so
    /// implementations must tolerate cancellation at any await point.
    async fn connect(&self) -> Result<Arc<dyn PhysicalConnection>, ClientError>;
}
