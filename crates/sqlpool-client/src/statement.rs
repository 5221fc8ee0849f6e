//! Prepared statement abstraction and the statement identity key.

use async_trait::async_trait;

use crate::error::ClientError;
use crate::value::SqlValue;

/// The flavor of server-side statement a [`StatementSpec`] constructs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatementKind {
    /// Parameterized statement prepared ahead of execution.
    Prepared,
    /// Stored-procedure call.
    Callable,
}

/// Identity of a prepared statement: its kind, SQL text, and the ordered
/// driver options it was constructed with.
///
/// Two specs compare equal exactly when the driver would produce an
/// interchangeable statement for them, which is what makes the spec usable
/// as a cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StatementSpec {
    kind: StatementKind,
    sql: String,
    options: Vec<i64>,
}

impl StatementSpec {
    /// Spec for a parameterized statement.
    pub fn prepared(sql: impl Into<String>) -> Self {
        Self {
            kind: StatementKind::Prepared,
            sql: sql.into(),
            options: Vec::new(),
        }
    }

    /// Spec for a stored-procedure call.
    pub fn callable(sql: impl Into<String>) -> Self {
        Self {
            kind: StatementKind::Callable,
            sql: sql.into(),
            options: Vec::new(),
        }
    }

    /// Attach driver-specific constructor options. Order is significant.
    #[must_use]
    pub fn with_options(mut self, options: impl IntoIterator<Item = i64>) -> Self {
        self.options = options.into_iter().collect();
        self
    }

    /// The statement kind.
    #[must_use]
    pub fn kind(&self) -> StatementKind {
        self.kind
    }

    /// The SQL text.
    #[must_use]
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// The driver options, in construction order.
    #[must_use]
    pub fn options(&self) -> &[i64] {
        &self.options
    }
}

/// A server-side prepared statement owned by one physical connection.
#[async_trait]
pub trait PreparedStatement: Send + Sync {
    /// Execute and return the number of affected rows.
    async fn execute(&self, params: &[SqlValue]) -> Result<u64, ClientError>;

    /// Execute and return all result rows.
    async fn query(&self, params: &[SqlValue]) -> Result<Vec<Vec<SqlValue>>, ClientError>;

    /// Clear bound parameters and any batched state so the statement can
    /// be handed to an unrelated caller.
    async fn reset(&self) -> Result<(), ClientError>;

    /// Release the server-side statement handle.
    async fn close(&self) -> Result<(), ClientError>;

    /// The SQL text this statement was constructed from.
    fn sql(&self) -> &str;
}
