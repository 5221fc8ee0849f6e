//! Driver-level error types.

use thiserror::Error;

/// Errors surfaced by a physical driver implementation.
///
/// Payloads are plain strings so drivers with arbitrary native error types
/// can be adapted without threading generics through the pool.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    /// Establishing the physical connection failed.
    #[error("connection failed: {0}")]
    Connect(String),

    /// The physical connection dropped or was closed underneath an operation.
    #[error("connection lost: {0}")]
    Disconnected(String),

    /// A statement-scoped failure: preparation, execution, or close.
    #[error("statement failed: {0}")]
    Statement(String),

    /// Any other driver failure.
    #[error("driver error: {0}")]
    Driver(String),
}
