//! Pool error types.

use std::sync::Arc;
use std::time::Duration;

use sqlpool_client::ClientError;
use thiserror::Error;

/// Convenience alias for pool results.
pub type Result<T> = std::result::Result<T, PoolError>;

/// Errors produced by the pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The connection factory failed to produce a physical connection.
    #[error("connection factory failed after {attempts} attempt(s)")]
    Factory {
        /// Checkout attempts made before giving up.
        attempts: u32,
        /// The last factory failure.
        #[source]
        source: ClientError,
    },

    /// The login deadline expired before a connection could be produced.
    ///
    /// Distinct from [`PoolError::Factory`]: the in-flight factory call is
    /// canceled on expiry, never left running outside pool tracking.
    #[error("checkout deadline exceeded (login timeout {login_timeout:?})")]
    Timeout {
        /// The login timeout that bounded the checkout.
        login_timeout: Duration,
    },

    /// `checkout()` was called while a logical connection is already live.
    #[error("a logical connection is already open")]
    AlreadyConnected,

    /// Operation on a connection or pool that has been torn down.
    #[error("connection closed")]
    Closed {
        /// Terminal error that forced the teardown, if any.
        #[source]
        cause: Option<Arc<PoolError>>,
    },

    /// The validation query produced no row, or a null first column.
    #[error("validation query produced no non-null result: {query}")]
    Validation {
        /// The configured validation query.
        query: String,
    },

    /// A statement-scoped failure. The statement is purged from the cache;
    /// the owning connection stays usable.
    #[error("statement failed")]
    Statement(#[source] ClientError),

    /// A connection-level driver failure. The connection is torn down.
    #[error("connection failed")]
    Connection(#[source] ClientError),

    /// Ill-formed configuration input.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Connections had to be force-closed after the graceful shutdown window.
    #[error("{forced} connection(s) force-closed after graceful shutdown window {timeout:?}")]
    Shutdown {
        /// Number of connections force-closed.
        forced: usize,
        /// The graceful window that was exhausted first.
        timeout: Duration,
    },

    /// Several teardown steps failed. Every step still ran; this carries
    /// the first failure plus everything suppressed along the way.
    #[error("{primary}; {} suppressed error(s)", .suppressed.len())]
    Composite {
        /// The first failure encountered.
        primary: Box<PoolError>,
        /// Failures suppressed while the remaining steps ran.
        suppressed: Vec<PoolError>,
    },
}

impl PoolError {
    /// Fold a list of failures into one error, preserving every entry.
    /// Returns `None` when nothing failed.
    pub(crate) fn aggregate(mut errors: Vec<PoolError>) -> Option<PoolError> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => {
                let primary = Box::new(errors.remove(0));
                Some(PoolError::Composite {
                    primary,
                    suppressed: errors,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate_empty_is_none() {
        assert!(PoolError::aggregate(Vec::new()).is_none());
    }

    #[test]
    fn test_aggregate_single_passes_through() {
        let err = PoolError::aggregate(vec![PoolError::AlreadyConnected]);
        assert!(matches!(err, Some(PoolError::AlreadyConnected)));
    }

    #[test]
    fn test_aggregate_many_builds_composite() {
        let err = PoolError::aggregate(vec![
            PoolError::AlreadyConnected,
            PoolError::Config("x".into()),
            PoolError::Config("y".into()),
        ]);
        match err {
            Some(PoolError::Composite {
                primary,
                suppressed,
            }) => {
                assert!(matches!(*primary, PoolError::AlreadyConnected));
                assert_eq!(suppressed.len(), 2);
            }
            other => panic!("expected composite, got {other:?}"),
        }
    }

    #[test]
    fn test_closed_chains_cause() {
        let cause = Arc::new(PoolError::Validation {
            query: "SELECT 1".into(),
        });
        let err = PoolError::Closed {
            cause: Some(cause.clone()),
        };
        let source = std::error::Error::source(&err);
        assert!(source.is_some_and(|s| s.to_string().contains("SELECT 1")));
    }
}
