//! Fixed-format pool event lines and the sink that consumes them.
//!
//! The rendered form of each event is part of the external contract:
//! operational tooling scrapes these lines, so the format must stay
//! reproducible. Ambient diagnostics go through `tracing` instead and
//! carry no format guarantee.

use std::fmt;
use std::time::Duration;

/// Identifies a pooled connection in event lines, rendered as `conn#<id>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(pub u64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Identifies a cached statement in event lines, rendered as `stmt#<id>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StmtId(pub u64);

impl fmt::Display for StmtId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stmt#{}", self.0)
    }
}

/// A pool lifecycle event with a stable line rendering.
#[derive(Debug, Clone, PartialEq)]
pub enum PoolEvent {
    /// A physical connection was opened by the factory.
    /// Renders as `pool-open:<duration>:<conn>`.
    Open {
        /// Factory call duration.
        duration: Duration,
        /// The connection opened.
        conn: ConnId,
    },
    /// A physical connection was torn down.
    /// Renders as `pool-close:<duration>:<conn>`.
    Close {
        /// Connection lifetime, from factory initiation to teardown.
        duration: Duration,
        /// The connection closed.
        conn: ConnId,
    },
    /// A connection was offered back for reuse at checkin.
    /// Renders as `pool-reuse:<count>:<age>:<conn>`.
    Reuse {
        /// Completed checkout count.
        count: u64,
        /// Connection age at checkin.
        age: Duration,
        /// The connection offered back.
        conn: ConnId,
    },
    /// A fresh statement was prepared (cache miss).
    /// Renders as `pool-statement-open:<conn>:<stmt>`.
    StatementOpen {
        /// The owning connection.
        conn: ConnId,
        /// The statement prepared.
        stmt: StmtId,
    },
    /// A statement close was intercepted and the statement cached.
    /// Renders as `pool-statement-close:<conn>:<stmt>`.
    StatementClose {
        /// The owning connection.
        conn: ConnId,
        /// The statement cached.
        stmt: StmtId,
    },
    /// A cached statement was handed out (cache hit).
    /// Renders as `pool-statement-reuse:<conn>:<stmt>`.
    StatementReuse {
        /// The owning connection.
        conn: ConnId,
        /// The statement reused.
        stmt: StmtId,
    },
    /// A statement failed and was purged from the cache.
    /// Renders as `pool-statement-error:<conn>:<stmt>`.
    StatementError {
        /// The owning connection.
        conn: ConnId,
        /// The statement purged.
        stmt: StmtId,
    },
}

impl fmt::Display for PoolEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolEvent::Open { duration, conn } => write!(f, "pool-open:{duration:?}:{conn}"),
            PoolEvent::Close { duration, conn } => write!(f, "pool-close:{duration:?}:{conn}"),
            PoolEvent::Reuse { count, age, conn } => {
                write!(f, "pool-reuse:{count}:{age:?}:{conn}")
            }
            PoolEvent::StatementOpen { conn, stmt } => {
                write!(f, "pool-statement-open:{conn}:{stmt}")
            }
            PoolEvent::StatementClose { conn, stmt } => {
                write!(f, "pool-statement-close:{conn}:{stmt}")
            }
            PoolEvent::StatementReuse { conn, stmt } => {
                write!(f, "pool-statement-reuse:{conn}:{stmt}")
            }
            PoolEvent::StatementError { conn, stmt } => {
                write!(f, "pool-statement-error:{conn}:{stmt}")
            }
        }
    }
}

/// Side-effect sink consuming rendered event lines.
///
/// Supplied at pool construction; the pool renders each [`PoolEvent`] and
/// hands the line over. Implementations must not block: they run on the
/// checkout/checkin paths.
pub trait EventSink: Send + Sync {
    /// Consume one rendered event line.
    fn emit(&self, line: &str);
}

/// Default sink: forwards each line to `tracing` at debug level under the
/// `sqlpool::events` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, line: &str) {
        tracing::debug!(target: "sqlpool::events", "{line}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_event_formats() {
        let event = PoolEvent::Open {
            duration: Duration::from_millis(250),
            conn: ConnId(3),
        };
        assert_eq!(event.to_string(), "pool-open:250ms:conn#3");

        let event = PoolEvent::Close {
            duration: Duration::from_secs(2),
            conn: ConnId(3),
        };
        assert_eq!(event.to_string(), "pool-close:2s:conn#3");

        let event = PoolEvent::Reuse {
            count: 7,
            age: Duration::from_secs(61),
            conn: ConnId(12),
        };
        assert_eq!(event.to_string(), "pool-reuse:7:61s:conn#12");
    }

    #[test]
    fn test_statement_event_formats() {
        let conn = ConnId(1);
        let stmt = StmtId(9);
        assert_eq!(
            PoolEvent::StatementOpen { conn, stmt }.to_string(),
            "pool-statement-open:conn#1:stmt#9"
        );
        assert_eq!(
            PoolEvent::StatementClose { conn, stmt }.to_string(),
            "pool-statement-close:conn#1:stmt#9"
        );
        assert_eq!(
            PoolEvent::StatementReuse { conn, stmt }.to_string(),
            "pool-statement-reuse:conn#1:stmt#9"
        );
        assert_eq!(
            PoolEvent::StatementError { conn, stmt }.to_string(),
            "pool-statement-error:conn#1:stmt#9"
        );
    }
}
