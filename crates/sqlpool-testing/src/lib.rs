//! # sqlpool-testing
//!
//! In-memory stub drivers, scripted factories, and recording sinks for
//! exercising the pool without a database. The pool's scenario tests live
//! in this crate's `tests/` directory; the stubs are also exported for
//! applications that want to test their own pool wiring.

#![warn(missing_docs)]
#![deny(unsafe_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use sqlpool::{ConnectionListener, EventSink, PoolError, PooledConnection, StatementListener};
use sqlpool_client::{
    ClientError, ConnectionFactory, PhysicalConnection, PreparedStatement, SqlValue, StatementSpec,
};

/// An in-memory prepared statement with scripted failures and call
/// counters.
pub struct StubStatement {
    sql: String,
    execute_count: AtomicU64,
    reset_count: AtomicU64,
    closed: AtomicBool,
    fail_execute: Mutex<Option<ClientError>>,
}

impl StubStatement {
    fn new(sql: &str) -> Arc<Self> {
        Arc::new(Self {
            sql: sql.to_string(),
            execute_count: AtomicU64::new(0),
            reset_count: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            fail_execute: Mutex::new(None),
        })
    }

    /// Make the next `execute`/`query` call fail with `error`.
    pub fn fail_next_execute(&self, error: ClientError) {
        *self.fail_execute.lock() = Some(error);
    }

    /// Number of completed executions.
    #[must_use]
    pub fn execute_count(&self) -> u64 {
        self.execute_count.load(Ordering::Acquire)
    }

    /// Number of reset calls.
    #[must_use]
    pub fn reset_count(&self) -> u64 {
        self.reset_count.load(Ordering::Acquire)
    }

    /// Whether the statement was physically closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl PreparedStatement for StubStatement {
    async fn execute(&self, _params: &[SqlValue]) -> Result<u64, ClientError> {
        if let Some(error) = self.fail_execute.lock().take() {
            return Err(error);
        }
        self.execute_count.fetch_add(1, Ordering::AcqRel);
        Ok(1)
    }

    async fn query(&self, _params: &[SqlValue]) -> Result<Vec<Vec<SqlValue>>, ClientError> {
        if let Some(error) = self.fail_execute.lock().take() {
            return Err(error);
        }
        self.execute_count.fetch_add(1, Ordering::AcqRel);
        Ok(Vec::new())
    }

    async fn reset(&self) -> Result<(), ClientError> {
        self.reset_count.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    async fn close(&self) -> Result<(), ClientError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    fn sql(&self) -> &str {
        &self.sql
    }
}

/// An in-memory physical connection.
///
/// Every prepare hands out a fresh [`StubStatement`] and records it so
/// tests can assert on driver-level calls; `query_row` returns a
/// configurable row, defaulting to a single non-null column so validation
/// queries pass.
pub struct StubConnection {
    row: Mutex<Option<Vec<SqlValue>>>,
    statements: Mutex<Vec<Arc<StubStatement>>>,
    prepare_count: AtomicU64,
    query_count: AtomicU64,
    close_count: AtomicU64,
    closed: AtomicBool,
    fail_prepare: Mutex<Option<ClientError>>,
    fail_query: Mutex<Option<ClientError>>,
    fail_close: Mutex<Option<ClientError>>,
}

impl StubConnection {
    /// A healthy connection.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            row: Mutex::new(Some(vec![SqlValue::Int(1)])),
            statements: Mutex::new(Vec::new()),
            prepare_count: AtomicU64::new(0),
            query_count: AtomicU64::new(0),
            close_count: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            fail_prepare: Mutex::new(None),
            fail_query: Mutex::new(None),
            fail_close: Mutex::new(None),
        })
    }

    /// Set the row returned by `query_row`; `None` scripts an empty
    /// result set.
    pub fn set_row(&self, row: Option<Vec<SqlValue>>) {
        *self.row.lock() = row;
    }

    /// Make the next `prepare` call fail with `error`.
    pub fn fail_next_prepare(&self, error: ClientError) {
        *self.fail_prepare.lock() = Some(error);
    }

    /// Make the next `query_row`/`execute` call fail with `error`.
    pub fn fail_next_query(&self, error: ClientError) {
        *self.fail_query.lock() = Some(error);
    }

    /// Make the next `close` call fail with `error`.
    pub fn fail_next_close(&self, error: ClientError) {
        *self.fail_close.lock() = Some(error);
    }

    /// Every statement handed out by `prepare`, in order.
    #[must_use]
    pub fn statements(&self) -> Vec<Arc<StubStatement>> {
        self.statements.lock().clone()
    }

    /// Number of driver-level prepare calls (cache hits never reach the
    /// driver).
    #[must_use]
    pub fn prepare_count(&self) -> u64 {
        self.prepare_count.load(Ordering::Acquire)
    }

    /// Number of one-shot query/execute calls.
    #[must_use]
    pub fn query_count(&self) -> u64 {
        self.query_count.load(Ordering::Acquire)
    }

    /// Number of close calls.
    #[must_use]
    pub fn close_count(&self) -> u64 {
        self.close_count.load(Ordering::Acquire)
    }

    /// Whether the connection was closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl PhysicalConnection for StubConnection {
    async fn prepare(
        &self,
        spec: &StatementSpec,
    ) -> Result<Arc<dyn PreparedStatement>, ClientError> {
        if let Some(error) = self.fail_prepare.lock().take() {
            return Err(error);
        }
        self.prepare_count.fetch_add(1, Ordering::AcqRel);
        let stmt = StubStatement::new(spec.sql());
        self.statements.lock().push(stmt.clone());
        Ok(stmt)
    }

    async fn query_row(&self, _sql: &str) -> Result<Option<Vec<SqlValue>>, ClientError> {
        if let Some(error) = self.fail_query.lock().take() {
            return Err(error);
        }
        self.query_count.fetch_add(1, Ordering::AcqRel);
        Ok(self.row.lock().clone())
    }

    async fn execute(&self, _sql: &str) -> Result<u64, ClientError> {
        if let Some(error) = self.fail_query.lock().take() {
            return Err(error);
        }
        self.query_count.fetch_add(1, Ordering::AcqRel);
        Ok(0)
    }

    async fn close(&self) -> Result<(), ClientError> {
        self.close_count.fetch_add(1, Ordering::AcqRel);
        self.closed.store(true, Ordering::Release);
        if let Some(error) = self.fail_close.lock().take() {
            return Err(error);
        }
        Ok(())
    }

    fn raw(&self) -> &dyn PhysicalConnection {
        self
    }
}

/// One scripted factory outcome.
pub enum ConnectOutcome {
    /// Hand out this prepared connection.
    Connection(Arc<StubConnection>),
    /// Fail with the given error.
    Fail(ClientError),
    /// Never return; exercises the login-timeout cancellation path.
    Hang,
}

enum Exhausted {
    FreshConnection,
    Fail,
}

/// A scripted connection factory.
///
/// Outcomes pushed with [`push`](StubFactory::push) are consumed in order;
/// once the script runs dry the factory either keeps producing fresh
/// healthy connections ([`new`](StubFactory::new)) or keeps failing
/// ([`failing`](StubFactory::failing)).
pub struct StubFactory {
    script: Mutex<VecDeque<ConnectOutcome>>,
    exhausted: Exhausted,
    connects: AtomicU64,
    connections: Mutex<Vec<Arc<StubConnection>>>,
}

impl StubFactory {
    /// A factory that produces fresh healthy connections.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            exhausted: Exhausted::FreshConnection,
            connects: AtomicU64::new(0),
            connections: Mutex::new(Vec::new()),
        })
    }

    /// A factory that fails every connect once its script runs dry.
    #[must_use]
    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            exhausted: Exhausted::Fail,
            connects: AtomicU64::new(0),
            connections: Mutex::new(Vec::new()),
        })
    }

    /// Queue the next connect outcome.
    pub fn push(&self, outcome: ConnectOutcome) {
        self.script.lock().push_back(outcome);
    }

    /// Number of connect calls observed, hung and failed ones included.
    #[must_use]
    pub fn connects(&self) -> u64 {
        self.connects.load(Ordering::Acquire)
    }

    /// Every connection handed out, in order.
    #[must_use]
    pub fn connections(&self) -> Vec<Arc<StubConnection>> {
        self.connections.lock().clone()
    }

    fn record(&self, conn: Arc<StubConnection>) -> Arc<dyn PhysicalConnection> {
        self.connections.lock().push(conn.clone());
        conn
    }
}

#[async_trait]
impl ConnectionFactory for StubFactory {
    async fn connect(&self) -> Result<Arc<dyn PhysicalConnection>, ClientError> {
        self.connects.fetch_add(1, Ordering::AcqRel);
        let outcome = self.script.lock().pop_front();
        match outcome {
            Some(ConnectOutcome::Connection(conn)) => Ok(self.record(conn)),
            Some(ConnectOutcome::Fail(error)) => Err(error),
            Some(ConnectOutcome::Hang) => std::future::pending().await,
            None => match self.exhausted {
                Exhausted::FreshConnection => Ok(self.record(StubConnection::new())),
                Exhausted::Fail => Err(ClientError::Connect("scripted factory failure".into())),
            },
        }
    }
}

/// Event sink that records every rendered line for log-based assertions.
#[derive(Default)]
pub struct RecordingSink {
    lines: Mutex<Vec<String>>,
}

impl RecordingSink {
    /// An empty sink.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// All recorded lines, in emission order.
    #[must_use]
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }

    /// Number of recorded lines starting with `prefix`.
    #[must_use]
    pub fn count_prefix(&self, prefix: &str) -> usize {
        self.lines
            .lock()
            .iter()
            .filter(|line| line.starts_with(prefix))
            .count()
    }

    /// Whether any recorded line starts with `prefix`.
    #[must_use]
    pub fn contains_prefix(&self, prefix: &str) -> bool {
        self.count_prefix(prefix) > 0
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, line: &str) {
        self.lines.lock().push(line.to_string());
    }
}

/// Listener that counts connection and statement notifications.
#[derive(Default)]
pub struct RecordingListener {
    connection_closed: AtomicU64,
    connection_errors: AtomicU64,
    statement_closed: AtomicU64,
    statement_errors: AtomicU64,
}

impl RecordingListener {
    /// A listener with zeroed counters.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Normal checkin notifications observed.
    #[must_use]
    pub fn connection_closed_count(&self) -> u64 {
        self.connection_closed.load(Ordering::Acquire)
    }

    /// Connection error notifications observed.
    #[must_use]
    pub fn connection_error_count(&self) -> u64 {
        self.connection_errors.load(Ordering::Acquire)
    }

    /// Statement close notifications observed.
    #[must_use]
    pub fn statement_closed_count(&self) -> u64 {
        self.statement_closed.load(Ordering::Acquire)
    }

    /// Statement error notifications observed.
    #[must_use]
    pub fn statement_error_count(&self) -> u64 {
        self.statement_errors.load(Ordering::Acquire)
    }
}

impl ConnectionListener for RecordingListener {
    fn connection_closed(&self, _conn: &PooledConnection) {
        self.connection_closed.fetch_add(1, Ordering::AcqRel);
    }

    fn connection_error(&self, _conn: &PooledConnection, _error: &PoolError) {
        self.connection_errors.fetch_add(1, Ordering::AcqRel);
    }
}

impl StatementListener for RecordingListener {
    fn statement_closed(&self, _conn: &PooledConnection, _sql: &str) {
        self.statement_closed.fetch_add(1, Ordering::AcqRel);
    }

    fn statement_error(&self, _conn: &PooledConnection, _sql: &str, _error: &ClientError) {
        self.statement_errors.fetch_add(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stub_connection_scripts_one_failure() {
        tokio_test::block_on(async {
            let conn = StubConnection::new();
            assert!(conn.query_row("SELECT 1").await.unwrap().is_some());

            conn.fail_next_query(ClientError::Driver("scripted".into()));
            assert!(conn.query_row("SELECT 1").await.is_err());
            // Failures are one-shot.
            assert!(conn.query_row("SELECT 1").await.is_ok());
            assert_eq!(conn.query_count(), 2);
        });
    }

    #[test]
    fn test_stub_factory_script_then_default() {
        tokio_test::block_on(async {
            let factory = StubFactory::new();
            factory.push(ConnectOutcome::Fail(ClientError::Connect("down".into())));

            assert!(factory.connect().await.is_err());
            assert!(factory.connect().await.is_ok());
            assert_eq!(factory.connects(), 2);
            assert_eq!(factory.connections().len(), 1);
        });
    }

    #[test]
    fn test_recording_sink_prefix_counts() {
        let sink = RecordingSink::new();
        sink.emit("pool-open:1ms:conn#1");
        sink.emit("pool-reuse:1:2s:conn#1");
        sink.emit("pool-reuse:2:3s:conn#1");

        assert_eq!(sink.count_prefix("pool-reuse:"), 2);
        assert!(sink.contains_prefix("pool-open:"));
        assert!(!sink.contains_prefix("pool-close:"));
        assert_eq!(sink.lines().len(), 3);
    }
}
