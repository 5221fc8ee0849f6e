//! Pooled connection lifecycle.
//!
//! A [`PooledConnection`] owns one physical connection for its whole life
//! and hands out at most one [`LogicalConnection`] at a time. Three
//! independent triggers can end a checkout — the application closing the
//! logical connection, an asynchronous error, and the reaper firing — and
//! every state transition between them is serialized by one per-instance
//! mutex so that exactly one path performs the physical teardown and
//! notifies the pool.

use std::backtrace::Backtrace;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use sqlpool_client::{
    ClientError, PhysicalConnection, PreparedStatement, SqlValue, StatementSpec, same_connection,
};

use crate::cache::{CachedStatement, StatementCache};
use crate::error::PoolError;
use crate::events::{ConnId, EventSink, PoolEvent, StmtId};
use crate::reaper::Reaper;

/// Decorator applied to each freshly opened logical connection.
///
/// The returned connection's [`raw()`](PhysicalConnection::raw) chain must
/// reach the connection passed in; the pool verifies this on first open
/// and rejects initializers that break the delegation. The initializer
/// runs under the connection's state mutex and must not call back into
/// the [`PooledConnection`] it is initializing.
pub type ConnectionInitializer = Arc<
    dyn Fn(Arc<dyn PhysicalConnection>) -> Result<Arc<dyn PhysicalConnection>, ClientError>
        + Send
        + Sync,
>;

/// Observes logical close and teardown transitions of a pooled connection.
///
/// Listeners run after pool bookkeeping with no ordering guarantee between
/// them, and must not block.
pub trait ConnectionListener: Send + Sync {
    /// A logical connection was checked in normally.
    fn connection_closed(&self, conn: &PooledConnection);

    /// The connection was torn down by an error.
    fn connection_error(&self, conn: &PooledConnection, error: &PoolError);
}

/// Observes statement cache transitions on a pooled connection.
pub trait StatementListener: Send + Sync {
    /// A statement close was intercepted and the statement cached.
    fn statement_closed(&self, conn: &PooledConnection, sql: &str);

    /// A statement failed and was purged from the cache.
    fn statement_error(&self, conn: &PooledConnection, sql: &str, error: &ClientError);
}

/// Pool-side notifications, invoked after per-connection bookkeeping with
/// no lock held.
pub(crate) struct PoolHooks {
    /// A checkout completed normally; the pool decides reuse or retirement.
    pub(crate) on_checkin: Box<dyn Fn(Arc<PooledConnection>) + Send + Sync>,
    /// Physical teardown completed. Fires exactly once per connection.
    pub(crate) on_close: Box<dyn Fn(Arc<PooledConnection>) + Send + Sync>,
}

/// Everything the pool supplies when it opens a connection.
pub(crate) struct NewConnection {
    pub(crate) id: u64,
    pub(crate) initiated_at: Instant,
    pub(crate) physical: Arc<dyn PhysicalConnection>,
    pub(crate) initializer: Option<ConnectionInitializer>,
    pub(crate) abandoned_timeout: Duration,
    pub(crate) reaper: Arc<Reaper>,
    pub(crate) sink: Arc<dyn EventSink>,
    pub(crate) stmt_ids: Arc<AtomicU64>,
    pub(crate) hooks: PoolHooks,
}

/// Rolling statistics over completed usage segments.
#[derive(Default)]
struct Segments {
    last_started: Option<Instant>,
    last_ended: Option<Instant>,
    last_duration: Option<Duration>,
    average_duration: Option<Duration>,
    max_duration: Option<Duration>,
    count: u64,
}

impl Segments {
    /// Fold one finished segment into the rolling stats.
    fn record(&mut self, started: Instant, ended: Instant) {
        let duration = ended.duration_since(started);
        self.last_started = Some(started);
        self.last_ended = Some(ended);
        self.last_duration = Some(duration);
        self.max_duration = Some(self.max_duration.map_or(duration, |max| max.max(duration)));
        self.average_duration = Some(match self.average_duration {
            None => duration,
            Some(average) => {
                let completed = u32::try_from(self.count).unwrap_or(u32::MAX - 1);
                (average * completed + duration) / (completed + 1)
            }
        });
        self.count += 1;
    }
}

/// State guarded by the per-connection mutex.
struct ConnState {
    /// Start of the live checkout, if one exists.
    logical_opened_at: Option<Instant>,
    /// Set by a successful validation pass, consumed by the next checkout.
    validated: bool,
    /// Reaper ticket armed for the live checkout.
    reaper_ticket: Option<u64>,
    /// Initialized view of the physical connection, set on first open.
    active: Option<Arc<dyn PhysicalConnection>>,
    /// Terminal-state guard: once set, no transition is performed again.
    closed: bool,
    /// Error that forced the teardown, if any.
    error: Option<Arc<PoolError>>,
    segments: Segments,
}

/// One physical connection under pool management.
///
/// Obtained from [`Pool::checkout`](crate::Pool::checkout); call
/// [`checkout`](PooledConnection::checkout) to open the logical view.
pub struct PooledConnection {
    id: u64,
    initiated_at: Instant,
    opened_at: Instant,
    physical: Arc<dyn PhysicalConnection>,
    initializer: Option<ConnectionInitializer>,
    abandoned_timeout: Duration,
    reaper: Arc<Reaper>,
    sink: Arc<dyn EventSink>,
    stmt_ids: Arc<AtomicU64>,
    hooks: PoolHooks,
    cache: StatementCache,
    state: Mutex<ConnState>,
    conn_listeners: Mutex<Vec<Arc<dyn ConnectionListener>>>,
    stmt_listeners: Mutex<Vec<Arc<dyn StatementListener>>>,
    self_weak: Weak<PooledConnection>,
}

impl PooledConnection {
    pub(crate) fn new(seed: NewConnection) -> Arc<Self> {
        Arc::new_cyclic(|self_weak| Self {
            id: seed.id,
            initiated_at: seed.initiated_at,
            opened_at: Instant::now(),
            physical: seed.physical,
            initializer: seed.initializer,
            abandoned_timeout: seed.abandoned_timeout,
            reaper: seed.reaper,
            sink: seed.sink,
            stmt_ids: seed.stmt_ids,
            hooks: seed.hooks,
            cache: StatementCache::default(),
            state: Mutex::new(ConnState {
                logical_opened_at: None,
                validated: false,
                reaper_ticket: None,
                active: None,
                closed: false,
                error: None,
                segments: Segments::default(),
            }),
            conn_listeners: Mutex::new(Vec::new()),
            stmt_listeners: Mutex::new(Vec::new()),
            self_weak: self_weak.clone(),
        })
    }

    /// Open the logical view of this connection.
    ///
    /// Fails with [`PoolError::AlreadyConnected`] while a logical
    /// connection is live and with [`PoolError::Closed`] — chaining the
    /// terminal cause — after teardown. On success a reaper ticket is
    /// armed for the abandonment timeout, capturing the current call
    /// stack for the reaper's diagnostics.
    pub fn checkout(&self) -> Result<LogicalConnection, PoolError> {
        let me = self.me()?;
        let mut state = self.state.lock();
        if state.closed {
            return Err(PoolError::Closed {
                cause: state.error.clone(),
            });
        }

        if state.logical_opened_at.is_some() {
            if state.validated {
                // Handoff after a validation pass: the ticket armed during
                // validation stays armed for this checkout.
                state.validated = false;
                let active = state.active.clone().unwrap_or_else(|| self.physical.clone());
                return Ok(LogicalConnection::new(me, active));
            }
            return Err(PoolError::AlreadyConnected);
        }

        let active = match state.active.clone() {
            Some(active) => active,
            None => {
                let active = self.initialize()?;
                state.active = Some(active.clone());
                active
            }
        };

        let opened_by = Arc::new(Backtrace::capture());
        let ticket = self
            .reaper
            .arm(self.self_weak.clone(), self.abandoned_timeout, opened_by);
        state.reaper_ticket = Some(ticket);
        state.logical_opened_at = Some(Instant::now());
        tracing::trace!(conn = self.id, "logical connection opened");
        Ok(LogicalConnection::new(me, active))
    }

    /// Apply the connection initializer on first open and verify it still
    /// delegates to the original connection.
    fn initialize(&self) -> Result<Arc<dyn PhysicalConnection>, PoolError> {
        let base = self.physical.clone();
        let Some(initializer) = &self.initializer else {
            return Ok(base);
        };
        let initialized = initializer(base.clone()).map_err(PoolError::Connection)?;
        if !same_connection(initialized.raw(), base.as_ref()) {
            return Err(PoolError::Config(
                "connection initializer must preserve raw() delegation to the original connection"
                    .into(),
            ));
        }
        Ok(initialized)
    }

    /// Close the physical connection and retire this instance.
    ///
    /// Idempotent: exactly one caller performs the teardown and the pool's
    /// on-close notification; a second call is a no-op returning `Ok(())`.
    /// Teardown never fails fast — every step runs and failures come back
    /// as one aggregated error.
    pub async fn close(&self) -> Result<(), PoolError> {
        self.close_with_cause(None).await
    }

    pub(crate) async fn close_with_cause(
        &self,
        cause: Option<Arc<PoolError>>,
    ) -> Result<(), PoolError> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            state.error = cause;
            if state.logical_opened_at.is_some() {
                self.finish_segment(&mut state);
            }
        }
        self.teardown().await
    }

    /// Forced teardown scheduled at checkout. A stale ticket — the logical
    /// connection was checked in, or a newer checkout re-armed — is a
    /// no-op.
    pub(crate) async fn reap(&self, ticket: u64, opened_by: &Backtrace) {
        {
            let mut state = self.state.lock();
            if state.closed || state.reaper_ticket != Some(ticket) {
                return;
            }
            state.closed = true;
            self.finish_segment(&mut state);
        }
        match self.teardown().await {
            Ok(()) => tracing::warn!(
                conn = self.id,
                opened_by = %opened_by,
                "abandoned connection reclaimed"
            ),
            Err(error) => tracing::warn!(
                conn = self.id,
                %error,
                opened_by = %opened_by,
                "abandoned connection teardown failed"
            ),
        }
    }

    /// Post-transition teardown. Runs only on the path that won the closed
    /// flag: closes the physical connection, records the failure as the
    /// terminal cause when none was set, and notifies the pool once.
    async fn teardown(&self) -> Result<(), PoolError> {
        let mut errors = Vec::new();
        if let Err(error) = self.physical.close().await {
            let mut state = self.state.lock();
            if state.error.is_none() {
                state.error = Some(Arc::new(PoolError::Connection(error.clone())));
            }
            errors.push(PoolError::Connection(error));
        }
        if let Ok(me) = self.me() {
            (self.hooks.on_close)(me);
        }
        match PoolError::aggregate(errors) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Connection-level failure: tear down and fan the decorated error out
    /// to listeners, then hand the original error back to the caller.
    pub(crate) async fn fail_connection(&self, error: ClientError) -> PoolError {
        self.fail_with(Arc::new(PoolError::Connection(error.clone())))
            .await;
        PoolError::Connection(error)
    }

    async fn fail_with(&self, error: Arc<PoolError>) {
        tracing::info!(conn = self.id, %error, "connection error; closing");
        if let Err(teardown_error) = self.close_with_cause(Some(error.clone())).await {
            tracing::debug!(conn = self.id, error = %teardown_error, "teardown after error failed");
        }
        let listeners = self.conn_listeners.lock().clone();
        for listener in listeners {
            listener.connection_error(self, &error);
        }
    }

    /// Pre-emptively open the logical view and run the validation query.
    /// Success leaves the connection validated; the next [`checkout`]
    /// consumes the flag and hands out the wrapper without re-arming.
    ///
    /// [`checkout`]: PooledConnection::checkout
    pub(crate) async fn validate(&self, query: &str) -> Result<(), PoolError> {
        let logical = self.checkout()?;
        let row = logical.query_row(query).await?;
        let valid = row
            .as_ref()
            .and_then(|columns| columns.first())
            .is_some_and(|value| !value.is_null());
        if !valid {
            logical.defuse();
            let error = Arc::new(PoolError::Validation {
                query: query.to_string(),
            });
            self.fail_with(error).await;
            return Err(PoolError::Validation {
                query: query.to_string(),
            });
        }
        logical.defuse();
        self.state.lock().validated = true;
        Ok(())
    }

    /// Normal checkin from the logical wrapper.
    fn logical_closed(&self) {
        {
            let mut state = self.state.lock();
            if state.closed || state.logical_opened_at.is_none() {
                // The wrapper lost a race against an error or the reaper;
                // that path already accounted the segment.
                return;
            }
            self.finish_segment(&mut state);
        }
        tracing::trace!(conn = self.id, "logical connection closed");
        let listeners = self.conn_listeners.lock().clone();
        for listener in listeners {
            listener.connection_closed(self);
        }
        if let Ok(me) = self.me() {
            (self.hooks.on_checkin)(me);
        }
    }

    /// Cancel the reaper ticket and fold the finished segment into the
    /// rolling statistics. Caller holds the state lock.
    fn finish_segment(&self, state: &mut ConnState) {
        if let Some(ticket) = state.reaper_ticket.take() {
            self.reaper.cancel(ticket);
        }
        let Some(started) = state.logical_opened_at.take() else {
            return;
        };
        state.validated = false;
        state.segments.record(started, Instant::now());
    }

    /// Park a statement for reuse after its intercepted close; falls back
    /// to a real close when the statement is no longer indexed.
    pub(crate) async fn park_statement(
        &self,
        stmt: Arc<dyn PreparedStatement>,
        id: u64,
    ) -> Result<(), PoolError> {
        if let Err(error) = stmt.reset().await {
            self.statement_error(id, stmt.as_ref(), &error).await;
            return Err(PoolError::Statement(error));
        }
        if self.cache.park(CachedStatement {
            stmt: stmt.clone(),
            id,
        }) {
            self.emit(PoolEvent::StatementClose {
                conn: self.conn_id(),
                stmt: StmtId(id),
            });
            let listeners = self.stmt_listeners.lock().clone();
            for listener in listeners {
                listener.statement_closed(self, stmt.sql());
            }
            Ok(())
        } else {
            // Purged while checked out: close it for real.
            stmt.close().await.map_err(PoolError::Statement)
        }
    }

    /// Statement-scoped failure: purge from the cache, close the physical
    /// statement best-effort, notify listeners. The connection stays
    /// usable.
    pub(crate) async fn statement_error(
        &self,
        id: u64,
        stmt: &dyn PreparedStatement,
        error: &ClientError,
    ) {
        tracing::info!(conn = self.id, stmt = id, %error, "statement error; purging from cache");
        self.cache.purge(id);
        if let Err(close_error) = stmt.close().await {
            tracing::debug!(
                conn = self.id,
                stmt = id,
                error = %close_error,
                "statement close failed after error"
            );
        }
        self.emit(PoolEvent::StatementError {
            conn: self.conn_id(),
            stmt: StmtId(id),
        });
        let listeners = self.stmt_listeners.lock().clone();
        for listener in listeners {
            listener.statement_error(self, stmt.sql(), error);
        }
    }

    /// Register a connection listener.
    pub fn add_connection_listener(&self, listener: Arc<dyn ConnectionListener>) {
        self.conn_listeners.lock().push(listener);
    }

    /// Register a statement listener.
    pub fn add_statement_listener(&self, listener: Arc<dyn StatementListener>) {
        self.stmt_listeners.lock().push(listener);
    }

    /// Pool-assigned connection id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// When the factory call for this connection was initiated.
    #[must_use]
    pub fn initiated_at(&self) -> Instant {
        self.initiated_at
    }

    /// When the factory call completed and the connection entered the pool.
    #[must_use]
    pub fn opened_at(&self) -> Instant {
        self.opened_at
    }

    /// Start of the live checkout, if one exists.
    #[must_use]
    pub fn logical_opened_at(&self) -> Option<Instant> {
        self.state.lock().logical_opened_at
    }

    /// Start of the last completed usage segment.
    #[must_use]
    pub fn last_segment_started(&self) -> Option<Instant> {
        self.state.lock().segments.last_started
    }

    /// End of the last completed usage segment.
    #[must_use]
    pub fn last_segment_ended(&self) -> Option<Instant> {
        self.state.lock().segments.last_ended
    }

    /// Duration of the last completed usage segment.
    #[must_use]
    pub fn last_segment_duration(&self) -> Option<Duration> {
        self.state.lock().segments.last_duration
    }

    /// Running average duration over completed usage segments.
    #[must_use]
    pub fn average_segment_duration(&self) -> Option<Duration> {
        self.state.lock().segments.average_duration
    }

    /// Longest completed usage segment.
    #[must_use]
    pub fn max_segment_duration(&self) -> Option<Duration> {
        self.state.lock().segments.max_duration
    }

    /// Number of completed checkouts.
    #[must_use]
    pub fn reuse_count(&self) -> u64 {
        self.state.lock().segments.count
    }

    /// Age of this connection, measured from factory initiation.
    #[must_use]
    pub fn age(&self) -> Duration {
        self.initiated_at.elapsed()
    }

    /// Whether this connection has been torn down.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// The error that invalidated this connection, if teardown was
    /// error-triggered.
    #[must_use]
    pub fn error(&self) -> Option<Arc<PoolError>> {
        self.state.lock().error.clone()
    }

    pub(crate) fn conn_id(&self) -> ConnId {
        ConnId(self.id)
    }

    pub(crate) fn emit(&self, event: PoolEvent) {
        self.sink.emit(&event.to_string());
    }

    fn next_stmt_id(&self) -> u64 {
        self.stmt_ids.fetch_add(1, Ordering::Relaxed)
    }

    /// Strong handle to self. Every instance lives inside the `Arc` built
    /// by [`new`](PooledConnection::new), so this only fails during the
    /// final drop, when no caller can hold `&self` anyway.
    fn me(&self) -> Result<Arc<PooledConnection>, PoolError> {
        self.self_weak
            .upgrade()
            .ok_or(PoolError::Closed { cause: None })
    }
}

impl fmt::Display for PooledConnection {
    // JSON-shaped diagnostic summary, the shape operators see in logs.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        write!(
            f,
            "{{\"id\":{},\"age\":\"{:?}\",\"reuseCount\":{},\"inUse\":{},\"closed\":{}}}",
            self.id,
            self.initiated_at.elapsed(),
            state.segments.count,
            state.logical_opened_at.is_some(),
            state.closed,
        )
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("reuse_count", &self.reuse_count())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// The logical connection handed to the caller for one checkout.
///
/// Valid between checkout and checkin; a new wrapper is created for every
/// checkout even though the physical connection underneath is reused.
/// Dropping the wrapper checks the connection in; [`close`] does the same
/// explicitly. Statement preparation and close are intercepted for the
/// per-connection cache; everything else passes through to the physical
/// connection unchanged.
///
/// [`close`]: LogicalConnection::close
pub struct LogicalConnection {
    conn: Arc<PooledConnection>,
    active: Arc<dyn PhysicalConnection>,
    closed: AtomicBool,
}

impl LogicalConnection {
    fn new(conn: Arc<PooledConnection>, active: Arc<dyn PhysicalConnection>) -> Self {
        Self {
            conn,
            active,
            closed: AtomicBool::new(false),
        }
    }

    /// The pooled connection this wrapper belongs to.
    #[must_use]
    pub fn pooled(&self) -> &Arc<PooledConnection> {
        &self.conn
    }

    /// The raw physical connection at the bottom of the decorator chain.
    #[must_use]
    pub fn raw(&self) -> &dyn PhysicalConnection {
        self.active.raw()
    }

    /// Prepare a statement, consulting the per-connection cache first.
    ///
    /// A cache hit skips the driver's prepare call entirely; a miss
    /// delegates to the physical connection and records the fresh
    /// statement in the cache's reverse index.
    pub async fn prepare(&self, spec: StatementSpec) -> Result<Statement, PoolError> {
        self.ensure_open()?;
        if let Some(cached) = self.conn.cache.take(&spec) {
            self.conn.emit(PoolEvent::StatementReuse {
                conn: self.conn.conn_id(),
                stmt: StmtId(cached.id),
            });
            return Ok(Statement::new(self.conn.clone(), cached.stmt, cached.id));
        }
        match self.active.prepare(&spec).await {
            Ok(stmt) => {
                let id = self.conn.next_stmt_id();
                self.conn.cache.register(id, spec);
                self.conn.emit(PoolEvent::StatementOpen {
                    conn: self.conn.conn_id(),
                    stmt: StmtId(id),
                });
                Ok(Statement::new(self.conn.clone(), stmt, id))
            }
            Err(error) => Err(self.conn.fail_connection(error).await),
        }
    }

    /// Run a one-shot statement and return its first row.
    ///
    /// Plain statements close as soon as the call returns and never enter
    /// the cache.
    pub async fn query_row(&self, sql: &str) -> Result<Option<Vec<SqlValue>>, PoolError> {
        self.ensure_open()?;
        match self.active.query_row(sql).await {
            Ok(row) => Ok(row),
            Err(error) => Err(self.conn.fail_connection(error).await),
        }
    }

    /// Run a one-shot statement that returns no rows.
    pub async fn execute(&self, sql: &str) -> Result<u64, PoolError> {
        self.ensure_open()?;
        match self.active.execute(sql).await {
            Ok(affected) => Ok(affected),
            Err(error) => Err(self.conn.fail_connection(error).await),
        }
    }

    /// Return the connection to the pool. Equivalent to dropping the
    /// wrapper; both paths check in exactly once.
    pub fn close(self) {
        self.checkin();
    }

    /// Mark the wrapper closed without checking in. Used by validation,
    /// which leaves the logical connection open for the imminent handoff.
    pub(crate) fn defuse(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn checkin(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.conn.logical_closed();
    }

    fn ensure_open(&self) -> Result<(), PoolError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PoolError::Closed { cause: None });
        }
        let state = self.conn.state.lock();
        if state.closed {
            return Err(PoolError::Closed {
                cause: state.error.clone(),
            });
        }
        Ok(())
    }
}

impl fmt::Debug for LogicalConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogicalConnection")
            .field("conn", &self.conn)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Drop for LogicalConnection {
    fn drop(&mut self) {
        self.checkin();
    }
}

/// A logical prepared statement.
///
/// Close is intercepted: the physical statement is reset and parked in the
/// owning connection's cache instead of being closed, ready for the next
/// [`prepare`](LogicalConnection::prepare) with the same spec. Execution
/// errors purge it from the cache permanently.
pub struct Statement {
    conn: Arc<PooledConnection>,
    inner: Arc<dyn PreparedStatement>,
    id: u64,
    closed: AtomicBool,
}

impl Statement {
    fn new(conn: Arc<PooledConnection>, inner: Arc<dyn PreparedStatement>, id: u64) -> Self {
        Self {
            conn,
            inner,
            id,
            closed: AtomicBool::new(false),
        }
    }

    /// Execute and return the number of affected rows.
    pub async fn execute(&self, params: &[SqlValue]) -> Result<u64, PoolError> {
        self.ensure_open()?;
        match self.inner.execute(params).await {
            Ok(affected) => Ok(affected),
            Err(error) => Err(self.fail(error).await),
        }
    }

    /// Execute and return all result rows.
    pub async fn query(&self, params: &[SqlValue]) -> Result<Vec<Vec<SqlValue>>, PoolError> {
        self.ensure_open()?;
        match self.inner.query(params).await {
            Ok(rows) => Ok(rows),
            Err(error) => Err(self.fail(error).await),
        }
    }

    /// The SQL text this statement was prepared from.
    #[must_use]
    pub fn sql(&self) -> &str {
        self.inner.sql()
    }

    /// The raw prepared statement.
    #[must_use]
    pub fn raw(&self) -> &dyn PreparedStatement {
        self.inner.as_ref()
    }

    /// Intercepted close: clears statement state and parks the physical
    /// statement for reuse instead of closing it.
    pub async fn close(self) -> Result<(), PoolError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.conn
            .park_statement(self.inner.clone(), self.id)
            .await
    }

    async fn fail(&self, error: ClientError) -> PoolError {
        self.closed.store(true, Ordering::Release);
        self.conn
            .statement_error(self.id, self.inner.as_ref(), &error)
            .await;
        PoolError::Statement(error)
    }

    fn ensure_open(&self) -> Result<(), PoolError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PoolError::Closed { cause: None });
        }
        Ok(())
    }
}

impl fmt::Debug for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Statement")
            .field("conn", &self.conn)
            .field("id", &self.id)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Drop for Statement {
    fn drop(&mut self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        // Dropped without close: park it best-effort so the reuse slot is
        // not lost. Outside a runtime the statement is simply forfeited.
        let conn = self.conn.clone();
        let inner = self.inner.clone();
        let id = self.id;
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(error) = conn.park_statement(inner, id).await {
                    tracing::debug!(conn = conn.id(), stmt = id, %error, "parking dropped statement failed");
                }
            });
        }
    }
}
