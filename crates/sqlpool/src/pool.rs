//! Connection pool implementation.
//!
//! The pool brokers checkout requests against the connection factory,
//! tracks every open connection, and keeps a queue of idle connections
//! eligible for reuse. Per-connection lifecycle lives in [`crate::conn`];
//! this module owns the collections, the capacity gate, and the
//! reuse/retire decisions.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use sqlpool_client::ConnectionFactory;
use tokio::sync::Notify;

use crate::config::{DEFAULT_LOGIN_TIMEOUT, PoolOptions};
use crate::conn::{ConnectionInitializer, NewConnection, PoolHooks, PooledConnection};
use crate::error::PoolError;
use crate::events::{ConnId, EventSink, PoolEvent, TracingSink};
use crate::reaper::Reaper;

/// Hook invoked once after pool shutdown has closed every connection.
pub type ShutdownHook = Box<dyn FnOnce() + Send>;

/// An async database connection pool.
///
/// Multiplexes a bounded set of physical connections — produced by a
/// [`ConnectionFactory`] — into many short-lived logical connections, with
/// per-connection reuse limits, statement caching, and abandonment
/// reaping.
///
/// # Example
///
/// ```rust,ignore
/// use sqlpool::{Pool, PoolOptions};
/// use std::sync::Arc;
///
/// let pool = Pool::builder()
///     .options(PoolOptions::new().max_size(16))
///     .build(Arc::new(factory))
///     .await?;
///
/// let conn = pool.checkout().await?;
/// let logical = conn.checkout()?;
/// let stmt = logical.prepare(StatementSpec::prepared("SELECT 1")).await?;
/// // ...
/// stmt.close().await?;
/// logical.close(); // back to the pool for reuse
/// ```
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    options: RwLock<PoolOptions>,
    factory: Arc<dyn ConnectionFactory>,
    initializer: Mutex<Option<ConnectionInitializer>>,
    shutdown_hook: Mutex<Option<ShutdownHook>>,
    /// Every connection checked out from the factory, idle or in use.
    open: Mutex<Vec<Arc<PooledConnection>>>,
    /// Idle connections eligible for checkout.
    reusable: Mutex<VecDeque<Arc<PooledConnection>>>,
    /// Checkouts currently holding a capacity slot.
    pending: Mutex<usize>,
    closed: AtomicBool,
    notify: Notify,
    reaper: Arc<Reaper>,
    sink: Arc<dyn EventSink>,
    next_conn_id: AtomicU64,
    stmt_ids: Arc<AtomicU64>,
    self_weak: Weak<PoolInner>,
}

impl Pool {
    /// Create a new pool builder.
    #[must_use]
    pub fn builder() -> PoolBuilder {
        PoolBuilder::new()
    }

    /// Create a new pool with the given options and factory.
    ///
    /// Validates the options and starts the reaper service; requires a
    /// tokio runtime context.
    pub async fn new(
        options: PoolOptions,
        factory: Arc<dyn ConnectionFactory>,
    ) -> Result<Self, PoolError> {
        Self::builder().options(options).build(factory).await
    }

    /// Check out a pooled connection.
    ///
    /// Reuses an idle connection when one is within the reuse limits,
    /// otherwise creates a new one via the factory, bounded by the login
    /// timeout. On expiry the in-flight factory call is canceled and the
    /// checkout fails with [`PoolError::Timeout`]; factory failures are
    /// retried up to `max_retry` times within the same deadline.
    pub async fn checkout(&self) -> Result<Arc<PooledConnection>, PoolError> {
        let inner = &self.inner;
        let (login_timeout, max_retry) = {
            let options = inner.options.read();
            (options.login_timeout, options.max_retry)
        };
        let deadline = Instant::now() + login_timeout;

        let mut attempt: u32 = 0;
        let mut last_error: Option<PoolError> = None;

        while !inner.closed.load(Ordering::Acquire)
            && attempt <= max_retry
            && Instant::now() < deadline
        {
            attempt += 1;
            match inner.try_checkout(deadline).await {
                Ok(conn) => {
                    if let Some(error) = last_error {
                        tracing::info!(attempts = attempt, %error, "checkout recovered");
                    }
                    return Ok(conn);
                }
                Err(error @ (PoolError::Timeout { .. } | PoolError::Closed { .. })) => {
                    last_error = Some(error);
                    break;
                }
                Err(error) => {
                    tracing::debug!(attempt, %error, "checkout attempt failed");
                    last_error = Some(error);
                }
            }
        }

        if inner.closed.load(Ordering::Acquire) {
            return Err(PoolError::Closed { cause: None });
        }
        match last_error {
            Some(PoolError::Factory { source, .. }) => Err(PoolError::Factory {
                attempts: attempt,
                source,
            }),
            Some(error) => Err(error),
            None => Err(inner.timeout_error()),
        }
    }

    /// Close the pool.
    ///
    /// Idempotent. Retires the reuse queue, waits up to `shutdown_timeout`
    /// for busy connections to come home — closing idle ones as they
    /// appear — then force-closes stragglers so that every entry in the
    /// open set ends closed. Errors from individual teardowns are
    /// aggregated, never failed fast.
    pub async fn close(&self) -> Result<(), PoolError> {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        inner.notify.notify_waiters();
        let shutdown_timeout = inner.options.read().shutdown_timeout;
        let mut errors = Vec::new();

        loop {
            let next = inner.reusable.lock().pop_front();
            let Some(conn) = next else { break };
            if let Err(error) = conn.close().await {
                errors.push(error);
            }
        }

        let deadline = Instant::now() + shutdown_timeout;
        loop {
            let idle: Vec<_> = {
                let open = inner.open.lock();
                open.iter()
                    .filter(|conn| conn.logical_opened_at().is_none())
                    .cloned()
                    .collect()
            };
            for conn in idle {
                if let Err(error) = conn.close().await {
                    errors.push(error);
                }
            }
            if inner.open.lock().is_empty() {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let notified = inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if inner.open.lock().is_empty() {
                break;
            }
            let _ = tokio::time::timeout(deadline - now, notified).await;
        }

        let stragglers: Vec<_> = inner.open.lock().clone();
        if !stragglers.is_empty() {
            let forced = stragglers.len();
            tracing::warn!(forced, "force-closing connections after graceful shutdown window");
            for conn in stragglers {
                if let Err(error) = conn.close().await {
                    errors.push(error);
                }
            }
            errors.push(PoolError::Shutdown {
                forced,
                timeout: shutdown_timeout,
            });
        }

        if let Some(hook) = inner.shutdown_hook.lock().take() {
            hook();
        }
        inner.reaper.shutdown();

        match PoolError::aggregate(errors) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Set the maximum number of physical connections.
    pub fn set_max_size(&self, max_size: usize) -> Result<(), PoolError> {
        if max_size == 0 {
            return Err(PoolError::Config("max_size must be positive".into()));
        }
        self.inner.options.write().max_size = max_size;
        self.inner.notify.notify_waiters();
        Ok(())
    }

    /// Set the checkout retry count.
    pub fn set_max_retry(&self, max_retry: u32) {
        self.inner.options.write().max_retry = max_retry;
    }

    /// Set the per-connection reuse-count limit.
    pub fn set_max_connection_reuse_count(&self, count: u64) -> Result<(), PoolError> {
        if count == 0 {
            return Err(PoolError::Config(
                "max_connection_reuse_count must be positive".into(),
            ));
        }
        self.inner.options.write().max_connection_reuse_count = count;
        Ok(())
    }

    /// Set the per-connection reuse-time limit.
    pub fn set_max_connection_reuse_time(&self, limit: Duration) -> Result<(), PoolError> {
        if limit.is_zero() {
            return Err(PoolError::Config(
                "max_connection_reuse_time must be positive".into(),
            ));
        }
        self.inner.options.write().max_connection_reuse_time = limit;
        Ok(())
    }

    /// Set the abandoned-connection timeout. Applies to connections opened
    /// after the call.
    pub fn set_abandoned_connection_timeout(&self, timeout: Duration) -> Result<(), PoolError> {
        if timeout.is_zero() {
            return Err(PoolError::Config(
                "abandoned_connection_timeout must be positive".into(),
            ));
        }
        self.inner.options.write().abandoned_connection_timeout = timeout;
        Ok(())
    }

    /// Set the login timeout. Zero resets to the 15 second default.
    pub fn set_login_timeout(&self, timeout: Duration) {
        self.inner.options.write().login_timeout = if timeout.is_zero() {
            DEFAULT_LOGIN_TIMEOUT
        } else {
            timeout
        };
    }

    /// Set or clear the validation query.
    pub fn set_validation_query(&self, query: Option<String>) -> Result<(), PoolError> {
        if query.as_deref().is_some_and(|q| q.trim().is_empty()) {
            return Err(PoolError::Config("validation_query must not be blank".into()));
        }
        self.inner.options.write().validation_query = query;
        Ok(())
    }

    /// Set the validation interval. Zero validates on every checkout.
    pub fn set_validation_interval(&self, interval: Duration) {
        self.inner.options.write().validation_interval = interval;
    }

    /// Set the connection initializer, applied to each connection on its
    /// first logical open. Applies to connections opened after the call.
    pub fn set_connection_initializer(&self, initializer: ConnectionInitializer) {
        *self.inner.initializer.lock() = Some(initializer);
    }

    /// Set a hook invoked once after shutdown has closed every connection.
    pub fn set_on_close(&self, hook: ShutdownHook) {
        *self.inner.shutdown_hook.lock() = Some(hook);
    }

    /// Current options snapshot.
    #[must_use]
    pub fn options(&self) -> PoolOptions {
        self.inner.options.read().clone()
    }

    /// Number of idle connections immediately available for reuse.
    #[must_use]
    pub fn available(&self) -> usize {
        self.inner.reusable.lock().len()
    }

    /// Number of open connections, idle or in use.
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.inner.open.lock().len()
    }

    /// Whether the pool has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

impl fmt::Display for Pool {
    // JSON-shaped diagnostic summary, the shape operators see in logs.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let options = self.inner.options.read();
        write!(f, "{{")?;
        if let Some(url) = &options.url {
            write!(f, "\"url\":\"{url}\",")?;
        }
        if let Some(username) = &options.username {
            write!(f, "\"username\":\"{username}\",")?;
        }
        if let Some(schema) = &options.schema {
            write!(f, "\"schema\":\"{schema}\",")?;
        }
        write!(
            f,
            "\"available\":{},\"open\":{},\"maxSize\":{},\"maxRetry\":{},\"closed\":{}}}",
            self.available(),
            self.open_count(),
            options.max_size,
            options.max_retry,
            self.is_closed(),
        )
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("available", &self.available())
            .field("open", &self.open_count())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl PoolInner {
    /// One checkout attempt against the deadline: reserve a capacity slot,
    /// produce a connection, release the slot.
    async fn try_checkout(
        &self,
        deadline: Instant,
    ) -> Result<Arc<PooledConnection>, PoolError> {
        self.reserve_slot(deadline).await?;
        let result = self.produce(deadline).await;
        {
            let mut pending = self.pending.lock();
            *pending = pending.saturating_sub(1);
        }
        self.notify.notify_waiters();
        result
    }

    /// Wait until the pool is closed, a reusable connection exists, or
    /// there is room to open a new one; then reserve a slot. The condition
    /// check and the reservation are atomic under the pending lock.
    async fn reserve_slot(&self, deadline: Instant) -> Result<(), PoolError> {
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(PoolError::Closed { cause: None });
            }
            if self.try_reserve() {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(self.timeout_error());
            }
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            // Re-check after registering for wakeup to avoid missing a
            // notify between the failed reserve and the await.
            if self.closed.load(Ordering::Acquire) || self.try_reserve_peek() {
                continue;
            }
            if tokio::time::timeout(deadline - now, notified).await.is_err() {
                return Err(self.timeout_error());
            }
        }
    }

    fn try_reserve(&self) -> bool {
        let mut pending = self.pending.lock();
        if self.has_capacity(*pending) {
            *pending += 1;
            return true;
        }
        false
    }

    fn try_reserve_peek(&self) -> bool {
        let pending = self.pending.lock();
        self.has_capacity(*pending)
    }

    fn has_capacity(&self, pending: usize) -> bool {
        !self.reusable.lock().is_empty()
            || self.open.lock().len() + pending < self.options.read().max_size
    }

    /// Drain the reuse queue — discarding candidates past the reuse
    /// limits — or open a fresh connection, then run the validation policy
    /// before handing the connection out.
    async fn produce(&self, deadline: Instant) -> Result<Arc<PooledConnection>, PoolError> {
        let (count_limit, time_limit, validation_query, validation_interval) = {
            let options = self.options.read();
            (
                options.max_connection_reuse_count,
                options.max_connection_reuse_time,
                options.validation_query.clone(),
                options.validation_interval,
            )
        };

        let mut conn = None;
        loop {
            let candidate = self.reusable.lock().pop_front();
            let Some(candidate) = candidate else { break };
            if candidate.reuse_count() >= count_limit {
                tracing::debug!(
                    target: "sqlpool::retire",
                    conn = candidate.id(),
                    count = candidate.reuse_count(),
                    "pool-retire-count"
                );
                self.retire(candidate).await;
                continue;
            }
            let age = candidate.age();
            if age >= time_limit {
                tracing::debug!(
                    target: "sqlpool::retire",
                    conn = candidate.id(),
                    age = ?age,
                    "pool-retire-timeout"
                );
                self.retire(candidate).await;
                continue;
            }
            tracing::trace!(conn = candidate.id(), "reusing pooled connection");
            conn = Some(candidate);
            break;
        }

        let conn = match conn {
            Some(conn) => conn,
            None => self.open_connection(deadline).await?,
        };

        if let Some(query) = validation_query {
            let due = match conn.last_segment_ended() {
                None => true,
                Some(ended) => ended.elapsed() >= validation_interval,
            };
            if due {
                conn.validate(&query).await?;
            }
        }

        Ok(conn)
    }

    /// Open a fresh physical connection via the factory, bounded by the
    /// checkout deadline. Expiry drops the in-flight connect so the
    /// connection can never leak outside pool tracking.
    async fn open_connection(
        &self,
        deadline: Instant,
    ) -> Result<Arc<PooledConnection>, PoolError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PoolError::Closed { cause: None });
        }
        let initiated_at = Instant::now();
        let remaining = deadline.saturating_duration_since(initiated_at);
        if remaining.is_zero() {
            return Err(self.timeout_error());
        }

        let physical = match tokio::time::timeout(remaining, self.factory.connect()).await {
            Ok(Ok(physical)) => physical,
            Ok(Err(error)) => {
                return Err(PoolError::Factory {
                    attempts: 1,
                    source: error,
                });
            }
            Err(_) => return Err(self.timeout_error()),
        };

        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let (abandoned_timeout, initializer) = (
            self.options.read().abandoned_connection_timeout,
            self.initializer.lock().clone(),
        );
        let conn = PooledConnection::new(NewConnection {
            id,
            initiated_at,
            physical,
            initializer,
            abandoned_timeout,
            reaper: self.reaper.clone(),
            sink: self.sink.clone(),
            stmt_ids: self.stmt_ids.clone(),
            hooks: self.hooks(),
        });
        self.open.lock().push(conn.clone());
        self.emit(PoolEvent::Open {
            duration: initiated_at.elapsed(),
            conn: ConnId(id),
        });
        Ok(conn)
    }

    fn hooks(&self) -> PoolHooks {
        let on_checkin = self.self_weak.clone();
        let on_close = self.self_weak.clone();
        PoolHooks {
            on_checkin: Box::new(move |conn| {
                if let Some(pool) = on_checkin.upgrade() {
                    pool.handle_checkin(&conn);
                }
            }),
            on_close: Box::new(move |conn| {
                if let Some(pool) = on_close.upgrade() {
                    pool.handle_closed(&conn);
                }
            }),
        }
    }

    /// Checkin decision: offer the connection back for reuse when it is
    /// within the reuse limits, retire it otherwise.
    fn handle_checkin(&self, conn: &Arc<PooledConnection>) {
        let (count_limit, time_limit) = {
            let options = self.options.read();
            (
                options.max_connection_reuse_count,
                options.max_connection_reuse_time,
            )
        };
        let count = conn.reuse_count();
        let age = conn.age();

        if self.closed.load(Ordering::Acquire) {
            self.spawn_retire(conn.clone());
            return;
        }
        if count >= count_limit {
            tracing::debug!(target: "sqlpool::retire", conn = conn.id(), count, "pool-retire-count");
            self.spawn_retire(conn.clone());
            return;
        }
        if age >= time_limit {
            tracing::debug!(target: "sqlpool::retire", conn = conn.id(), age = ?age, "pool-retire-timeout");
            self.spawn_retire(conn.clone());
            return;
        }

        self.reusable.lock().push_back(conn.clone());
        self.emit(PoolEvent::Reuse {
            count,
            age,
            conn: ConnId(conn.id()),
        });
        self.notify.notify_waiters();
    }

    /// On-close notification from a connection: eject it from tracking.
    /// Fires exactly once per connection.
    fn handle_closed(&self, conn: &Arc<PooledConnection>) {
        self.open.lock().retain(|tracked| !Arc::ptr_eq(tracked, conn));
        self.reusable
            .lock()
            .retain(|tracked| !Arc::ptr_eq(tracked, conn));
        self.emit(PoolEvent::Close {
            duration: conn.age(),
            conn: ConnId(conn.id()),
        });
        if let Some(error) = conn.error() {
            tracing::warn!(conn = conn.id(), %error, "pooled connection closed after error");
        }
        self.notify.notify_waiters();
    }

    /// Close a connection from a checkin path (sync context).
    fn spawn_retire(&self, conn: Arc<PooledConnection>) {
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(error) = conn.close().await {
                    tracing::info!(conn = conn.id(), %error, "connection retirement failed");
                }
            });
        } else {
            tracing::warn!(conn = conn.id(), "no runtime available to retire connection");
        }
    }

    /// Close a connection from an async checkout path.
    async fn retire(&self, conn: Arc<PooledConnection>) {
        if let Err(error) = conn.close().await {
            tracing::info!(conn = conn.id(), %error, "connection retirement failed");
        }
    }

    fn timeout_error(&self) -> PoolError {
        PoolError::Timeout {
            login_timeout: self.options.read().login_timeout,
        }
    }

    fn emit(&self, event: PoolEvent) {
        self.sink.emit(&event.to_string());
    }
}

/// Builder for creating a connection pool.
pub struct PoolBuilder {
    options: PoolOptions,
    sink: Arc<dyn EventSink>,
    initializer: Option<ConnectionInitializer>,
}

impl PoolBuilder {
    /// Create a new pool builder with default options.
    #[must_use]
    pub fn new() -> Self {
        Self {
            options: PoolOptions::default(),
            sink: Arc::new(TracingSink),
            initializer: None,
        }
    }

    /// Set the full options struct.
    #[must_use]
    pub fn options(mut self, options: PoolOptions) -> Self {
        self.options = options;
        self
    }

    /// Set the maximum number of physical connections.
    #[must_use]
    pub fn max_size(mut self, max_size: usize) -> Self {
        self.options.max_size = max_size;
        self
    }

    /// Set the checkout retry count.
    #[must_use]
    pub fn max_retry(mut self, max_retry: u32) -> Self {
        self.options.max_retry = max_retry;
        self
    }

    /// Set the abandoned-connection timeout.
    #[must_use]
    pub fn abandoned_connection_timeout(mut self, timeout: Duration) -> Self {
        self.options.abandoned_connection_timeout = timeout;
        self
    }

    /// Set the login timeout.
    #[must_use]
    pub fn login_timeout(mut self, timeout: Duration) -> Self {
        self.options = self.options.login_timeout(timeout);
        self
    }

    /// Set the validation query.
    #[must_use]
    pub fn validation_query(mut self, query: impl Into<String>) -> Self {
        self.options.validation_query = Some(query.into());
        self
    }

    /// Set the event sink consuming the fixed-format pool event lines.
    #[must_use]
    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Set the connection initializer.
    #[must_use]
    pub fn connection_initializer(mut self, initializer: ConnectionInitializer) -> Self {
        self.initializer = Some(initializer);
        self
    }

    /// Build the pool. Validates the options and starts the reaper
    /// service; requires a tokio runtime context.
    pub async fn build(self, factory: Arc<dyn ConnectionFactory>) -> Result<Pool, PoolError> {
        self.options.validate()?;
        let inner = Arc::new_cyclic(|self_weak| PoolInner {
            options: RwLock::new(self.options),
            factory,
            initializer: Mutex::new(self.initializer),
            shutdown_hook: Mutex::new(None),
            open: Mutex::new(Vec::new()),
            reusable: Mutex::new(VecDeque::new()),
            pending: Mutex::new(0),
            closed: AtomicBool::new(false),
            notify: Notify::new(),
            reaper: Reaper::start(),
            sink: self.sink,
            next_conn_id: AtomicU64::new(1),
            stmt_ids: Arc::new(AtomicU64::new(1)),
            self_weak: self_weak.clone(),
        });
        {
            let options = inner.options.read();
            tracing::info!(
                max_size = options.max_size,
                max_retry = options.max_retry,
                "connection pool created"
            );
        }
        Ok(Pool { inner })
    }
}

impl Default for PoolBuilder {
    fn default() -> Self {
        Self::new()
    }
}
