//! Pool configuration.

use std::time::Duration;

use crate::error::PoolError;

/// Login timeout applied when the caller asks for zero.
pub(crate) const DEFAULT_LOGIN_TIMEOUT: Duration = Duration::from_secs(15);

/// Configuration for a connection pool.
///
/// Built fluently and validated once at pool construction; the same checks
/// back the runtime setters on [`Pool`](crate::Pool).
///
/// # Example
///
/// ```rust,ignore
/// use sqlpool::PoolOptions;
/// use std::time::Duration;
///
/// let options = PoolOptions::new()
///     .max_size(32)
///     .max_connection_reuse_count(500)
///     .abandoned_connection_timeout(Duration::from_secs(60))
///     .validation_query("SELECT 1");
/// ```
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Maximum number of physical connections open at once.
    pub max_size: usize,
    /// Retries for a failed checkout; total attempts are `max_retry + 1`.
    pub max_retry: u32,
    /// Times a connection may complete a checkout before retirement.
    pub max_connection_reuse_count: u64,
    /// Age at which a connection is retired instead of reused.
    pub max_connection_reuse_time: Duration,
    /// Checkout duration after which a logical connection is considered
    /// abandoned and forcibly reclaimed.
    pub abandoned_connection_timeout: Duration,
    /// Deadline for one `checkout()` call, factory attempts included.
    pub login_timeout: Duration,
    /// Graceful wait for open connections on shutdown.
    pub shutdown_timeout: Duration,
    /// Optional validation query; must produce one row with a non-null
    /// first column. `None` skips validation entirely.
    pub validation_query: Option<String>,
    /// Minimum idle time between validation passes on one connection;
    /// zero validates on every checkout.
    pub validation_interval: Duration,
    /// Connection URL, carried for diagnostics only.
    pub url: Option<String>,
    /// Database username, carried for diagnostics only.
    pub username: Option<String>,
    /// Database schema, carried for diagnostics only.
    pub schema: Option<String>,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            max_size: 16,
            max_retry: 1,
            max_connection_reuse_count: 100,
            max_connection_reuse_time: Duration::from_secs(15 * 60),
            abandoned_connection_timeout: Duration::from_secs(30 * 60),
            login_timeout: DEFAULT_LOGIN_TIMEOUT,
            shutdown_timeout: Duration::from_secs(30),
            validation_query: None,
            validation_interval: Duration::from_secs(15),
            url: None,
            username: None,
            schema: None,
        }
    }
}

impl PoolOptions {
    /// Options with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum number of physical connections.
    #[must_use]
    pub fn max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    /// Set the checkout retry count.
    #[must_use]
    pub fn max_retry(mut self, max_retry: u32) -> Self {
        self.max_retry = max_retry;
        self
    }

    /// Set the per-connection reuse-count limit.
    #[must_use]
    pub fn max_connection_reuse_count(mut self, count: u64) -> Self {
        self.max_connection_reuse_count = count;
        self
    }

    /// Set the per-connection reuse-time limit.
    #[must_use]
    pub fn max_connection_reuse_time(mut self, limit: Duration) -> Self {
        self.max_connection_reuse_time = limit;
        self
    }

    /// Set the abandoned-connection timeout.
    #[must_use]
    pub fn abandoned_connection_timeout(mut self, timeout: Duration) -> Self {
        self.abandoned_connection_timeout = timeout;
        self
    }

    /// Set the login timeout. Zero resets to the 15 second default.
    #[must_use]
    pub fn login_timeout(mut self, timeout: Duration) -> Self {
        self.login_timeout = if timeout.is_zero() {
            DEFAULT_LOGIN_TIMEOUT
        } else {
            timeout
        };
        self
    }

    /// Set the graceful shutdown window.
    #[must_use]
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Set the validation query.
    #[must_use]
    pub fn validation_query(mut self, query: impl Into<String>) -> Self {
        self.validation_query = Some(query.into());
        self
    }

    /// Set the validation interval.
    #[must_use]
    pub fn validation_interval(mut self, interval: Duration) -> Self {
        self.validation_interval = interval;
        self
    }

    /// Set the diagnostic connection URL.
    #[must_use]
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Set the diagnostic username.
    #[must_use]
    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    /// Set the diagnostic schema.
    #[must_use]
    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    /// Check the options for ill-formed values.
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.max_size == 0 {
            return Err(PoolError::Config("max_size must be positive".into()));
        }
        if self.max_connection_reuse_count == 0 {
            return Err(PoolError::Config(
                "max_connection_reuse_count must be positive".into(),
            ));
        }
        if self.max_connection_reuse_time.is_zero() {
            return Err(PoolError::Config(
                "max_connection_reuse_time must be positive".into(),
            ));
        }
        if self.abandoned_connection_timeout.is_zero() {
            return Err(PoolError::Config(
                "abandoned_connection_timeout must be positive".into(),
            ));
        }
        if self
            .validation_query
            .as_deref()
            .is_some_and(|query| query.trim().is_empty())
        {
            return Err(PoolError::Config("validation_query must not be blank".into()));
        }
        Ok(())
    }
}
