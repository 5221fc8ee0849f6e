//! Pool lifecycle scenarios: checkout, reuse, limits, timeouts, shutdown.

use std::sync::Arc;
use std::time::{Duration, Instant};

use sqlpool::{ConnectionInitializer, Pool, PoolError, PoolOptions, same_connection};
use sqlpool_client::{
    ClientError, PhysicalConnection, PreparedStatement, SqlValue, StatementSpec,
};
use sqlpool_testing::{ConnectOutcome, RecordingSink, StubConnection, StubFactory};

async fn build_pool(
    options: PoolOptions,
    factory: Arc<StubFactory>,
    sink: Arc<RecordingSink>,
) -> Pool {
    Pool::builder()
        .options(options)
        .event_sink(sink)
        .build(factory)
        .await
        .unwrap()
}

/// Give spawned retirement tasks a chance to run.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}

#[tokio::test]
async fn test_checkout_reuse_scenario() {
    let factory = StubFactory::new();
    let sink = RecordingSink::new();
    let pool = build_pool(
        PoolOptions::new().max_retry(0),
        factory.clone(),
        sink.clone(),
    )
    .await;

    let conn = pool.checkout().await.unwrap();
    let id = conn.id();
    assert_eq!(factory.connects(), 1);
    assert!(sink.contains_prefix("pool-open:"));

    // The logical view unwraps to the stub the factory produced, through
    // an interception wrapper rather than the stub itself.
    let logical = conn.checkout().unwrap();
    let stub = factory.connections().remove(0);
    assert!(same_connection(logical.raw(), stub.as_ref()));

    // Closing the logical connection emits pool-reuse and parks the
    // connection for the next checkout.
    logical.close();
    assert!(sink.contains_prefix("pool-reuse:1:"));
    assert_eq!(pool.available(), 1);

    // The factory would now fail, but the reusable connection is handed
    // out without invoking it.
    factory.push(ConnectOutcome::Fail(ClientError::Connect("down".into())));
    let again = pool.checkout().await.unwrap();
    assert_eq!(again.id(), id);
    assert_eq!(factory.connects(), 1);
}

#[tokio::test]
async fn test_reuse_count_limit_retires_connection() {
    let factory = StubFactory::new();
    let sink = RecordingSink::new();
    let pool = build_pool(
        PoolOptions::new().max_connection_reuse_count(3),
        factory.clone(),
        sink.clone(),
    )
    .await;

    for _ in 0..3 {
        let conn = pool.checkout().await.unwrap();
        let logical = conn.checkout().unwrap();
        logical.close();
    }
    settle().await;

    // The third checkin hits the limit: retired, not offered back.
    assert_eq!(pool.available(), 0);
    assert_eq!(pool.open_count(), 0);
    assert_eq!(sink.count_prefix("pool-reuse:"), 2);
    assert_eq!(sink.count_prefix("pool-close:"), 1);
    assert_eq!(factory.connections()[0].close_count(), 1);
}

#[tokio::test]
async fn test_reuse_time_limit_discards_aged_connection() {
    let factory = StubFactory::new();
    let sink = RecordingSink::new();
    let pool = build_pool(
        PoolOptions::new().max_connection_reuse_time(Duration::from_millis(50)),
        factory.clone(),
        sink.clone(),
    )
    .await;

    let conn = pool.checkout().await.unwrap();
    let first_id = conn.id();
    conn.checkout().unwrap().close();
    assert_eq!(pool.available(), 1);

    tokio::time::sleep(Duration::from_millis(80)).await;

    // The aged candidate is discarded at checkout and a fresh connection
    // opened in its place.
    let conn = pool.checkout().await.unwrap();
    assert_ne!(conn.id(), first_id);
    assert_eq!(factory.connects(), 2);
    assert!(factory.connections()[0].is_closed());
}

#[tokio::test]
async fn test_checkout_waits_for_checkin_at_capacity() {
    let factory = StubFactory::new();
    let sink = RecordingSink::new();
    let pool = build_pool(
        PoolOptions::new()
            .max_size(1)
            .login_timeout(Duration::from_secs(2)),
        factory.clone(),
        sink.clone(),
    )
    .await;

    let conn = pool.checkout().await.unwrap();
    let id = conn.id();
    let logical = conn.checkout().unwrap();

    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.checkout().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    logical.close();

    let conn = waiter.await.unwrap().unwrap();
    assert_eq!(conn.id(), id);
    assert_eq!(factory.connects(), 1);
}

#[tokio::test]
async fn test_checkout_times_out_when_exhausted() {
    let factory = StubFactory::new();
    let sink = RecordingSink::new();
    let pool = build_pool(
        PoolOptions::new()
            .max_size(1)
            .login_timeout(Duration::from_millis(100)),
        factory.clone(),
        sink.clone(),
    )
    .await;

    let _held = pool.checkout().await.unwrap();
    let started = Instant::now();
    let error = pool.checkout().await.unwrap_err();
    assert!(matches!(error, PoolError::Timeout { .. }));
    assert!(started.elapsed() >= Duration::from_millis(90));
}

#[tokio::test]
async fn test_factory_failure_retried_then_propagated() {
    let factory = StubFactory::failing();
    let sink = RecordingSink::new();
    let pool = build_pool(
        PoolOptions::new().max_retry(1),
        factory.clone(),
        sink.clone(),
    )
    .await;

    let error = pool.checkout().await.unwrap_err();
    match error {
        PoolError::Factory { attempts, .. } => assert_eq!(attempts, 2),
        other => panic!("expected factory error, got {other:?}"),
    }
    assert_eq!(factory.connects(), 2);
}

#[tokio::test]
async fn test_login_timeout_cancels_hanging_factory() {
    let factory = StubFactory::new();
    factory.push(ConnectOutcome::Hang);
    let sink = RecordingSink::new();
    let pool = build_pool(
        PoolOptions::new().login_timeout(Duration::from_millis(100)),
        factory.clone(),
        sink.clone(),
    )
    .await;

    let started = Instant::now();
    let error = pool.checkout().await.unwrap_err();
    assert!(matches!(error, PoolError::Timeout { .. }));
    // The hung connect was dropped with the deadline, not awaited out.
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(pool.open_count(), 0);
}

#[tokio::test]
async fn test_double_close_notifies_pool_once() {
    let factory = StubFactory::new();
    let sink = RecordingSink::new();
    let pool = build_pool(PoolOptions::new(), factory.clone(), sink.clone()).await;

    let conn = pool.checkout().await.unwrap();
    conn.close().await.unwrap();
    conn.close().await.unwrap();

    assert_eq!(sink.count_prefix("pool-close:"), 1);
    assert_eq!(factory.connections()[0].close_count(), 1);
    assert_eq!(pool.open_count(), 0);
}

#[tokio::test]
async fn test_concurrent_close_single_teardown() {
    let factory = StubFactory::new();
    let sink = RecordingSink::new();
    let pool = build_pool(PoolOptions::new(), factory.clone(), sink.clone()).await;

    let conn = pool.checkout().await.unwrap();
    let (a, b) = {
        let (c1, c2) = (conn.clone(), conn.clone());
        (
            tokio::spawn(async move { c1.close().await }),
            tokio::spawn(async move { c2.close().await }),
        )
    };
    a.await.unwrap().unwrap();
    b.await.unwrap().unwrap();

    assert_eq!(sink.count_prefix("pool-close:"), 1);
    assert_eq!(factory.connections()[0].close_count(), 1);
}

#[tokio::test]
async fn test_concurrent_checkouts_no_double_release() {
    let factory = StubFactory::new();
    let sink = RecordingSink::new();
    let pool = build_pool(
        PoolOptions::new()
            .max_size(2)
            .max_connection_reuse_count(10_000)
            .login_timeout(Duration::from_secs(5)),
        factory.clone(),
        sink.clone(),
    )
    .await;

    let mut workers = Vec::new();
    for _ in 0..8 {
        let pool = pool.clone();
        workers.push(tokio::spawn(async move {
            for _ in 0..20 {
                let conn = pool.checkout().await.unwrap();
                let logical = conn.checkout().unwrap();
                logical.close();
            }
        }));
    }
    for worker in workers {
        worker.await.unwrap();
    }
    settle().await;

    assert!(pool.open_count() <= 2);
    assert!(pool.available() <= pool.open_count());
    // Every physical connection the factory produced is tracked at most
    // once; none was torn down by a double release.
    assert_eq!(sink.count_prefix("pool-close:"), 0);
}

#[tokio::test]
async fn test_validation_rejects_null_result() {
    let factory = StubFactory::new();
    let stub = StubConnection::new();
    stub.set_row(Some(vec![sqlpool::SqlValue::Null]));
    factory.push(ConnectOutcome::Connection(stub.clone()));

    let sink = RecordingSink::new();
    let pool = build_pool(
        PoolOptions::new().max_retry(0).validation_query("SELECT 1"),
        factory.clone(),
        sink.clone(),
    )
    .await;

    let error = pool.checkout().await.unwrap_err();
    assert!(matches!(error, PoolError::Validation { .. }));
    assert!(stub.is_closed());
    assert_eq!(pool.open_count(), 0);
}

#[tokio::test]
async fn test_validation_runs_intermittently() {
    let factory = StubFactory::new();
    let sink = RecordingSink::new();
    let pool = build_pool(
        PoolOptions::new().validation_query("SELECT 1"),
        factory.clone(),
        sink.clone(),
    )
    .await;

    // First checkout validates; the logical view is handed off without
    // re-opening.
    let conn = pool.checkout().await.unwrap();
    let stub = factory.connections().remove(0);
    assert_eq!(stub.query_count(), 1);
    let logical = conn.checkout().unwrap();
    logical.close();

    // Within the validation interval the query is not repeated.
    let conn = pool.checkout().await.unwrap();
    assert_eq!(stub.query_count(), 1);
    conn.checkout().unwrap().close();
}

#[tokio::test]
async fn test_runtime_setters_validate_input() {
    let factory = StubFactory::new();
    let sink = RecordingSink::new();
    let pool = build_pool(PoolOptions::new(), factory, sink).await;

    assert!(pool.set_max_size(0).is_err());
    assert!(pool.set_max_size(32).is_ok());
    assert!(pool.set_max_connection_reuse_count(0).is_err());
    assert!(pool.set_max_connection_reuse_time(Duration::ZERO).is_err());
    assert!(pool.set_abandoned_connection_timeout(Duration::ZERO).is_err());
    assert!(pool.set_validation_query(Some("  ".into())).is_err());
    assert!(pool.set_validation_query(Some("SELECT 1".into())).is_ok());

    pool.set_login_timeout(Duration::ZERO);
    assert_eq!(pool.options().login_timeout, Duration::from_secs(15));
    assert_eq!(pool.options().max_size, 32);
    assert!(pool.to_string().contains("\"maxSize\":32"));
}

#[tokio::test]
async fn test_pool_close_drains_and_is_idempotent() {
    let factory = StubFactory::new();
    let sink = RecordingSink::new();
    let pool = build_pool(PoolOptions::new().max_size(4), factory.clone(), sink.clone()).await;

    let first = pool.checkout().await.unwrap();
    let second = pool.checkout().await.unwrap();
    assert_ne!(first.id(), second.id());
    first.checkout().unwrap().close();
    second.checkout().unwrap().close();

    pool.close().await.unwrap();
    assert!(pool.is_closed());
    assert_eq!(pool.open_count(), 0);
    for stub in factory.connections() {
        assert!(stub.is_closed());
    }

    // Second close is a no-op; checkout after close fails.
    pool.close().await.unwrap();
    let error = pool.checkout().await.unwrap_err();
    assert!(matches!(error, PoolError::Closed { .. }));
}

#[tokio::test]
async fn test_pool_close_forces_stragglers() {
    let factory = StubFactory::new();
    let sink = RecordingSink::new();
    let pool = build_pool(
        PoolOptions::new().shutdown_timeout(Duration::from_millis(50)),
        factory.clone(),
        sink.clone(),
    )
    .await;

    let conn = pool.checkout().await.unwrap();
    let _logical = conn.checkout().unwrap();

    let error = pool.close().await.unwrap_err();
    match error {
        PoolError::Shutdown { forced, .. } => assert_eq!(forced, 1),
        other => panic!("expected shutdown error, got {other:?}"),
    }
    assert!(conn.is_closed());
    assert_eq!(pool.open_count(), 0);
    assert_eq!(factory.connections()[0].close_count(), 1);
}

#[tokio::test]
async fn test_shutdown_hook_runs_once() {
    let factory = StubFactory::new();
    let sink = RecordingSink::new();
    let pool = build_pool(PoolOptions::new(), factory, sink).await;

    let fired = Arc::new(std::sync::atomic::AtomicU64::new(0));
    let hook_fired = fired.clone();
    pool.set_on_close(Box::new(move || {
        hook_fired.fetch_add(1, std::sync::atomic::Ordering::AcqRel);
    }));

    pool.close().await.unwrap();
    pool.close().await.unwrap();
    assert_eq!(fired.load(std::sync::atomic::Ordering::Acquire), 1);
}

/// Pass-through decorator that keeps the raw() chain intact.
struct Decorated {
    inner: Arc<dyn PhysicalConnection>,
}

#[async_trait::async_trait]
impl PhysicalConnection for Decorated {
    async fn prepare(
        &self,
        spec: &StatementSpec,
    ) -> Result<Arc<dyn PreparedStatement>, ClientError> {
        self.inner.prepare(spec).await
    }

    async fn query_row(&self, sql: &str) -> Result<Option<Vec<SqlValue>>, ClientError> {
        self.inner.query_row(sql).await
    }

    async fn execute(&self, sql: &str) -> Result<u64, ClientError> {
        self.inner.execute(sql).await
    }

    async fn close(&self) -> Result<(), ClientError> {
        self.inner.close().await
    }

    fn raw(&self) -> &dyn PhysicalConnection {
        self.inner.raw()
    }
}

#[tokio::test]
async fn test_connection_initializer_decorates_and_unwraps() {
    let factory = StubFactory::new();
    let sink = RecordingSink::new();
    let initializer: ConnectionInitializer = Arc::new(|base| {
        let decorated: Arc<dyn PhysicalConnection> = Arc::new(Decorated { inner: base });
        Ok(decorated)
    });
    let pool = Pool::builder()
        .options(PoolOptions::new())
        .event_sink(sink)
        .connection_initializer(initializer)
        .build(factory.clone())
        .await
        .unwrap();

    let conn = pool.checkout().await.unwrap();
    let logical = conn.checkout().unwrap();

    // The decorator is in place, and raw() still reaches the factory's
    // connection.
    let stub = factory.connections().remove(0);
    assert!(same_connection(logical.raw(), stub.as_ref()));
    logical.execute("SET search_path = app").await.unwrap();
    assert_eq!(stub.query_count(), 1);
}

#[tokio::test]
async fn test_connection_initializer_must_preserve_raw() {
    let factory = StubFactory::new();
    let sink = RecordingSink::new();
    // Swaps the connection out entirely; raw() no longer reaches the
    // original, which the pool must reject.
    let initializer: ConnectionInitializer = Arc::new(|_base| {
        let replacement: Arc<dyn PhysicalConnection> = StubConnection::new();
        Ok(replacement)
    });
    let pool = Pool::builder()
        .options(PoolOptions::new())
        .event_sink(sink)
        .connection_initializer(initializer)
        .build(factory)
        .await
        .unwrap();

    let conn = pool.checkout().await.unwrap();
    let error = conn.checkout().unwrap_err();
    assert!(matches!(error, PoolError::Config(_)));
}

#[tokio::test]
async fn test_connection_stats_track_segments() {
    let factory = StubFactory::new();
    let sink = RecordingSink::new();
    let pool = build_pool(PoolOptions::new(), factory, sink).await;

    let conn = pool.checkout().await.unwrap();
    assert_eq!(conn.reuse_count(), 0);
    assert!(conn.last_segment_duration().is_none());

    let logical = conn.checkout().unwrap();
    assert!(conn.logical_opened_at().is_some());
    tokio::time::sleep(Duration::from_millis(10)).await;
    logical.close();

    assert_eq!(conn.reuse_count(), 1);
    assert!(conn.logical_opened_at().is_none());
    assert!(conn.last_segment_duration().is_some_and(|d| d >= Duration::from_millis(5)));
    assert_eq!(conn.average_segment_duration(), conn.last_segment_duration());
    assert_eq!(conn.max_segment_duration(), conn.last_segment_duration());
    assert!(conn.last_segment_started().is_some());
    assert!(conn.last_segment_ended().is_some());
    assert!(conn.opened_at() >= conn.initiated_at());
    assert!(conn.to_string().contains("\"reuseCount\":1"));
}

#[tokio::test]
async fn test_checkout_while_logical_live_fails() {
    let factory = StubFactory::new();
    let sink = RecordingSink::new();
    let pool = build_pool(PoolOptions::new(), factory, sink).await;

    let conn = pool.checkout().await.unwrap();
    let _logical = conn.checkout().unwrap();
    let error = conn.checkout().unwrap_err();
    assert!(matches!(error, PoolError::AlreadyConnected));
}

#[tokio::test]
async fn test_closed_connection_chains_terminal_cause() {
    let factory = StubFactory::new();
    let sink = RecordingSink::new();
    let pool = build_pool(PoolOptions::new(), factory.clone(), sink).await;

    let conn = pool.checkout().await.unwrap();
    let logical = conn.checkout().unwrap();
    factory.connections()[0].fail_next_query(ClientError::Disconnected("gone".into()));
    let error = logical.query_row("SELECT 1").await.unwrap_err();
    assert!(matches!(error, PoolError::Connection(_)));

    // Checkout after the error-triggered teardown carries the cause.
    let error = conn.checkout().unwrap_err();
    match error {
        PoolError::Closed { cause } => {
            let cause = cause.expect("terminal cause");
            assert!(cause.to_string().contains("connection failed"));
        }
        other => panic!("expected closed error, got {other:?}"),
    }
}
