//! Statement cache scenarios: hits, misses, purging, listener fan-out.

use std::sync::Arc;
use std::time::Duration;

use sqlpool::{Pool, PoolError, PoolOptions, StatementSpec};
use sqlpool_client::ClientError;
use sqlpool_testing::{RecordingListener, RecordingSink, StubConnection, StubFactory};

async fn checked_out(
    factory: &Arc<StubFactory>,
    sink: &Arc<RecordingSink>,
) -> (Pool, Arc<sqlpool::PooledConnection>, Arc<StubConnection>) {
    let pool = Pool::builder()
        .options(PoolOptions::new())
        .event_sink(sink.clone())
        .build(factory.clone())
        .await
        .unwrap();
    let conn = pool.checkout().await.unwrap();
    let stub = factory.connections().remove(0);
    (pool, conn, stub)
}

#[tokio::test]
async fn test_statement_cached_across_close() {
    let factory = StubFactory::new();
    let sink = RecordingSink::new();
    let (_pool, conn, stub) = checked_out(&factory, &sink).await;
    let logical = conn.checkout().unwrap();

    let spec = StatementSpec::prepared("SELECT name FROM users");
    let stmt = logical.prepare(spec.clone()).await.unwrap();
    assert_eq!(stub.prepare_count(), 1);
    assert!(sink.contains_prefix("pool-statement-open:"));

    stmt.execute(&[]).await.unwrap();
    stmt.close().await.unwrap();
    assert!(sink.contains_prefix("pool-statement-close:"));
    // The physical statement was parked, not closed.
    assert!(!stub.statements()[0].is_closed());

    // Preparing the same spec again returns the cached statement without
    // touching the driver.
    let stmt = logical.prepare(spec).await.unwrap();
    assert_eq!(stub.prepare_count(), 1);
    assert!(sink.contains_prefix("pool-statement-reuse:"));
    stmt.execute(&[]).await.unwrap();
    assert_eq!(stub.statements()[0].execute_count(), 2);
}

#[tokio::test]
async fn test_concurrent_prepare_returns_distinct_statements() {
    let factory = StubFactory::new();
    let sink = RecordingSink::new();
    let (_pool, conn, stub) = checked_out(&factory, &sink).await;
    let logical = conn.checkout().unwrap();

    let spec = StatementSpec::prepared("SELECT 1");
    let a = logical.prepare(spec.clone()).await.unwrap();
    let b = logical.prepare(spec).await.unwrap();
    assert_eq!(stub.prepare_count(), 2);

    // Both park on close and both become reusable.
    a.close().await.unwrap();
    b.close().await.unwrap();
    assert_eq!(sink.count_prefix("pool-statement-close:"), 2);
}

#[tokio::test]
async fn test_statement_reset_before_reuse() {
    let factory = StubFactory::new();
    let sink = RecordingSink::new();
    let (_pool, conn, stub) = checked_out(&factory, &sink).await;
    let logical = conn.checkout().unwrap();

    let stmt = logical
        .prepare(StatementSpec::prepared("SELECT 1"))
        .await
        .unwrap();
    stmt.close().await.unwrap();
    assert_eq!(stub.statements()[0].reset_count(), 1);
}

#[tokio::test]
async fn test_errored_statement_never_reused() {
    let factory = StubFactory::new();
    let sink = RecordingSink::new();
    let (_pool, conn, stub) = checked_out(&factory, &sink).await;
    let listener = RecordingListener::new();
    conn.add_statement_listener(listener.clone());
    let logical = conn.checkout().unwrap();

    let spec = StatementSpec::prepared("SELECT 1");
    let stmt = logical.prepare(spec.clone()).await.unwrap();
    let physical = stub.statements().remove(0);
    physical.fail_next_execute(ClientError::Statement("boom".into()));

    let error = stmt.execute(&[]).await.unwrap_err();
    assert!(matches!(error, PoolError::Statement(_)));
    assert!(physical.is_closed());
    assert!(sink.contains_prefix("pool-statement-error:"));
    assert_eq!(listener.statement_error_count(), 1);

    // The errored statement is gone from the cache: the next prepare is a
    // fresh driver call.
    let replacement = logical.prepare(spec).await.unwrap();
    assert_eq!(stub.prepare_count(), 2);
    replacement.execute(&[]).await.unwrap();
}

#[tokio::test]
async fn test_statement_error_leaves_connection_usable() {
    let factory = StubFactory::new();
    let sink = RecordingSink::new();
    let (pool, conn, stub) = checked_out(&factory, &sink).await;
    let logical = conn.checkout().unwrap();

    let stmt = logical
        .prepare(StatementSpec::prepared("SELECT 1"))
        .await
        .unwrap();
    stub.statements().remove(0).fail_next_execute(ClientError::Statement("boom".into()));
    stmt.execute(&[]).await.unwrap_err();

    // Statement errors are local: the connection survives.
    assert!(!conn.is_closed());
    assert_eq!(pool.open_count(), 1);
    logical.execute("DELETE FROM t").await.unwrap();
}

#[tokio::test]
async fn test_prepare_failure_tears_down_connection() {
    let factory = StubFactory::new();
    let sink = RecordingSink::new();
    let (pool, conn, stub) = checked_out(&factory, &sink).await;
    let listener = RecordingListener::new();
    conn.add_connection_listener(listener.clone());
    let logical = conn.checkout().unwrap();

    stub.fail_next_prepare(ClientError::Disconnected("gone".into()));
    let error = logical
        .prepare(StatementSpec::prepared("SELECT 1"))
        .await
        .unwrap_err();
    assert!(matches!(error, PoolError::Connection(_)));

    // Connection-level errors force full teardown.
    assert!(conn.is_closed());
    assert!(stub.is_closed());
    assert_eq!(pool.open_count(), 0);
    assert_eq!(listener.connection_error_count(), 1);
    assert!(sink.contains_prefix("pool-close:"));
}

#[tokio::test]
async fn test_dropped_statement_reparks() {
    let factory = StubFactory::new();
    let sink = RecordingSink::new();
    let (_pool, conn, stub) = checked_out(&factory, &sink).await;
    let logical = conn.checkout().unwrap();

    let spec = StatementSpec::prepared("SELECT 1");
    let stmt = logical.prepare(spec.clone()).await.unwrap();
    drop(stmt);
    tokio::time::sleep(Duration::from_millis(20)).await;

    // The dropped statement was parked by the fallback path and the next
    // prepare hits the cache.
    let _stmt = logical.prepare(spec).await.unwrap();
    assert_eq!(stub.prepare_count(), 1);
}

#[tokio::test]
async fn test_distinct_specs_miss_each_other() {
    let factory = StubFactory::new();
    let sink = RecordingSink::new();
    let (_pool, conn, stub) = checked_out(&factory, &sink).await;
    let logical = conn.checkout().unwrap();

    let a = logical
        .prepare(StatementSpec::prepared("SELECT 1"))
        .await
        .unwrap();
    a.close().await.unwrap();

    // Same SQL, different kind: no cache hit.
    let _b = logical
        .prepare(StatementSpec::callable("SELECT 1"))
        .await
        .unwrap();
    assert_eq!(stub.prepare_count(), 2);

    // Same SQL, different options: no cache hit either.
    let _c = logical
        .prepare(StatementSpec::prepared("SELECT 1").with_options([42]))
        .await
        .unwrap();
    assert_eq!(stub.prepare_count(), 3);
}

#[tokio::test]
async fn test_listener_fanout_on_checkin() {
    let factory = StubFactory::new();
    let sink = RecordingSink::new();
    let (_pool, conn, _stub) = checked_out(&factory, &sink).await;
    let listener = RecordingListener::new();
    conn.add_connection_listener(listener.clone());
    conn.add_statement_listener(listener.clone());

    let logical = conn.checkout().unwrap();
    let stmt = logical
        .prepare(StatementSpec::prepared("SELECT 1"))
        .await
        .unwrap();
    stmt.close().await.unwrap();
    logical.close();

    assert_eq!(listener.statement_closed_count(), 1);
    assert_eq!(listener.connection_closed_count(), 1);
    assert_eq!(listener.connection_error_count(), 0);
}
