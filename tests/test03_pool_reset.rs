#![cfg(feature = "test-utils")]

use std::time::Duration;

use futures_util::StreamExt;
use sql_conduit::prelude::*;
use sql_conduit::test_utils::{DEFAULT_LANGUAGE, SESSION_PROBE, ScriptedServer, Step};

#[derive(Debug, serde::Deserialize)]
struct SessionRow {
    trancount: i64,
    isolation: String,
    language: String,
}

async fn probe(client: &SqlClient) -> Result<SessionRow, SqlConduitError> {
    let ct = CancellationToken::new();
    let mut rows: Vec<SessionRow> = client.query_as(SESSION_PROBE, &ct, MapMode::STRICT).await?;
    rows.pop()
        .ok_or_else(|| SqlConduitError::MappingError("probe returned nothing".into()))
}

fn single_connection() -> ClientOptions {
    ClientOptions {
        max_pool_size: 1,
        connect_timeout: Duration::from_millis(200),
        ..ScriptedServer::options()
    }
}

#[tokio::test(flavor = "current_thread")]
async fn dangling_transaction_is_rolled_back_before_reuse() -> Result<(), SqlConduitError> {
    let server = ScriptedServer::new();
    let registry = server.registry();
    let ct = CancellationToken::new();

    let first = SqlClient::new(std::sync::Arc::clone(&registry), single_connection())?;
    first
        .begin_transaction(IsolationLevel::Serializable, &ct)
        .await?;
    assert!(first.in_transaction());
    let inside = probe(&first).await?;
    assert_eq!(inside.trancount, 1);
    assert_eq!(inside.isolation, "SERIALIZABLE");

    // Walk away without commit or rollback.
    first.disconnect().await;

    let second = SqlClient::new(registry, single_connection())?;
    let after = probe(&second).await?;
    assert_eq!(after.trancount, 0);
    assert_eq!(after.isolation, IsolationLevel::default().as_sql());
    assert_eq!(server.connects(), 1, "the same physical session was reused");
    assert!(server.resets() >= 1);
    Ok(())
}

#[tokio::test(flavor = "current_thread")]
async fn session_language_does_not_leak_to_the_next_borrower() -> Result<(), SqlConduitError> {
    let server = ScriptedServer::new();
    let registry = server.registry();

    let british = SqlClient::new(std::sync::Arc::clone(&registry), single_connection())?;
    british.set_language("british").await?;
    assert_eq!(probe(&british).await?.language, "british");

    let plain = SqlClient::new(registry, single_connection())?;
    assert_eq!(probe(&plain).await?.language, DEFAULT_LANGUAGE);
    assert_eq!(server.connects(), 1);
    Ok(())
}

#[tokio::test(flavor = "current_thread")]
async fn commit_and_rollback_finish_the_transaction() -> Result<(), SqlConduitError> {
    let server = ScriptedServer::new();
    let client = SqlClient::new(server.registry(), single_connection())?;
    let ct = CancellationToken::new();

    client
        .begin_transaction(IsolationLevel::RepeatableRead, &ct)
        .await?;
    assert!(matches!(
        client
            .begin_transaction(IsolationLevel::ReadCommitted, &ct)
            .await,
        Err(SqlConduitError::CommandError { .. })
    ));
    client.commit().await?;
    assert!(!client.in_transaction());
    assert_eq!(probe(&client).await?.trancount, 0);

    client
        .begin_transaction(IsolationLevel::Snapshot, &ct)
        .await?;
    assert_eq!(probe(&client).await?.isolation, "SNAPSHOT");
    client.rollback().await?;
    assert!(matches!(
        client.rollback().await,
        Err(SqlConduitError::CommandError { .. })
    ));
    assert_eq!(probe(&client).await?.trancount, 0);
    Ok(())
}

#[tokio::test(flavor = "current_thread")]
async fn transaction_connection_serves_one_stream_at_a_time() -> Result<(), SqlConduitError> {
    let server = ScriptedServer::new();
    server.script(
        "SELECT n FROM slow",
        vec![Step::numbers("n", 1..=50).with_row_delay(Duration::from_millis(5))],
    );
    let client = SqlClient::new(server.registry(), single_connection())?;
    let ct = CancellationToken::new();
    client
        .begin_transaction(IsolationLevel::ReadCommitted, &ct)
        .await?;

    let mut results = client.execute_streaming("SELECT n FROM slow", &ct).await?;
    assert!(matches!(
        client.execute_collected(SESSION_PROBE, &ct).await,
        Err(SqlConduitError::ConnectionBusy(_))
    ));
    assert!(matches!(
        client.commit().await,
        Err(SqlConduitError::ConnectionBusy(_))
    ));

    let records = results.next().await.expect("result")?.into_records();
    assert_eq!(records.collect_records().await?.len(), 50);
    assert!(results.next().await.is_none());
    results.execution().wait().await;

    // The connection is back in the transaction slot.
    assert_eq!(probe(&client).await?.trancount, 1);
    client.commit().await?;
    Ok(())
}

#[tokio::test(flavor = "current_thread")]
async fn disconnect_during_a_transaction_stream_returns_the_connection() -> Result<(), SqlConduitError>
{
    let server = ScriptedServer::new();
    server.script(
        "SELECT n FROM big_table",
        vec![Step::numbers("n", 1..=10_000).with_row_delay(Duration::from_millis(2))],
    );
    let registry = server.registry();
    let ct = CancellationToken::new();

    let first = SqlClient::new(std::sync::Arc::clone(&registry), single_connection())?;
    first
        .begin_transaction(IsolationLevel::Serializable, &ct)
        .await?;
    let mut results = first.execute_streaming("SELECT n FROM big_table", &ct).await?;
    let mut records = results.next().await.expect("result")?.into_records();
    records.next().await.expect("row")?;

    first.disconnect().await;
    assert_eq!(results.execution().wait().await, ExecutionState::Cancelled);
    assert!(matches!(
        records.next().await,
        Some(Err(SqlConduitError::Cancelled(CancelReason::Disconnected)))
    ));
    assert!(!first.in_transaction());

    let second = SqlClient::new(registry, single_connection())?;
    let after = probe(&second).await?;
    assert_eq!(after.trancount, 0);
    assert_eq!(after.isolation, IsolationLevel::default().as_sql());
    assert_eq!(server.connects(), 1);
    assert_eq!(server.sessions()[0].trancount, 0);
    Ok(())
}

#[tokio::test(flavor = "current_thread")]
async fn exhausted_pool_times_out_with_pool_exhausted() -> Result<(), SqlConduitError> {
    let server = ScriptedServer::new();
    server.script(
        "WAITFOR DELAY '00:00:05'",
        vec![Step::Sleep(Duration::from_secs(5))],
    );
    let client = SqlClient::new(server.registry(), single_connection())?;
    let ct = CancellationToken::new();

    let holder = client
        .execute_streaming("WAITFOR DELAY '00:00:05'", &ct)
        .await?;
    let err = client
        .execute_collected(SESSION_PROBE, &ct)
        .await
        .expect_err("pool has no capacity");
    assert!(matches!(err, SqlConduitError::PoolExhausted(_)));

    let status = client.pool_status().await.expect("pool exists");
    assert_eq!(status.connections, 1);
    assert_eq!(status.in_use(), 1);

    holder.cancel();
    assert_eq!(holder.execution().wait().await, ExecutionState::Cancelled);
    assert_eq!(probe(&client).await?.trancount, 0);
    Ok(())
}

#[tokio::test(flavor = "current_thread")]
async fn command_errors_leave_the_connection_reusable() -> Result<(), SqlConduitError> {
    let server = ScriptedServer::new();
    server.script(
        "SELECT * FROM nope",
        vec![Step::fail(208, "Invalid object name 'nope'.")],
    );
    let client = SqlClient::new(server.registry(), single_connection())?;
    let ct = CancellationToken::new();

    let err = client
        .execute_collected("SELECT * FROM nope", &ct)
        .await
        .expect_err("server rejects the statement");
    assert!(!err.is_connection_fatal());
    assert!(matches!(
        err,
        SqlConduitError::CommandError {
            number: Some(208),
            ..
        }
    ));

    let unknown = client
        .execute_collected("SELECT * FROM never_scripted", &ct)
        .await
        .expect_err("unknown batch");
    assert!(matches!(
        unknown,
        SqlConduitError::CommandError {
            number: Some(2812),
            ..
        }
    ));

    assert_eq!(probe(&client).await?.trancount, 0);
    assert_eq!(server.connects(), 1);
    let status = client.pool_status().await.expect("pool exists");
    assert_eq!(status.idle, 1);
    Ok(())
}

#[tokio::test(flavor = "current_thread")]
async fn refused_connections_surface_without_pooling() -> Result<(), SqlConduitError> {
    let server = ScriptedServer::new();
    server.refuse_connections(true);
    let options = ClientOptions {
        pooling: false,
        ..ScriptedServer::options()
    };
    let client = SqlClient::new(server.registry(), options)?;
    let ct = CancellationToken::new();

    let err = client.connect(&ct).await.expect_err("refused");
    assert!(matches!(err, SqlConduitError::ConnectionError(_)));
    assert_eq!(client.state(), ConnectionState::Closed);

    server.refuse_connections(false);
    client.connect(&ct).await?;
    client.connect(&ct).await?;
    assert_eq!(client.state(), ConnectionState::Open);
    assert_eq!(probe(&client).await?.trancount, 0);
    // Unpooled connections are closed on release, never reset.
    assert_eq!(server.resets(), 0);
    assert!(server.sessions().iter().all(|s| s.closed));
    Ok(())
}

#[tokio::test(flavor = "current_thread")]
async fn cloned_clients_get_their_own_pool() -> Result<(), SqlConduitError> {
    let server = ScriptedServer::new();
    let client = SqlClient::new(server.registry(), ScriptedServer::options())?;
    let ct = CancellationToken::new();
    client.connect(&ct).await?;

    let other = client.clone_with(Some("reporting"), None, None);
    assert_eq!(other.options().database, "reporting");
    assert_eq!(other.state(), ConnectionState::Closed);
    assert!(other.pool_status().await.is_none());
    other.connect(&ct).await?;
    assert!(other.pool_status().await.is_some());
    assert_ne!(client.options().identity(), other.options().identity());
    Ok(())
}
