#![cfg(feature = "test-utils")]

use std::time::{Duration, Instant};

use futures_util::StreamExt;
use sql_conduit::prelude::*;
use sql_conduit::test_utils::{ScriptedServer, Step};

const TWO_RESULTS: &str = "SELECT n FROM small; SELECT n FROM large";

#[tokio::test(flavor = "current_thread")]
async fn every_result_and_row_arrives_in_server_order() -> Result<(), SqlConduitError> {
    let server = ScriptedServer::new();
    server.script(
        TWO_RESULTS,
        vec![
            Step::numbers("n", 1..=3),
            Step::RowsAffected(4),
            Step::numbers("n", 100..=199),
        ],
    );
    let client = SqlClient::new(server.registry(), ScriptedServer::options())?;
    let ct = CancellationToken::new();

    let mut results = client.execute_streaming(TWO_RESULTS, &ct).await?;
    let mut seen = Vec::new();
    while let Some(result) = results.next().await {
        let result = result?;
        let index = result.index();
        assert_eq!(result.columns().names().collect::<Vec<_>>(), vec!["n"]);
        let mut records = result.into_records();
        let mut values = Vec::new();
        while let Some(record) = records.next().await {
            let record = record?;
            values.push(*record.get("n").and_then(RowValues::as_int).unwrap_or(&-1));
        }
        assert_eq!(records.rows_affected(), Some(values.len() as u64));
        seen.push((index, values));
    }

    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0], (0, vec![1, 2, 3]));
    assert_eq!(seen[1].0, 1);
    assert_eq!(seen[1].1, (100..=199).collect::<Vec<i64>>());

    let execution = results.execution();
    assert_eq!(execution.wait().await, ExecutionState::Completed);
    assert_eq!(execution.rows_affected(), Some(107));
    assert!(execution.error().is_none());
    Ok(())
}

#[tokio::test(flavor = "current_thread")]
async fn collected_and_single_column_helpers_drain_the_stream() -> Result<(), SqlConduitError> {
    let server = ScriptedServer::new();
    server.script(
        "SELECT name, qty FROM stock",
        vec![Step::result(
            &[("name", SqlType::Text), ("qty", SqlType::Int)],
            vec![
                vec!["bolt".into(), RowValues::Int(40)],
                vec!["nut".into(), RowValues::Int(12)],
            ],
        )],
    );
    server.script("UPDATE stock SET qty = 0", vec![Step::RowsAffected(2)]);
    let client = SqlClient::new(server.registry(), ScriptedServer::options())?;
    let ct = CancellationToken::new();

    let sets = client
        .execute_collected("SELECT name, qty FROM stock", &ct)
        .await?;
    assert_eq!(sets.len(), 1);
    assert_eq!(sets[0].len(), 2);
    assert_eq!(sets[0].rows[1].get("QTY"), Some(&RowValues::Int(12)));

    let names: Vec<String> = client
        .execute_single_column("SELECT name, qty FROM stock", &ct)
        .await?;
    assert_eq!(names, vec!["bolt".to_string(), "nut".to_string()]);

    let affected = client
        .execute_non_query("UPDATE stock SET qty = 0", &ct)
        .await?;
    assert_eq!(affected, 2);
    Ok(())
}

#[tokio::test(flavor = "current_thread")]
async fn slow_consumer_does_not_hold_back_the_server() -> Result<(), SqlConduitError> {
    let server = ScriptedServer::new();
    server.script("SELECT n FROM quick", vec![Step::numbers("n", 1..=10)]);
    let client = SqlClient::new(server.registry(), ScriptedServer::options())?;
    let ct = CancellationToken::new();

    let mut results = client.execute_streaming("SELECT n FROM quick", &ct).await?;
    let mut consumed = 0;
    while let Some(result) = results.next().await {
        let mut records = result?.into_records();
        while let Some(record) = records.next().await {
            record?;
            consumed += 1;
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
    let client_done = Instant::now();

    assert_eq!(consumed, 10);
    let batch = server
        .batches("SELECT n FROM quick")
        .pop()
        .expect("batch recorded");
    let server_done = batch.finished.expect("server finished");
    assert!(server_done < client_done);
    Ok(())
}

#[tokio::test(flavor = "current_thread")]
async fn first_result_is_visible_before_the_second_statement_runs() -> Result<(), SqlConduitError>
{
    let sql = "SELECT n FROM first; RAISERROR('step', 0, 1) WITH NOWAIT; SELECT n FROM second";
    let server = ScriptedServer::new();
    server.script(
        sql,
        vec![
            Step::Statement("first".into()),
            Step::numbers("n", 1..=3),
            Step::Progress("first statement done".into()),
            Step::Sleep(Duration::from_millis(300)),
            Step::Statement("second".into()),
            Step::numbers("n", 4..=6),
        ],
    );
    let client = SqlClient::new(server.registry(), ScriptedServer::options())?;
    let ct = CancellationToken::new();

    let mut results = client.execute_streaming(sql, &ct).await?;
    let first = results.next().await.expect("first result")?;
    let rows = first.into_records().collect_records().await?;
    assert_eq!(rows.len(), 3);
    let first_seen = Instant::now();
    assert!(server.statement_started("first").is_some());
    assert!(server.statement_started("second").is_none());

    let second = results.next().await.expect("second result")?;
    assert_eq!(second.into_records().collect_records().await?.len(), 3);
    let second_started = server.statement_started("second").expect("second ran");
    assert!(first_seen < second_started);
    assert!(results.next().await.is_none());
    Ok(())
}

#[tokio::test(flavor = "current_thread")]
async fn abandoned_results_are_skipped_without_stalling() -> Result<(), SqlConduitError> {
    let server = ScriptedServer::new();
    server.script(
        TWO_RESULTS,
        vec![Step::numbers("n", 1..=500), Step::numbers("n", 7..=8)],
    );
    let client = SqlClient::new(server.registry(), ScriptedServer::options())?;
    let ct = CancellationToken::new();

    let mut results = client.execute_streaming(TWO_RESULTS, &ct).await?;
    results.next().await.expect("first result")?.abandon();
    let second = results.next().await.expect("second result")?;
    assert_eq!(second.index(), 1);
    let values: Vec<i64> = second
        .into_records()
        .typed::<(i64,)>(MapMode::ByPosition)
        .map(|row| row.map(|(n,)| n))
        .collect::<Vec<_>>()
        .await
        .into_iter()
        .collect::<Result<_, _>>()?;
    assert_eq!(values, vec![7, 8]);
    assert!(results.next().await.is_none());
    assert_eq!(results.execution().wait().await, ExecutionState::Completed);
    Ok(())
}

#[tokio::test(flavor = "current_thread")]
async fn server_errors_close_the_stream_with_an_error() -> Result<(), SqlConduitError> {
    let server = ScriptedServer::new();
    server.script(
        "SELECT n FROM t; SELECT * FROM missing",
        vec![
            Step::numbers("n", 1..=2),
            Step::fail(208, "Invalid object name 'missing'."),
        ],
    );
    let client = SqlClient::new(server.registry(), ScriptedServer::options())?;
    let ct = CancellationToken::new();

    let mut results = client
        .execute_streaming("SELECT n FROM t; SELECT * FROM missing", &ct)
        .await?;
    let first = results.next().await.expect("first result")?;
    assert_eq!(first.into_records().collect_records().await?.len(), 2);
    let err = results
        .next()
        .await
        .expect("terminal error")
        .expect_err("stream must end with the server error");
    assert!(matches!(
        err,
        SqlConduitError::CommandError {
            number: Some(208),
            ..
        }
    ));
    assert!(results.next().await.is_none());
    assert_eq!(results.execution().wait().await, ExecutionState::Faulted);
    Ok(())
}
