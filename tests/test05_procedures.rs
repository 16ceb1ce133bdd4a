#![cfg(feature = "test-utils")]

use std::time::Duration;

use futures_util::StreamExt;
use sql_conduit::prelude::*;
use sql_conduit::test_utils::{ScriptedServer, Step};

const NEXT_INVOICE: &str = "dbo.next_invoice";

fn invoice_procedure(server: &ScriptedServer) {
    server.procedure(
        NEXT_INVOICE,
        vec![
            Step::numbers("line", 1..=2),
            Step::Sleep(Duration::from_millis(150)),
            Step::RowsAffected(1),
            Step::Output(vec![
                ("@number".into(), RowValues::Int(1042)),
                ("@note".into(), RowValues::Null),
            ]),
        ],
    );
}

fn invoice_call() -> Command {
    Command::procedure(NEXT_INVOICE)
        .param(Param::named("@customer", 7))
        .param(Param::output("@number", SqlType::Int))
        .param(Param::named("@note", "draft").in_out())
}

#[tokio::test(flavor = "current_thread")]
async fn output_parameters_are_available_after_completion() -> Result<(), SqlConduitError> {
    let server = ScriptedServer::new();
    invoice_procedure(&server);
    let client = SqlClient::new(server.registry(), ScriptedServer::options())?;
    let ct = CancellationToken::new();

    let mut results = client.execute_streaming(invoice_call(), &ct).await?;
    let lines = results.next().await.expect("result")?.into_records();
    assert_eq!(lines.collect_records().await?.len(), 2);
    assert!(results.execution().output_parameters().is_none());

    assert!(results.next().await.is_none());
    assert_eq!(results.execution().wait().await, ExecutionState::Completed);
    let outputs = results
        .execution()
        .output_parameters()
        .expect("outputs after completion");
    assert_eq!(outputs.get("number"), Some(&RowValues::Int(1042)));
    assert_eq!(outputs.get("@NUMBER"), Some(&RowValues::Int(1042)));
    assert_eq!(outputs.get("note"), Some(&RowValues::Null));
    assert_eq!(outputs.get("customer"), None);
    assert_eq!(server.procedure_batches(NEXT_INVOICE).len(), 1);
    Ok(())
}

#[tokio::test(flavor = "current_thread")]
async fn collected_call_returns_results_and_outputs() -> Result<(), SqlConduitError> {
    let server = ScriptedServer::new();
    invoice_procedure(&server);
    let client = SqlClient::new(server.registry(), ScriptedServer::options())?;
    let ct = CancellationToken::new();

    let (sets, outputs) = client
        .execute_collected_with_outputs(invoice_call(), &ct)
        .await?;
    assert_eq!(sets.len(), 1);
    assert_eq!(sets[0].rows_affected, Some(2));
    let number: i64 = from_value(outputs.get("number").unwrap_or(&RowValues::Null))?;
    assert_eq!(number, 1042);
    assert_eq!(outputs.iter().count(), 2);
    Ok(())
}

#[tokio::test(flavor = "current_thread")]
async fn parameter_shapes_are_checked_before_submission() -> Result<(), SqlConduitError> {
    let server = ScriptedServer::new();
    invoice_procedure(&server);
    let client = SqlClient::new(server.registry(), ScriptedServer::options())?;
    let ct = CancellationToken::new();

    let positional = Command::procedure(NEXT_INVOICE).bind(7);
    assert!(matches!(
        client.execute_collected(positional, &ct).await,
        Err(SqlConduitError::ParameterError(_))
    ));

    let output_on_text =
        Command::text("SELECT 1").param(Param::output("@n", SqlType::Int));
    assert!(matches!(
        client.execute_collected(output_on_text, &ct).await,
        Err(SqlConduitError::ParameterError(_))
    ));

    assert!(server.procedure_batches(NEXT_INVOICE).is_empty());
    assert_eq!(server.connects(), 0);
    Ok(())
}

#[tokio::test(flavor = "current_thread")]
async fn placeholders_are_translated_only_when_enabled() -> Result<(), SqlConduitError> {
    let server = ScriptedServer::new();
    server.script(
        "SELECT name FROM items WHERE id = @P1 AND kind = @P2",
        vec![Step::EchoParams],
    );
    let ct = CancellationToken::new();
    let command = || {
        Command::text("SELECT name FROM items WHERE id = $1 AND kind = $2")
            .bind(5)
            .bind("tool")
    };

    let translating = SqlClient::new(
        server.registry(),
        ClientOptions {
            translate_placeholders: true,
            ..ScriptedServer::options()
        },
    )?;
    let sets = translating.execute_collected(command(), &ct).await?;
    let echoed = &sets[0].rows[0];
    assert_eq!(echoed.get("p1"), Some(&RowValues::Int(5)));
    assert_eq!(echoed.get("p2"), Some(&RowValues::Text("tool".into())));

    let literal = SqlClient::new(server.registry(), ScriptedServer::options())?;
    assert!(matches!(
        literal.execute_collected(command(), &ct).await,
        Err(SqlConduitError::CommandError {
            number: Some(2812),
            ..
        })
    ));
    Ok(())
}

#[test]
fn options_load_from_json_and_reject_bad_pools() {
    let opts = ClientOptions::from_json(
        r#"{ "server": "db1", "database": "sales", "user": "app", "password": "pw",
             "pooling": false, "connect_timeout_secs": 1.5, "command_timeout_secs": 0 }"#,
    )
    .expect("valid options");
    assert!(!opts.pooling);
    assert_eq!(opts.connect_timeout, Duration::from_millis(1500));
    assert_eq!(opts.command_timeout, None);
    assert_eq!(opts.max_pool_size, ClientOptions::default().max_pool_size);
    assert!(!format!("{opts:?}").contains("pw"));

    let err = ClientOptions::from_json(r#"{ "min_pool_size": 5, "max_pool_size": 2 }"#)
        .expect_err("min above max");
    assert!(matches!(err, SqlConduitError::ConfigError(_)));
    assert!(matches!(
        ClientOptions::from_json("{ not json"),
        Err(SqlConduitError::ConfigError(_))
    ));

    let built = ClientOptions::builder("db1".into(), "sales".into(), "app".into(), "pw".into())
        .pool_size(2, 4)
        .translation(true)
        .command_timeout(Some(Duration::from_secs(3)))
        .finish()
        .expect("built");
    assert_eq!(built.identity(), opts.identity());
    assert!(built.translate_placeholders);
    assert!(
        ClientOptions::builder("db1".into(), "sales".into(), "app".into(), "pw".into())
            .pool_size(0, 0)
            .finish()
            .is_err()
    );
}
