use sqlbridge::driver::BufferedResult;
use sqlbridge::prelude::*;
use sqlbridge::test_utils::{MockEvent, MockReply, mock_database, test_options};

type TestResult = Result<(), Box<dyn std::error::Error>>;

fn user_stats_request() -> CommandRequest {
    CommandRequest::stored_procedure("get_user_stats")
        .param(ParameterDefinition::input("p_user", 42))
        .param(ParameterDefinition::output("order_count", DbType::Int64))
        .param(ParameterDefinition::output("last_status", DbType::Text))
}

#[tokio::test]
async fn postgres_out_parameters_come_from_the_result_row() -> TestResult {
    let (db, factory) = mock_database(test_options(Provider::Postgres))?;
    factory.reply(MockReply::rows(
        &["last_status", "order_count"],
        vec![vec![DbValue::Text("shipped".into()), DbValue::Int(17)]],
    ));

    let result = db.execute(&user_stats_request()).await?;
    assert_eq!(result.output("order_count"), Some(&DbValue::Int(17)));
    assert_eq!(result.output("last_status"), Some(&DbValue::Text("shipped".into())));
    assert!(!result.outputs.contains("p_user"));

    let commands = factory.commands();
    assert_eq!(commands.len(), 1);
    let sent = &commands[0];
    assert_eq!(sent.text, "SELECT * FROM get_user_stats(@p_user)");
    assert_eq!(sent.kind, CommandKind::Text);
    assert_eq!(sent.parameter_names, vec!["p_user"]);
    assert_eq!(sent.behavior, ReadBehavior::SINGLE_ROW);
    assert_eq!(factory.open_connections(), 0);
    Ok(())
}

#[tokio::test]
async fn postgres_out_parameters_fall_back_to_position() -> TestResult {
    let (db, factory) = mock_database(test_options(Provider::Postgres))?;
    factory.reply(MockReply::rows(
        &["count", "status"],
        vec![vec![DbValue::Int(3), DbValue::Text("open".into())]],
    ));

    let result = db.execute(&user_stats_request()).await?;
    assert_eq!(result.output("order_count"), Some(&DbValue::Int(3)));
    assert_eq!(result.output("last_status"), Some(&DbValue::Text("open".into())));
    Ok(())
}

#[tokio::test]
async fn postgres_out_name_matches_are_not_reused_by_position() -> TestResult {
    let (db, factory) = mock_database(test_options(Provider::Postgres))?;
    factory.reply(MockReply::rows(
        &["last_status", "cnt"],
        vec![vec![DbValue::Text("shipped".into()), DbValue::Int(8)]],
    ));

    let result = db.execute(&user_stats_request()).await?;
    assert_eq!(result.output("order_count"), Some(&DbValue::Int(8)));
    assert_eq!(result.output("last_status"), Some(&DbValue::Text("shipped".into())));
    Ok(())
}

#[tokio::test]
async fn postgres_out_without_a_row_fails_and_releases() -> TestResult {
    let (db, factory) = mock_database(test_options(Provider::Postgres))?;
    factory.reply(MockReply::rows(&["order_count", "last_status"], vec![]));

    let err = db.execute(&user_stats_request()).await.unwrap_err();
    assert!(matches!(err, DbError::ProviderFeature(_)), "got {err:?}");
    // Not a transient failure, so only one round trip.
    assert_eq!(factory.commands().len(), 1);
    assert_eq!(factory.open_connections(), 0);
    Ok(())
}

#[tokio::test]
async fn postgres_scalar_prefers_the_return_value() -> TestResult {
    let (db, factory) = mock_database(test_options(Provider::Postgres))?;
    factory.reply(MockReply::rows(
        &["tax", "total"],
        vec![vec![DbValue::Decimal("1.50".into()), DbValue::Decimal("16.50".into())]],
    ));

    let result = db
        .scalar_stored_procedure(
            "invoice_total",
            [
                ParameterDefinition::input("p_invoice", 9),
                ParameterDefinition::output("tax", DbType::Decimal),
                ParameterDefinition::return_value("total", DbType::Decimal),
            ],
        )
        .await?;
    assert_eq!(result.scalar, Some(DbValue::Decimal("16.50".into())));
    assert_eq!(result.output("tax"), Some(&DbValue::Decimal("1.50".into())));
    Ok(())
}

#[tokio::test]
async fn sql_server_outputs_stay_on_the_parameters() -> TestResult {
    let (db, factory) = mock_database(test_options(Provider::SqlServer))?;
    factory.reply(MockReply::Outputs {
        affected: 2,
        values: vec![("@order_count".to_string(), DbValue::Int(5))],
    });

    let result = db.execute(&user_stats_request()).await?;
    assert_eq!(result.rows_affected, 2);
    assert_eq!(result.output("order_count"), Some(&DbValue::Int(5)));
    let sent = &factory.commands()[0];
    assert_eq!(sent.kind, CommandKind::StoredProcedure);
    assert_eq!(sent.text, "get_user_stats");
    Ok(())
}

#[tokio::test]
async fn ref_cursor_outside_oracle_is_rejected_before_connecting() -> TestResult {
    for provider in [Provider::SqlServer, Provider::Postgres] {
        let (db, factory) = mock_database(test_options(provider))?;
        let request = CommandRequest::stored_procedure("pkg_orders.open_all")
            .param(ParameterDefinition::cursor("p_orders"));
        let err = db.open_ref_cursor(&request, "p_orders").await.unwrap_err();
        assert!(matches!(err, DbError::ProviderNotSupported(_)), "got {err:?}");
        assert_eq!(factory.connections_created(), 0);
    }
    Ok(())
}

#[tokio::test]
async fn oracle_ref_cursor_reads_rows_on_the_sync_path() -> TestResult {
    let (db, factory) = mock_database(test_options(Provider::Oracle))?;
    factory.reply(MockReply::Cursor {
        parameter: "p_orders".to_string(),
        result: BufferedResult::new(
            vec!["ID".to_string(), "STATUS".to_string()],
            vec![
                vec![DbValue::Int(1), DbValue::Text("NEW".into())],
                vec![DbValue::Int(2), DbValue::Text("PAID".into())],
            ],
        ),
    });

    let request = CommandRequest::stored_procedure("pkg_orders.open_for_customer")
        .param(ParameterDefinition::input("p_customer", 7))
        .param(ParameterDefinition::cursor("p_orders"));
    let mut lease = db.open_ref_cursor(&request, "P_ORDERS").await?;
    assert_eq!(lease.columns(), ["ID", "STATUS"]);

    let mut ids = Vec::new();
    while let Some(row) = lease.next_row().await? {
        ids.push(row.require("id")?.as_int().ok_or("id is not an integer")?);
    }
    let metrics = lease.close().await?;

    assert_eq!(ids, vec![1, 2]);
    assert_eq!(metrics.rows, 2);
    assert_eq!(factory.open_connections(), 0);

    let events = factory.events();
    assert!(events.iter().all(MockEvent::is_sync), "{events:?}");
    let sent = &factory.commands()[0];
    assert_eq!(sent.parameter_names, vec![":p_customer", ":p_orders"]);
    Ok(())
}

#[tokio::test]
async fn oracle_cursor_missing_from_the_call_is_a_provider_feature_error() -> TestResult {
    let (db, factory) = mock_database(test_options(Provider::Oracle))?;
    let request = CommandRequest::stored_procedure("pkg_orders.open_all")
        .param(ParameterDefinition::cursor("p_orders"));

    let err = db.open_ref_cursor(&request, "p_orders").await.unwrap_err();
    assert!(matches!(err, DbError::ProviderFeature(_)), "got {err:?}");

    let err = db.open_ref_cursor(&request, "p_missing").await.unwrap_err();
    assert!(matches!(err, DbError::ProviderFeature(msg) if msg.contains("not bound")));
    assert_eq!(factory.open_connections(), 0);
    Ok(())
}

#[tokio::test]
async fn oracle_commands_never_take_the_async_path() -> TestResult {
    let (db, factory) = mock_database(test_options(Provider::Oracle))?;
    factory.reply(MockReply::Affected(3));
    factory.reply(MockReply::rows(&["N"], vec![vec![DbValue::Int(1)]]));

    let result = db
        .execute(
            &CommandRequest::text("UPDATE orders SET status = 'X' WHERE id = :id")
                .param(ParameterDefinition::input("id", 5)),
        )
        .await?;
    assert_eq!(result.rows_affected, 3);
    let table = db.load_table(&CommandRequest::text("SELECT 1 AS n FROM dual")).await?;
    assert_eq!(table.len(), 1);

    ambient::scope(async {
        let mut scope = db.begin_transaction().await?;
        scope.begin_savepoint("sp1").await?;
        scope.commit().await?;
        scope.dispose().await?;
        Ok::<_, DbError>(())
    })
    .await?;

    let events = factory.events();
    assert!(!events.is_empty());
    assert!(events.iter().all(MockEvent::is_sync), "{events:?}");
    Ok(())
}

#[tokio::test]
async fn async_providers_stay_async() -> TestResult {
    let (db, factory) = mock_database(test_options(Provider::Postgres))?;
    db.execute(&CommandRequest::text("VACUUM")).await?;
    assert!(factory.events().iter().all(|e| !e.is_sync()));
    Ok(())
}
