use sqlbridge::prelude::*;
use sqlbridge::test_utils::{MockReply, mock_database, test_options};

type TestResult = Result<(), Box<dyn std::error::Error>>;

#[tokio::test]
async fn rented_commands_come_back_clean() -> TestResult {
    let (db, factory) = mock_database(test_options(Provider::SqlServer))?;

    db.with_transaction(
        IsolationLevel::Unspecified,
        ScopeOption::Required,
        async |_scope: &TransactionScope| {
            db.execute(
                &CommandRequest::text("UPDATE accounts SET balance = @balance WHERE id = @id")
                    .param(ParameterDefinition::input("balance", 10))
                    .param(ParameterDefinition::input("id", 1)),
            )
            .await?;
            Ok::<_, DbError>(())
        },
    )
    .await?;

    db.execute(&CommandRequest::text("DELETE FROM audit_log")).await?;

    let commands = factory.commands();
    assert_eq!(commands.len(), 2);
    assert_eq!(commands[0].parameter_names, vec!["@balance", "@id"]);
    assert!(commands[0].transaction_id.is_some());

    let second = &commands[1];
    assert_eq!(second.text, "DELETE FROM audit_log");
    assert!(second.parameter_names.is_empty());
    assert!(second.values.is_empty());
    assert_eq!(second.transaction_id, None);

    let stats = db.command_pool().command_stats();
    assert_eq!(stats.created, 1, "second call should reuse the first command");
    assert_eq!(stats.retained, 1);
    assert_eq!(db.command_pool().parameter_stats().retained, 2);
    Ok(())
}

#[tokio::test]
async fn reused_parameters_do_not_leak_metadata() -> TestResult {
    let (db, factory) = mock_database(test_options(Provider::SqlServer))?;

    db.execute(
        &CommandRequest::stored_procedure("dbo.rename_user")
            .param(ParameterDefinition::input("name", "ada").with_provider_type("nvarchar(50)"))
            .param(ParameterDefinition::output("status", DbType::Text).with_size(16)),
    )
    .await?;
    db.execute(
        &CommandRequest::text("SELECT 1 WHERE @flag = 1")
            .param(ParameterDefinition::input("flag", 1)),
    )
    .await?;

    let commands = factory.commands();
    let second = &commands[1];
    assert_eq!(second.kind, CommandKind::Text);
    assert_eq!(second.parameter_names, vec!["@flag"]);
    assert_eq!(second.directions, vec![ParameterDirection::Input]);
    assert_eq!(second.provider_types, vec![None]);
    assert_eq!(second.sizes, vec![None]);
    assert_eq!(second.values, vec![DbValue::Int(1)]);
    Ok(())
}

#[tokio::test]
async fn output_keys_match_declared_outputs() -> TestResult {
    let (db, factory) = mock_database(test_options(Provider::SqlServer))?;
    factory.reply(MockReply::Outputs {
        affected: 1,
        values: vec![
            ("@status".to_string(), DbValue::Text("OK".into())),
            ("@attempts".to_string(), DbValue::Int(4)),
            ("@ret".to_string(), DbValue::Int(0)),
        ],
    });

    let result = db
        .execute_stored_procedure(
            "dbo.place_order",
            [
                ParameterDefinition::input("customer", 7),
                ParameterDefinition::output("status", DbType::Text).with_size(16),
                ParameterDefinition::input_output("attempts", 3),
                ParameterDefinition::return_value("ret", DbType::Int32),
            ],
        )
        .await?;

    let keys: Vec<&str> = result.outputs.keys().collect();
    assert_eq!(keys, vec!["status", "attempts", "ret"]);
    assert!(!result.outputs.contains("customer"));
    assert_eq!(result.output("STATUS"), Some(&DbValue::Text("OK".into())));
    assert_eq!(result.output("@attempts"), Some(&DbValue::Int(4)));
    assert_eq!(result.rows_affected, 1);
    Ok(())
}

#[tokio::test]
async fn zero_capacity_pool_never_retains() -> TestResult {
    let (db, _factory) = mock_database(
        test_options(Provider::Postgres)
            .command_pool_capacity(0)
            .parameter_pool_capacity(0),
    )?;
    for _ in 0..3 {
        db.execute(
            &CommandRequest::text("UPDATE t SET x = @x").param(ParameterDefinition::input("x", 1)),
        )
        .await?;
    }
    let stats = db.command_pool().command_stats();
    assert_eq!(stats.created, 3);
    assert_eq!(stats.retained, 0);
    assert_eq!(stats.discarded, 3);
    Ok(())
}

fn outstanding(stats: &sqlbridge::pool::PoolStats) -> i64 {
    stats.created as i64 - stats.discarded as i64 - stats.retained as i64
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_callers_keep_pool_counts_consistent() -> TestResult {
    let (db, factory) =
        mock_database(test_options(Provider::Postgres).command_pool_capacity(2))?;
    let db = std::sync::Arc::new(db);

    let mut tasks = Vec::new();
    for worker in 0..8_i64 {
        let db = db.clone();
        tasks.push(tokio::spawn(async move {
            for n in 0..5_i64 {
                db.execute(
                    &CommandRequest::text("UPDATE counters SET n = @n WHERE worker = @worker")
                        .param(ParameterDefinition::input("n", n))
                        .param(ParameterDefinition::input("worker", worker)),
                )
                .await?;
            }
            Ok::<_, DbError>(())
        }));
    }
    for task in tasks {
        task.await??;
    }

    assert_eq!(factory.commands().len(), 40);
    assert_eq!(factory.open_connections(), 0);
    let commands = db.command_pool().command_stats();
    assert!(commands.retained <= 2);
    assert_eq!(outstanding(&commands), 0);
    assert_eq!(outstanding(&db.command_pool().parameter_stats()), 0);

    // A live reader keeps exactly one command out of the pool.
    let reader = db.open_reader(&CommandRequest::text("SELECT 1")).await?;
    assert_eq!(outstanding(&db.command_pool().command_stats()), 1);
    reader.close().await?;
    assert_eq!(outstanding(&db.command_pool().command_stats()), 0);
    Ok(())
}
