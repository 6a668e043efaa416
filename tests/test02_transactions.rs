use sqlbridge::prelude::*;
use sqlbridge::test_utils::{MockEvent, MockOp, mock_database, test_options};
use sqlbridge::transaction::ScopeKind;

type TestResult = Result<(), Box<dyn std::error::Error>>;

fn is_commit(event: &MockEvent) -> bool {
    matches!(event, MockEvent::Commit { .. })
}

fn is_rollback(event: &MockEvent) -> bool {
    matches!(event, MockEvent::Rollback { .. })
}

#[tokio::test]
async fn dependent_commit_does_not_touch_the_server() -> TestResult {
    let (db, factory) = mock_database(test_options(Provider::SqlServer))?;

    ambient::scope(async {
        let mut outer = db.begin_transaction().await?;
        let mut inner = db.begin_transaction().await?;
        assert_eq!(outer.kind(), ScopeKind::Root);
        assert_eq!(inner.kind(), ScopeKind::Dependent);
        assert!(inner.connection().same_as(outer.connection()));
        assert_eq!(
            inner.transaction().map(|t| t.id()),
            outer.transaction().map(|t| t.id())
        );

        inner.commit().await?;
        inner.dispose().await?;
        assert_eq!(factory.count(is_commit), 0);

        outer.commit().await?;
        outer.dispose().await?;
        Ok::<_, DbError>(())
    })
    .await?;

    assert_eq!(factory.count(is_commit), 1);
    assert_eq!(factory.connections_created(), 1);
    assert_eq!(factory.open_connections(), 0);
    Ok(())
}

#[tokio::test]
async fn requires_new_gets_its_own_connection_and_transaction() -> TestResult {
    let (db, factory) = mock_database(test_options(Provider::SqlServer))?;

    ambient::scope(async {
        let mut outer = db.begin_transaction().await?;
        let mut inner = db
            .begin_transaction_with(IsolationLevel::Serializable, ScopeOption::RequiresNew)
            .await?;
        assert_eq!(inner.kind(), ScopeKind::Root);
        assert!(!inner.connection().same_as(outer.connection()));
        let inner_tx = inner.transaction().map(|t| t.id());
        assert_ne!(inner_tx, outer.transaction().map(|t| t.id()));

        db.execute(&CommandRequest::text("INSERT INTO audit(msg) VALUES ('x')"))
            .await?;
        assert_eq!(factory.commands()[0].transaction_id, inner_tx);

        inner.commit().await?;
        inner.dispose().await?;
        outer.rollback().await?;
        outer.dispose().await?;
        Ok::<_, DbError>(())
    })
    .await?;

    assert_eq!(factory.connections_created(), 2);
    assert_eq!(factory.count(is_commit), 1);
    assert_eq!(factory.count(is_rollback), 1);
    let begins: Vec<IsolationLevel> = factory
        .events()
        .iter()
        .filter_map(|e| match e {
            MockEvent::Begin { isolation, .. } => Some(*isolation),
            _ => None,
        })
        .collect();
    assert_eq!(
        begins,
        vec![IsolationLevel::Unspecified, IsolationLevel::Serializable]
    );
    Ok(())
}

#[tokio::test]
async fn suppress_runs_outside_any_transaction() -> TestResult {
    let (db, factory) = mock_database(test_options(Provider::SqlServer))?;

    ambient::scope(async {
        let mut outer = db.begin_transaction().await?;
        let mut suppressed = db
            .begin_transaction_with(IsolationLevel::Unspecified, ScopeOption::Suppress)
            .await?;
        assert_eq!(suppressed.kind(), ScopeKind::Suppressed);
        assert!(suppressed.transaction().is_none());

        db.execute(&CommandRequest::text("UPDATE counters SET hits = hits + 1"))
            .await?;

        let err = suppressed.begin_savepoint("sp1").await.unwrap_err();
        assert!(matches!(err, DbError::TransactionFeatureNotSupported(_)));

        suppressed.commit().await?;
        suppressed.dispose().await?;
        outer.commit().await?;
        outer.dispose().await?;
        Ok::<_, DbError>(())
    })
    .await?;

    let events = factory.events();
    let begin_conn = events
        .iter()
        .find(|e| matches!(e, MockEvent::Begin { .. }))
        .map(MockEvent::connection);
    let execute = events
        .iter()
        .find(|e| matches!(e, MockEvent::Execute { .. }))
        .ok_or("no execute event")?;
    assert_ne!(Some(execute.connection()), begin_conn);
    assert_eq!(execute.command().and_then(|c| c.transaction_id), None);
    // Only the outer root commits physically.
    assert_eq!(factory.count(is_commit), 1);
    assert_eq!(factory.open_connections(), 0);
    Ok(())
}

#[tokio::test]
async fn dispose_without_commit_rolls_back_and_closes() -> TestResult {
    let (db, factory) = mock_database(test_options(Provider::Postgres))?;

    ambient::scope(async {
        let mut scope = db.begin_transaction().await?;
        db.execute(&CommandRequest::text("DELETE FROM sessions")).await?;
        scope.dispose().await?;
        // Idempotent.
        scope.dispose().await?;
        assert_eq!(ambient::depth(), 0);
        Ok::<_, DbError>(())
    })
    .await?;

    assert_eq!(factory.count(is_rollback), 1);
    assert_eq!(factory.count(is_commit), 0);
    assert_eq!(factory.open_connections(), 0);
    Ok(())
}

#[tokio::test]
async fn body_error_survives_a_failing_rollback() -> TestResult {
    let (db, factory) = mock_database(test_options(Provider::SqlServer))?;
    factory.fail_next(MockOp::Rollback, DriverErrorKind::Other);

    let outcome: Result<(), DbError> = db
        .with_transaction(
            IsolationLevel::Unspecified,
            ScopeOption::Required,
            async |_scope: &TransactionScope| {
                Err(DbError::Validation("order total must be positive".into()))
            },
        )
        .await;

    match outcome {
        Err(DbError::Validation(msg)) => assert_eq!(msg, "order total must be positive"),
        other => panic!("expected the body's error, got {other:?}"),
    }
    assert_eq!(factory.count(is_commit), 0);
    assert_eq!(factory.open_connections(), 0);
    Ok(())
}

#[tokio::test]
async fn with_transaction_commits_enlisted_work() -> TestResult {
    let (db, factory) = mock_database(test_options(Provider::SqlServer))?;

    let total = db
        .with_transaction(
            IsolationLevel::ReadCommitted,
            ScopeOption::Required,
            async |scope: &TransactionScope| {
                assert_eq!(ambient::depth(), 1);
                let moved = db
                    .execute(
                        &CommandRequest::text("UPDATE stock SET qty = qty - @n")
                            .param(ParameterDefinition::input("n", 2))
                            .in_scope(scope),
                    )
                    .await?;
                Ok::<_, DbError>(moved.rows_affected + 40)
            },
        )
        .await?;

    assert_eq!(total, 40);
    assert_eq!(factory.count(is_commit), 1);
    let command = &factory.commands()[0];
    assert!(command.transaction_id.is_some());
    assert_eq!(factory.connections_created(), 1);
    Ok(())
}

#[tokio::test]
async fn begin_requires_an_ambient_context() -> TestResult {
    let (db, factory) = mock_database(test_options(Provider::Postgres))?;
    let err = db.begin_transaction().await.unwrap_err();
    assert!(matches!(err, DbError::Configuration(_)));
    assert_eq!(factory.connections_created(), 0);
    Ok(())
}

#[tokio::test]
async fn joining_at_another_isolation_is_rejected() -> TestResult {
    let (db, _factory) = mock_database(test_options(Provider::Postgres))?;

    ambient::scope(async {
        let mut outer = db
            .begin_transaction_with(IsolationLevel::Serializable, ScopeOption::Required)
            .await?;
        let err = db
            .begin_transaction_with(IsolationLevel::ReadCommitted, ScopeOption::Required)
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Validation(_)));
        let mut same = db
            .begin_transaction_with(IsolationLevel::Unspecified, ScopeOption::Required)
            .await?;
        assert_eq!(same.kind(), ScopeKind::Dependent);
        same.dispose().await?;
        outer.dispose().await?;
        Ok::<_, DbError>(())
    })
    .await?;
    Ok(())
}

#[tokio::test]
async fn savepoints_use_provider_syntax() -> TestResult {
    let (db, factory) = mock_database(test_options(Provider::SqlServer))?;

    ambient::scope(async {
        let mut scope = db.begin_transaction().await?;
        scope.begin_savepoint("before_items").await?;
        scope.rollback_to_savepoint("before_items").await?;
        scope.release_savepoint("before_items").await?;
        let err = scope.begin_savepoint("bad name;").await.unwrap_err();
        assert!(matches!(err, DbError::Validation(_)));
        scope.commit().await?;
        scope.dispose().await?;
        Ok::<_, DbError>(())
    })
    .await?;

    let batches: Vec<String> = factory
        .events()
        .into_iter()
        .filter_map(|e| match e {
            MockEvent::Batch { sql, .. } => Some(sql),
            _ => None,
        })
        .collect();
    assert_eq!(
        batches,
        vec!["SAVE TRANSACTION before_items", "ROLLBACK TRANSACTION before_items"]
    );
    Ok(())
}

#[tokio::test]
async fn finished_scope_rejects_a_second_commit() -> TestResult {
    let (db, _factory) = mock_database(test_options(Provider::Postgres))?;

    ambient::scope(async {
        let mut scope = db.begin_transaction().await?;
        scope.commit().await?;
        let err = scope.commit().await.unwrap_err();
        assert!(matches!(err, DbError::Validation(_)));
        scope.dispose().await?;
        Ok::<_, DbError>(())
    })
    .await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn spawned_chains_do_not_see_each_others_scopes() -> TestResult {
    let (db, factory) = mock_database(test_options(Provider::SqlServer))?;
    let db = std::sync::Arc::new(db);
    let barrier = std::sync::Arc::new(tokio::sync::Barrier::new(2));

    let chain = |db: std::sync::Arc<Database>, barrier: std::sync::Arc<tokio::sync::Barrier>| {
        tokio::spawn(ambient::scope(async move {
            assert_eq!(ambient::depth(), 0);
            let mut scope = db.begin_transaction().await?;
            // Both chains hold an open root scope at this point.
            barrier.wait().await;
            let kind = scope.kind();
            let tx = scope.transaction().map(|t| t.id());
            assert_eq!(ambient::depth(), 1);
            barrier.wait().await;
            scope.commit().await?;
            scope.dispose().await?;
            Ok::<_, DbError>((kind, tx))
        }))
    };

    let first = chain(db.clone(), barrier.clone());
    let second = chain(db.clone(), barrier.clone());
    let (first_kind, first_tx) = first.await??;
    let (second_kind, second_tx) = second.await??;

    assert_eq!(first_kind, ScopeKind::Root);
    assert_eq!(second_kind, ScopeKind::Root);
    assert_ne!(first_tx, second_tx);
    assert!(!ambient::is_installed());
    assert_eq!(factory.connections_created(), 2);
    assert_eq!(factory.count(is_commit), 2);
    assert_eq!(factory.open_connections(), 0);
    Ok(())
}

#[tokio::test]
async fn scope_disposed_on_another_task_leaves_the_chain_clean() -> TestResult {
    let (db, factory) = mock_database(test_options(Provider::SqlServer))?;

    ambient::scope(async {
        let mut moved = db.begin_transaction().await?;
        let first_connection = moved.connection().clone();
        assert_eq!(ambient::depth(), 1);

        tokio::spawn(async move {
            moved.rollback().await?;
            moved.dispose().await
        })
        .await
        .map_err(|err| DbError::Configuration(err.to_string()))??;

        // The released frame no longer counts, and a new scope does not join it.
        assert_eq!(ambient::depth(), 0);
        let mut next = db.begin_transaction().await?;
        assert_eq!(next.kind(), ScopeKind::Root);
        assert!(!next.connection().same_as(&first_connection));
        next.commit().await?;
        next.dispose().await?;
        Ok::<_, DbError>(())
    })
    .await?;

    assert_eq!(factory.count(is_rollback), 1);
    assert_eq!(factory.count(is_commit), 1);
    assert_eq!(factory.open_connections(), 0);
    Ok(())
}
