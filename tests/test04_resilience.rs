use std::sync::Arc;
use std::time::Duration;

use sqlbridge::prelude::*;
use sqlbridge::resilience::TransientClassifier;
use sqlbridge::test_utils::{MockEvent, MockOp, MockReply, mock_database, test_options};
use tokio_util::sync::CancellationToken;

type TestResult = Result<(), Box<dyn std::error::Error>>;

fn executes(event: &MockEvent) -> bool {
    matches!(event, MockEvent::Execute { .. })
}

fn touch() -> CommandRequest {
    CommandRequest::text("UPDATE jobs SET heartbeat = @now WHERE id = @id")
        .param(ParameterDefinition::input("now", "2024-01-01T00:00:00"))
        .param(ParameterDefinition::input("id", 11))
}

#[tokio::test]
async fn transient_failures_are_retried_until_success() -> TestResult {
    let (db, factory) = mock_database(test_options(Provider::SqlServer))?;
    factory.reply(MockReply::transient());
    factory.reply(MockReply::transient());
    factory.reply(MockReply::Affected(1));

    let result = db.execute(&touch()).await?;
    assert_eq!(result.rows_affected, 1);
    assert_eq!(factory.count(executes), 3);
    // Every attempt leases and releases its own connection.
    assert_eq!(factory.connections_created(), 3);
    assert_eq!(factory.open_connections(), 0);
    Ok(())
}

#[tokio::test]
async fn exhausted_retries_surface_the_last_driver_error() -> TestResult {
    let (db, factory) = mock_database(test_options(Provider::SqlServer))?;
    for _ in 0..4 {
        factory.reply(MockReply::transient());
    }

    let err = db.execute(&touch()).await.unwrap_err();
    assert_eq!(factory.count(executes), 3);
    match err {
        DbError::DataAccess {
            operation, source, ..
        } => {
            assert_eq!(operation, "execute");
            assert_eq!(source.kind, DriverErrorKind::Deadlock);
        }
        other => panic!("expected DataAccess, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn provider_codes_count_as_transient() -> TestResult {
    let (db, factory) = mock_database(test_options(Provider::Postgres))?;
    factory.reply(MockReply::Fail {
        kind: DriverErrorKind::Other,
        code: Some("40001".to_string()),
    });
    factory.reply(MockReply::Affected(4));

    let result = db.execute(&CommandRequest::text("UPDATE t SET x = 1")).await?;
    assert_eq!(result.rows_affected, 4);
    assert_eq!(factory.count(executes), 2);
    Ok(())
}

#[tokio::test]
async fn permanent_failures_run_once() -> TestResult {
    let (db, factory) = mock_database(test_options(Provider::SqlServer))?;
    factory.reply(MockReply::fail(DriverErrorKind::Syntax));

    let err = db.execute(&touch()).await.unwrap_err();
    assert!(matches!(
        err.driver_error().map(|e| e.kind),
        Some(DriverErrorKind::Syntax)
    ));
    assert_eq!(factory.count(executes), 1);
    Ok(())
}

#[tokio::test]
async fn validation_failures_never_reach_the_driver() -> TestResult {
    let (db, factory) = mock_database(test_options(Provider::SqlServer))?;

    let err = db.execute(&CommandRequest::text("   ")).await.unwrap_err();
    assert!(matches!(err, DbError::Validation(_)));

    let err = db
        .execute(&CommandRequest::stored_procedure("drop table x; --"))
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::Validation(_)));

    let err = db
        .execute(&CommandRequest::text("SELECT 1").timeout(Duration::ZERO))
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::Validation(_)));

    assert_eq!(factory.connections_created(), 0);
    assert!(factory.events().is_empty());
    Ok(())
}

#[tokio::test]
async fn disabled_resilience_makes_a_single_attempt() -> TestResult {
    let (db, factory) = mock_database(test_options(Provider::SqlServer).resilience_enabled(false))?;
    factory.reply(MockReply::transient());
    factory.reply(MockReply::Affected(1));

    assert!(db.execute(&touch()).await.is_err());
    assert_eq!(factory.count(executes), 1);
    Ok(())
}

#[tokio::test]
async fn zero_retries_fail_on_the_first_transient_error() -> TestResult {
    let (db, factory) = mock_database(
        test_options(Provider::SqlServer).command_retries(0, Duration::from_millis(1)),
    )?;
    factory.reply(MockReply::transient());

    let err = db.execute(&touch()).await.unwrap_err();
    assert!(matches!(
        err.driver_error().map(|e| e.kind),
        Some(DriverErrorKind::Deadlock)
    ));
    assert_eq!(factory.count(executes), 1);
    Ok(())
}

#[tokio::test]
async fn wrapping_can_be_turned_off_per_request() -> TestResult {
    let (db, factory) = mock_database(test_options(Provider::SqlServer))?;
    factory.reply(MockReply::fail(DriverErrorKind::Constraint));
    factory.reply(MockReply::fail(DriverErrorKind::Constraint));

    let wrapped = db.execute(&touch()).await.unwrap_err();
    assert!(matches!(wrapped, DbError::DataAccess { .. }));

    let raw = db.execute(&touch().wrap_errors(false)).await.unwrap_err();
    match raw {
        DbError::Driver(source) => {
            assert_eq!(source.kind, DriverErrorKind::Constraint);
            assert_eq!(source.provider, Some(Provider::SqlServer));
        }
        other => panic!("expected a raw driver error, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn unwrapped_by_default_when_configured() -> TestResult {
    let (db, factory) = mock_database(test_options(Provider::Postgres).wrap_provider_errors(false))?;
    factory.reply(MockReply::fail(DriverErrorKind::Syntax));

    let err = db.execute(&CommandRequest::text("SELEC 1")).await.unwrap_err();
    assert!(matches!(err, DbError::Driver(_)));
    Ok(())
}

#[tokio::test]
async fn custom_classifier_replaces_the_builtin_one() -> TestResult {
    let classifier: TransientClassifier = Arc::new(|err: &DbError| {
        err.driver_error()
            .and_then(|driver| driver.code.as_deref())
            .is_some_and(|code| code == "50001")
    });
    let (db, factory) =
        mock_database(test_options(Provider::SqlServer).transient_classifier(classifier))?;
    factory.reply(MockReply::Fail {
        kind: DriverErrorKind::Other,
        code: Some("50001".to_string()),
    });
    factory.reply(MockReply::Affected(1));
    // Deadlock is no longer transient under the custom classifier.
    factory.reply(MockReply::transient());

    assert_eq!(db.execute(&touch()).await?.rows_affected, 1);
    assert_eq!(factory.count(executes), 2);

    assert!(db.execute(&touch()).await.is_err());
    assert_eq!(factory.count(executes), 3);
    Ok(())
}

#[tokio::test]
async fn commit_is_retried_under_the_transaction_policy() -> TestResult {
    let (db, factory) = mock_database(test_options(Provider::SqlServer))?;
    factory.fail_next(MockOp::Commit, DriverErrorKind::Deadlock);

    db.with_transaction(
        IsolationLevel::Unspecified,
        ScopeOption::Required,
        async |_scope: &TransactionScope| {
            db.execute(&touch()).await?;
            Ok::<_, DbError>(())
        },
    )
    .await?;

    assert_eq!(factory.count(|e| matches!(e, MockEvent::Commit { .. })), 1);
    assert_eq!(factory.count(|e| matches!(e, MockEvent::Rollback { .. })), 0);
    Ok(())
}

#[tokio::test]
async fn retries_inside_a_transaction_reuse_the_ambient_connection() -> TestResult {
    let (db, factory) = mock_database(test_options(Provider::SqlServer))?;
    factory.reply(MockReply::transient());
    factory.reply(MockReply::Affected(1));

    let affected = db
        .with_transaction(
            IsolationLevel::Unspecified,
            ScopeOption::Required,
            async |_scope: &TransactionScope| {
                Ok::<_, DbError>(db.execute(&touch()).await?.rows_affected)
            },
        )
        .await?;

    assert_eq!(affected, 1);
    // The ambient connection is reused across attempts.
    assert_eq!(factory.connections_created(), 1);
    assert_eq!(factory.count(executes), 2);
    Ok(())
}

#[tokio::test]
async fn cancelled_requests_stop_before_the_driver() -> TestResult {
    let (db, factory) = mock_database(test_options(Provider::SqlServer))?;
    let token = CancellationToken::new();
    token.cancel();

    let err = db
        .execute(&touch().with_cancellation(token))
        .await
        .unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(factory.count(executes), 0);
    assert_eq!(factory.open_connections(), 0);
    Ok(())
}

#[tokio::test]
async fn connection_failures_follow_the_classifier() -> TestResult {
    let (db, factory) = mock_database(test_options(Provider::Postgres))?;
    factory.fail_next(MockOp::Connect, DriverErrorKind::Connection);
    factory.fail_next(MockOp::Open, DriverErrorKind::ConnectionBroken);

    let err = db.execute(&CommandRequest::text("SELECT 1")).await.unwrap_err();
    assert!(matches!(
        err.driver_error().map(|e| e.kind),
        Some(DriverErrorKind::Connection)
    ));
    assert_eq!(factory.count(executes), 0);

    let result = db.execute(&CommandRequest::text("SELECT 1")).await?;
    assert_eq!(result.rows_affected, 0);
    assert_eq!(factory.count(executes), 1);
    Ok(())
}

#[tokio::test]
async fn cancelling_during_backoff_stops_the_retry_loop() -> TestResult {
    let (db, factory) = mock_database(
        test_options(Provider::SqlServer).command_retries(3, Duration::from_secs(5)),
    )?;
    factory.reply(MockReply::transient());
    factory.reply(MockReply::Affected(1));

    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let started = std::time::Instant::now();
    let err = db
        .execute(&touch().with_cancellation(token))
        .await
        .unwrap_err();
    assert!(err.is_cancelled(), "got {err:?}");
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(factory.count(executes), 1);
    assert_eq!(factory.open_connections(), 0);
    Ok(())
}

#[tokio::test]
async fn command_retries_can_be_disabled_on_their_own() -> TestResult {
    let (db, factory) =
        mock_database(test_options(Provider::SqlServer).command_retries_enabled(false))?;
    factory.reply(MockReply::transient());
    assert!(db.execute(&touch()).await.is_err());
    assert_eq!(factory.count(executes), 1);

    // The transaction executor still retries the commit.
    factory.fail_next(MockOp::Commit, DriverErrorKind::Deadlock);
    db.with_transaction(
        IsolationLevel::Unspecified,
        ScopeOption::Required,
        async |_scope: &TransactionScope| {
            db.execute(&touch()).await?;
            Ok::<_, DbError>(())
        },
    )
    .await?;
    assert_eq!(factory.count(|e| matches!(e, MockEvent::Commit { .. })), 1);
    Ok(())
}

#[tokio::test]
async fn transaction_retries_can_be_disabled_on_their_own() -> TestResult {
    let (db, factory) =
        mock_database(test_options(Provider::SqlServer).transaction_retries_enabled(false))?;
    factory.reply(MockReply::transient());
    factory.reply(MockReply::Affected(1));
    assert_eq!(db.execute(&touch()).await?.rows_affected, 1);
    assert_eq!(factory.count(executes), 2);

    factory.fail_next(MockOp::Commit, DriverErrorKind::Deadlock);
    let err = db
        .with_transaction(
            IsolationLevel::Unspecified,
            ScopeOption::Required,
            async |_scope: &TransactionScope| {
                db.execute(&touch()).await?;
                Ok::<_, DbError>(())
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err.driver_error().map(|e| e.kind),
        Some(DriverErrorKind::Deadlock)
    ));
    assert_eq!(factory.count(|e| matches!(e, MockEvent::Commit { .. })), 0);
    Ok(())
}
