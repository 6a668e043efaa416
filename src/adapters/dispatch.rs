//! Routes every driver call through one place.
//!
//! For providers whose driver blocks inside its async entry points anyway, the call goes
//! straight to the `*_sync` method so no suspension point is added. Everything else
//! awaits the async method, racing the cancellation token and the command timeout.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::driver::{DbConnection, ProviderCommand, RowReader};
use crate::error::{DbError, DriverError};
use crate::types::{DbValue, IsolationLevel, Provider};

macro_rules! route {
    ($sync_path:expr, $cancel:expr, $timeout:expr, sync => $sync:expr, async => $async:expr $(,)?) => {{
        if $cancel.is_cancelled() {
            return Err(DbError::Cancelled);
        }
        if $sync_path {
            $sync.map_err(DbError::from)
        } else {
            race($cancel, $timeout, $async).await
        }
    }};
}

async fn race<T>(
    cancel: &CancellationToken,
    timeout: Option<Duration>,
    call: impl Future<Output = Result<T, DriverError>>,
) -> Result<T, DbError> {
    let bounded = async {
        match timeout {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(result) => result,
                Err(_) => Err(DriverError::timeout(format!(
                    "command timed out after {}s",
                    limit.as_secs_f64()
                ))),
            },
            None => call.await,
        }
    };
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(DbError::Cancelled),
        result = bounded => result.map_err(DbError::from),
    }
}

fn sync_path(conn: &dyn DbConnection) -> bool {
    conn.provider().prefers_sync_path()
}

pub(crate) async fn open(
    conn: &mut dyn DbConnection,
    cancel: &CancellationToken,
) -> Result<(), DbError> {
    route!(sync_path(conn), cancel, None, sync => conn.open_sync(), async => conn.open())
}

pub(crate) async fn close(
    conn: &mut dyn DbConnection,
    cancel: &CancellationToken,
) -> Result<(), DbError> {
    route!(sync_path(conn), cancel, None, sync => conn.close_sync(), async => conn.close())
}

pub(crate) async fn begin(
    conn: &mut dyn DbConnection,
    isolation: IsolationLevel,
    cancel: &CancellationToken,
) -> Result<(), DbError> {
    route!(
        sync_path(conn),
        cancel,
        None,
        sync => conn.begin_sync(isolation),
        async => conn.begin(isolation),
    )
}

pub(crate) async fn commit(
    conn: &mut dyn DbConnection,
    cancel: &CancellationToken,
) -> Result<(), DbError> {
    route!(sync_path(conn), cancel, None, sync => conn.commit_sync(), async => conn.commit())
}

pub(crate) async fn rollback(
    conn: &mut dyn DbConnection,
    cancel: &CancellationToken,
) -> Result<(), DbError> {
    route!(
        sync_path(conn),
        cancel,
        None,
        sync => conn.rollback_sync(),
        async => conn.rollback(),
    )
}

pub(crate) async fn execute_batch(
    conn: &mut dyn DbConnection,
    sql: &str,
    cancel: &CancellationToken,
) -> Result<(), DbError> {
    route!(
        sync_path(conn),
        cancel,
        None,
        sync => conn.execute_batch_sync(sql),
        async => conn.execute_batch(sql),
    )
}

pub(crate) async fn execute(
    conn: &mut dyn DbConnection,
    command: &mut ProviderCommand,
    cancel: &CancellationToken,
) -> Result<u64, DbError> {
    let timeout = command.timeout;
    route!(
        sync_path(conn),
        cancel,
        timeout,
        sync => conn.execute_sync(command),
        async => conn.execute(command),
    )
}

pub(crate) async fn execute_scalar(
    conn: &mut dyn DbConnection,
    command: &mut ProviderCommand,
    cancel: &CancellationToken,
) -> Result<DbValue, DbError> {
    let timeout = command.timeout;
    route!(
        sync_path(conn),
        cancel,
        timeout,
        sync => conn.execute_scalar_sync(command),
        async => conn.execute_scalar(command),
    )
}

pub(crate) async fn query(
    conn: &mut dyn DbConnection,
    command: &mut ProviderCommand,
    cancel: &CancellationToken,
) -> Result<Box<dyn RowReader>, DbError> {
    let timeout = command.timeout;
    route!(
        sync_path(conn),
        cancel,
        timeout,
        sync => conn.query_sync(command),
        async => conn.query(command),
    )
}

pub(crate) async fn next_row(
    reader: &mut dyn RowReader,
    provider: Provider,
    cancel: &CancellationToken,
) -> Result<Option<Vec<DbValue>>, DbError> {
    route!(
        provider.prefers_sync_path(),
        cancel,
        None,
        sync => reader.next_row_sync(),
        async => reader.next_row(),
    )
}

pub(crate) async fn next_result(
    reader: &mut dyn RowReader,
    provider: Provider,
    cancel: &CancellationToken,
) -> Result<bool, DbError> {
    route!(
        provider.prefers_sync_path(),
        cancel,
        None,
        sync => reader.next_result_sync(),
        async => reader.next_result(),
    )
}
