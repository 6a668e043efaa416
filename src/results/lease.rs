use std::fmt;
use std::sync::Arc;

use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::adapters::dispatch;
use crate::connection::ConnectionScope;
use crate::driver::{DbConnection, RowReader};
use crate::error::{DbError, WrapPolicy};
use crate::executor::telemetry::{SpanHandle, StreamMetrics, TelemetrySink};
use crate::pool::RentedCommand;
use crate::types::Provider;

use super::row::{Columns, DataRow};

/// A live reader that also owns the command and connection it reads from.
///
/// The connection stays locked until the lease is closed. [`ReaderLease::close`] releases
/// the reader, then the command, then the connection scope; dropping the lease does the
/// same, spawning the connection close when the scope owns it.
pub struct ReaderLease {
    // Field order is drop order.
    reader: Option<Box<dyn RowReader>>,
    command: Option<RentedCommand>,
    guard: Option<OwnedMutexGuard<Box<dyn DbConnection>>>,
    scope: Option<ConnectionScope>,
    provider: Provider,
    columns: Arc<Columns>,
    cancel: CancellationToken,
    errors: WrapPolicy,
    metrics: StreamMetrics,
    telemetry: Option<(Arc<dyn TelemetrySink>, SpanHandle)>,
}

impl ReaderLease {
    pub(crate) fn new(
        reader: Box<dyn RowReader>,
        command: Option<RentedCommand>,
        guard: OwnedMutexGuard<Box<dyn DbConnection>>,
        scope: ConnectionScope,
        cancel: CancellationToken,
        errors: WrapPolicy,
    ) -> Self {
        let columns = Columns::new(reader.columns());
        Self {
            provider: scope.provider(),
            reader: Some(reader),
            command,
            guard: Some(guard),
            scope: Some(scope),
            columns,
            cancel,
            errors,
            metrics: StreamMetrics {
                result_sets: 1,
                ..StreamMetrics::default()
            },
            telemetry: None,
        }
    }

    pub(crate) fn with_telemetry(mut self, sink: Arc<dyn TelemetrySink>, span: SpanHandle) -> Self {
        self.telemetry = Some((sink, span));
        self
    }

    /// Column names of the current result set.
    #[must_use]
    pub fn columns(&self) -> &[String] {
        self.columns.names()
    }

    pub(crate) fn shared_columns(&self) -> Arc<Columns> {
        Arc::clone(&self.columns)
    }

    #[must_use]
    pub fn metrics(&self) -> StreamMetrics {
        self.metrics
    }

    #[must_use]
    pub fn records_affected(&self) -> Option<u64> {
        self.reader.as_ref().and_then(|r| r.records_affected())
    }

    fn fail(&self, err: DbError) -> DbError {
        let err = self.errors.apply(err);
        if let Some((sink, span)) = &self.telemetry {
            sink.record_error(span, &err);
        }
        err
    }

    /// Read the next row of the current result set.
    ///
    /// # Errors
    /// Returns the driver error (wrapped per the request's policy), `DbError::Cancelled`,
    /// or `DbError::Validation` after the lease was closed.
    pub async fn next_row(&mut self) -> Result<Option<DataRow>, DbError> {
        let Some(reader) = self.reader.as_mut() else {
            return Err(DbError::Validation("reader lease is closed".to_string()));
        };
        match dispatch::next_row(reader.as_mut(), self.provider, &self.cancel).await {
            Ok(Some(values)) => {
                self.metrics.record_row(&values);
                Ok(Some(DataRow::new(Arc::clone(&self.columns), values)))
            }
            Ok(None) => Ok(None),
            Err(err) => Err(self.fail(err)),
        }
    }

    /// Advance to the next result set; `false` once there are no more.
    ///
    /// # Errors
    /// Same as [`ReaderLease::next_row`].
    pub async fn next_result(&mut self) -> Result<bool, DbError> {
        let Some(reader) = self.reader.as_mut() else {
            return Err(DbError::Validation("reader lease is closed".to_string()));
        };
        match dispatch::next_result(reader.as_mut(), self.provider, &self.cancel).await {
            Ok(true) => {
                let names = reader.columns();
                if !self.columns.same_names(&names) {
                    self.columns = Columns::new(names);
                }
                self.metrics.result_sets += 1;
                Ok(true)
            }
            Ok(false) => Ok(false),
            Err(err) => Err(self.fail(err)),
        }
    }

    /// Release the reader, the command, and the connection scope, in that order.
    ///
    /// # Errors
    /// Returns the error raised while closing an owned connection.
    pub async fn close(mut self) -> Result<StreamMetrics, DbError> {
        self.release().await
    }

    pub(crate) async fn release(&mut self) -> Result<StreamMetrics, DbError> {
        self.reader.take();
        self.command.take();
        self.guard.take();
        if let Some((sink, span)) = &self.telemetry {
            sink.record_stream(span, &self.metrics);
        }
        if let Some(mut scope) = self.scope.take()
            && let Err(err) = scope.release().await
        {
            return Err(self.fail(err));
        }
        Ok(self.metrics)
    }
}

impl Drop for ReaderLease {
    fn drop(&mut self) {
        if self.scope.is_some() && self.reader.is_some() {
            warn!(
                rows = self.metrics.rows,
                "reader lease dropped without close"
            );
        }
    }
}

impl fmt::Debug for ReaderLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReaderLease")
            .field("provider", &self.provider)
            .field("columns", &self.columns.names())
            .field("open", &self.reader.is_some())
            .field("metrics", &self.metrics)
            .finish_non_exhaustive()
    }
}
