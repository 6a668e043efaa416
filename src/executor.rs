//! The execution orchestrator.
//!
//! [`Database`] composes connection leasing, the command pool, the provider adapters,
//! and the retry executors into the public operations. Each operation validates the
//! request, opens a telemetry span, runs through the command retry policy, records what
//! it produced, and applies the error-wrapping policy on the way out.

pub mod telemetry;
pub mod validation;

use std::fmt;
use std::sync::Arc;

use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, warn};

use crate::adapters::{self, dispatch, postgres_out, ref_cursor};
use crate::connection::{ConnectionManager, ConnectionScope};
use crate::driver::{ConnectionFactory, DbConnection, ProviderCommand, RowReader};
use crate::error::{DbError, WrapPolicy};
use crate::mapping::FromRow;
use crate::options::DbOptions;
use crate::parameter::ParameterDefinition;
use crate::pool::{CommandPool, RentedCommand};
use crate::request::{CommandRequest, ExecutionResult, OutputParameters};
use crate::resilience::{ResilienceStrategy, RetryPolicy};
use crate::results::{self, DataRow, DataTable, ReaderLease, RowStream, TableSet};
use crate::transaction::{ScopeOption, TransactionManager, TransactionScope, ambient};
use crate::types::IsolationLevel;

use telemetry::{SpanHandle, StreamMetrics, TelemetrySink, TracingTelemetry};
use validation::{RequestShapeValidator, Validator};

type ConnectionGuard = OwnedMutexGuard<Box<dyn DbConnection>>;

/// Per-call state shared by the attempts of one operation.
struct Call {
    options: Arc<DbOptions>,
    policy: RetryPolicy,
    errors: WrapPolicy,
    span: SpanHandle,
}

/// Entry point for running commands against one configured provider.
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use sqlbridge::prelude::*;
///
/// # async fn demo(factory: Arc<dyn ConnectionFactory>) -> Result<(), DbError> {
/// let options = DbOptions::builder(Provider::Postgres, "host=localhost user=app").build()?;
/// let db = Database::new(options, factory)?;
///
/// let placed = db
///     .execute(
///         &CommandRequest::text("UPDATE orders SET status = @status WHERE id = @id")
///             .param(ParameterDefinition::input("status", "shipped"))
///             .param(ParameterDefinition::input("id", 42)),
///     )
///     .await?;
/// assert_eq!(placed.rows_affected, 1);
/// # Ok(()) }
/// ```
pub struct Database {
    options: Arc<DbOptions>,
    connections: ConnectionManager,
    transactions: TransactionManager,
    commands: Arc<CommandPool>,
    resilience: ResilienceStrategy,
    telemetry: Arc<dyn TelemetrySink>,
    validators: Vec<Arc<dyn Validator>>,
}

impl Database {
    /// # Errors
    /// Returns `DbError::Configuration` if `options` do not validate.
    pub fn new(
        options: Arc<DbOptions>,
        factory: Arc<dyn ConnectionFactory>,
    ) -> Result<Self, DbError> {
        options.validate()?;
        let connections = ConnectionManager::new(factory);
        Ok(Self {
            transactions: TransactionManager::new(connections.clone()),
            commands: Arc::new(CommandPool::from_options(&options)),
            resilience: ResilienceStrategy::from_options(&options.resilience),
            connections,
            telemetry: Arc::new(TracingTelemetry),
            validators: Vec::new(),
            options,
        })
    }

    #[must_use]
    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Register a validator; validators run in registration order after the built-in
    /// shape checks.
    #[must_use]
    pub fn with_validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.validators.push(validator);
        self
    }

    #[must_use]
    pub fn options(&self) -> &Arc<DbOptions> {
        &self.options
    }

    #[must_use]
    pub fn command_pool(&self) -> &CommandPool {
        &self.commands
    }

    /// Run a non-query. Output parameters come back in [`ExecutionResult::outputs`].
    ///
    /// # Errors
    /// Validation errors before any network call, adapter errors, or the driver error
    /// (wrapped per policy) once retries are exhausted.
    pub async fn execute(&self, request: &CommandRequest) -> Result<ExecutionResult, DbError> {
        self.run_command("execute", request, false).await
    }

    /// Like [`Database::execute`], with the first column of the first row in
    /// [`ExecutionResult::scalar`].
    ///
    /// # Errors
    /// Same as [`Database::execute`].
    pub async fn execute_scalar(
        &self,
        request: &CommandRequest,
    ) -> Result<ExecutionResult, DbError> {
        self.run_command("execute_scalar", request, true).await
    }

    /// Buffer every row of the first result set through `projector`.
    ///
    /// # Errors
    /// Same as [`Database::execute`], plus whatever `projector` returns.
    pub async fn query<T, F>(&self, request: &CommandRequest, projector: F) -> Result<Vec<T>, DbError>
    where
        T: Send,
        F: Fn(&DataRow) -> Result<T, DbError> + Send + Sync,
    {
        self.query_as_operation("query", request, projector).await
    }

    /// [`Database::query`] with a [`FromRow`] projection.
    ///
    /// # Errors
    /// Same as [`Database::query`].
    pub async fn query_as<T>(&self, request: &CommandRequest) -> Result<Vec<T>, DbError>
    where
        T: FromRow + Send,
    {
        self.query_as_operation("query", request, T::from_row).await
    }

    /// Buffer the first result set into a table.
    ///
    /// # Errors
    /// Same as [`Database::execute`].
    pub async fn load_table(&self, request: &CommandRequest) -> Result<DataTable, DbError> {
        let call = self.begin_call("load_table", request)?;
        let outcome = {
            let call = &call;
            call.policy
                .execute(&request.cancellation, move |_| async move {
                    let mut lease = self.open_lease(call, request, false).await?;
                    let outcome = results::read_table(&mut lease).await;
                    close_after(lease, outcome).await
                })
                .instrument(call.span.span.clone())
                .await
        };
        let (table, metrics) = self.conclude(&call, outcome)?;
        self.record_rows(&call, &metrics, table.len() as u64);
        Ok(table)
    }

    /// Buffer every result set the command produces.
    ///
    /// # Errors
    /// Same as [`Database::execute`].
    pub async fn load_table_set(&self, request: &CommandRequest) -> Result<TableSet, DbError> {
        let call = self.begin_call("load_table_set", request)?;
        let outcome = {
            let call = &call;
            call.policy
                .execute(&request.cancellation, move |_| async move {
                    let mut lease = self.open_lease(call, request, false).await?;
                    let outcome = results::read_table_set(&mut lease).await;
                    close_after(lease, outcome).await
                })
                .instrument(call.span.span.clone())
                .await
        };
        let (set, metrics) = self.conclude(&call, outcome)?;
        self.record_rows(&call, &metrics, metrics.rows);
        Ok(set)
    }

    /// Produce rows lazily. Sequential access is forced on the command; the connection
    /// stays leased until the stream ends or is dropped.
    ///
    /// # Errors
    /// Errors raised while opening the reader. Errors while reading arrive as stream
    /// items.
    pub async fn stream<T, F>(
        &self,
        request: &CommandRequest,
        projector: F,
    ) -> Result<RowStream<T>, DbError>
    where
        T: Send + 'static,
        F: Fn(&DataRow) -> Result<T, DbError> + Send + 'static,
    {
        let mut behavior = request.behavior;
        behavior.sequential_access = true;
        let request = request.clone().behavior(behavior);
        let lease = self.open_live("stream", &request).await?;
        Ok(results::into_stream(lease, projector))
    }

    /// Hand back the live reader. Close it with [`ReaderLease::close`].
    ///
    /// # Errors
    /// Errors raised while opening the reader.
    pub async fn open_reader(&self, request: &CommandRequest) -> Result<ReaderLease, DbError> {
        self.open_live("open_reader", request).await
    }

    /// # Errors
    /// Same as [`Database::execute`].
    pub async fn execute_stored_procedure(
        &self,
        name: &str,
        parameters: impl IntoIterator<Item = ParameterDefinition>,
    ) -> Result<ExecutionResult, DbError> {
        let request = CommandRequest::stored_procedure(name).params(parameters);
        self.run_command("execute_stored_procedure", &request, false)
            .await
    }

    /// # Errors
    /// Same as [`Database::execute`].
    pub async fn scalar_stored_procedure(
        &self,
        name: &str,
        parameters: impl IntoIterator<Item = ParameterDefinition>,
    ) -> Result<ExecutionResult, DbError> {
        let request = CommandRequest::stored_procedure(name).params(parameters);
        self.run_command("scalar_stored_procedure", &request, true)
            .await
    }

    /// # Errors
    /// Same as [`Database::query`].
    pub async fn query_stored_procedure<T, F>(
        &self,
        name: &str,
        parameters: impl IntoIterator<Item = ParameterDefinition>,
        projector: F,
    ) -> Result<Vec<T>, DbError>
    where
        T: Send,
        F: Fn(&DataRow) -> Result<T, DbError> + Send + Sync,
    {
        let request = CommandRequest::stored_procedure(name).params(parameters);
        self.query_as_operation("query_stored_procedure", &request, projector)
            .await
    }

    /// # Errors
    /// Same as [`Database::load_table`].
    pub async fn load_stored_procedure_table(
        &self,
        name: &str,
        parameters: impl IntoIterator<Item = ParameterDefinition>,
    ) -> Result<DataTable, DbError> {
        let request = CommandRequest::stored_procedure(name).params(parameters);
        self.load_table(&request).await
    }

    /// Run an Oracle procedure and read the REF CURSOR it returns through
    /// `cursor_parameter`.
    ///
    /// # Errors
    /// `ProviderNotSupported` for any other provider, before a connection is opened.
    /// `ProviderFeature` when the parameter is missing or carries no cursor.
    pub async fn open_ref_cursor(
        &self,
        request: &CommandRequest,
        cursor_parameter: &str,
    ) -> Result<ReaderLease, DbError> {
        ref_cursor::ensure_supported(adapters::resolve_provider(request, &self.options))?;
        let call = self.begin_call("open_ref_cursor", request)?;
        let outcome = {
            let call = &call;
            call.policy
                .execute(&request.cancellation, move |_| {
                    self.open_cursor_once(call, request, cursor_parameter)
                })
                .instrument(call.span.span.clone())
                .await
        };
        self.conclude(&call, outcome)
    }

    /// Begin a `Required` scope at the server's default isolation.
    ///
    /// Must run inside [`ambient::scope`] (or [`Database::with_transaction`]).
    ///
    /// # Errors
    /// See [`Database::begin_transaction_with`].
    pub async fn begin_transaction(&self) -> Result<TransactionScope, DbError> {
        self.begin_transaction_with(IsolationLevel::Unspecified, ScopeOption::Required)
            .await
    }

    /// Begin a transaction scope and push it onto the ambient stack.
    ///
    /// # Errors
    /// `Configuration` outside an ambient context, `Validation` when joining a
    /// transaction at another isolation level, or the driver error.
    pub async fn begin_transaction_with(
        &self,
        isolation: IsolationLevel,
        option: ScopeOption,
    ) -> Result<TransactionScope, DbError> {
        self.transactions
            .begin(isolation, &self.options, option, &CancellationToken::new())
            .await
            .map_err(|err| self.transaction_errors("begin_transaction").apply(err))
    }

    /// Run `body` inside a transaction scope.
    ///
    /// The scope commits when `body` returns `Ok` and rolls back otherwise. Commands that
    /// `body` runs through this `Database` enlist in the scope automatically. A failure
    /// while rolling back or disposing is logged and never replaces the error `body`
    /// returned.
    ///
    /// # Errors
    /// The error from `body`, or the commit failure.
    pub async fn with_transaction<T, F>(
        &self,
        isolation: IsolationLevel,
        option: ScopeOption,
        body: F,
    ) -> Result<T, DbError>
    where
        F: AsyncFnOnce(&TransactionScope) -> Result<T, DbError>,
    {
        ambient::scope(async move {
            let mut scope = self.begin_transaction_with(isolation, option).await?;
            let body_result = body(&scope).await;
            let outcome = match body_result {
                Ok(value) => scope
                    .commit()
                    .await
                    .map(|()| value)
                    .map_err(|err| self.transaction_errors("commit").apply(err)),
                Err(err) => {
                    if let Err(rollback_err) = scope.rollback().await {
                        warn!(scope = scope.id(), error = %rollback_err, "rollback after failed body");
                    }
                    Err(err)
                }
            };
            if let Err(dispose_err) = scope.dispose().await {
                warn!(scope = scope.id(), error = %dispose_err, "transaction scope dispose failed");
            }
            outcome
        })
        .await
    }

    fn begin_call(&self, operation: &'static str, request: &CommandRequest) -> Result<Call, DbError> {
        if request.validate {
            RequestShapeValidator.validate(request)?;
            for validator in &self.validators {
                validator.validate(request)?;
            }
        }
        let options = request
            .options
            .clone()
            .unwrap_or_else(|| Arc::clone(&self.options));
        let policy = if Arc::ptr_eq(&options, &self.options) {
            self.resilience.command().clone()
        } else {
            ResilienceStrategy::from_options(&options.resilience)
                .command()
                .clone()
        };
        let errors = WrapPolicy {
            wrap: request.wrap_errors.unwrap_or(options.wrap_provider_errors),
            operation,
            command: request.label().to_string(),
        };
        let span = self.telemetry.start_span(operation, request, &options);
        Ok(Call {
            options,
            policy,
            errors,
            span,
        })
    }

    fn conclude<T>(&self, call: &Call, outcome: Result<T, DbError>) -> Result<T, DbError> {
        outcome.map_err(|err| {
            let err = call.errors.apply(err);
            self.telemetry.record_error(&call.span, &err);
            err
        })
    }

    fn record_rows(&self, call: &Call, metrics: &StreamMetrics, records: u64) {
        self.telemetry.record_stream(&call.span, metrics);
        self.telemetry
            .record_result(&call.span, &ExecutionResult::default(), Some(records));
    }

    fn transaction_errors(&self, operation: &'static str) -> WrapPolicy {
        WrapPolicy {
            wrap: self.options.wrap_provider_errors,
            operation,
            command: "transaction".to_string(),
        }
    }

    async fn run_command(
        &self,
        operation: &'static str,
        request: &CommandRequest,
        want_scalar: bool,
    ) -> Result<ExecutionResult, DbError> {
        let call = self.begin_call(operation, request)?;
        let provider = adapters::resolve_provider(request, &call.options);
        let outcome = {
            let call = &call;
            let attempts = async move {
                if postgres_out::applies(provider, request) {
                    let derived = &postgres_out::derive_request(request);
                    call.policy
                        .execute(&request.cancellation, move |_| async move {
                            let lease = self.open_lease(call, derived, false).await?;
                            postgres_out::read_outputs(lease, request, want_scalar).await
                        })
                        .await
                } else {
                    call.policy
                        .execute(&request.cancellation, move |_| {
                            self.execute_once(call, request, want_scalar)
                        })
                        .await
                }
            };
            attempts.instrument(call.span.span.clone()).await
        };
        let result = self.conclude(&call, outcome)?;
        self.telemetry.record_result(&call.span, &result, None);
        Ok(result)
    }

    async fn query_as_operation<T, F>(
        &self,
        operation: &'static str,
        request: &CommandRequest,
        projector: F,
    ) -> Result<Vec<T>, DbError>
    where
        T: Send,
        F: Fn(&DataRow) -> Result<T, DbError> + Send + Sync,
    {
        let call = self.begin_call(operation, request)?;
        let outcome = {
            let (call, projector) = (&call, &projector);
            call.policy
                .execute(&request.cancellation, move |_| async move {
                    let mut lease = self.open_lease(call, request, false).await?;
                    let outcome = async {
                        let mut items = Vec::new();
                        while let Some(row) = lease.next_row().await? {
                            items.push(projector(&row)?);
                        }
                        Ok::<_, DbError>(items)
                    }
                    .await;
                    close_after(lease, outcome).await
                })
                .instrument(call.span.span.clone())
                .await
        };
        let (items, metrics) = self.conclude(&call, outcome)?;
        self.record_rows(&call, &metrics, items.len() as u64);
        Ok(items)
    }

    async fn open_live(
        &self,
        operation: &'static str,
        request: &CommandRequest,
    ) -> Result<ReaderLease, DbError> {
        let call = self.begin_call(operation, request)?;
        let outcome = {
            let call = &call;
            call.policy
                .execute(&request.cancellation, move |_| {
                    self.open_lease(call, request, true)
                })
                .instrument(call.span.span.clone())
                .await
        };
        self.conclude(&call, outcome)
    }

    async fn execute_once(
        &self,
        call: &Call,
        request: &CommandRequest,
        want_scalar: bool,
    ) -> Result<ExecutionResult, DbError> {
        let mut scope = self
            .connections
            .lease(&call.options, request.connection.as_ref(), &request.cancellation)
            .await?;
        let outcome = self.execute_on(&scope, call, request, want_scalar).await;
        release_after(&mut scope, outcome).await
    }

    async fn execute_on(
        &self,
        scope: &ConnectionScope,
        call: &Call,
        request: &CommandRequest,
        want_scalar: bool,
    ) -> Result<ExecutionResult, DbError> {
        let cancel = &request.cancellation;
        let mut command =
            self.commands
                .rent(scope.connection(), scope.transaction(), request, &call.options)?;
        let mut result = ExecutionResult::default();
        {
            let mut conn = scope.connection().lock().await;
            if want_scalar {
                result.scalar =
                    Some(dispatch::execute_scalar(conn.as_mut(), &mut command, cancel).await?);
            } else {
                result.rows_affected = dispatch::execute(conn.as_mut(), &mut command, cancel).await?;
            }
        }
        result.outputs = collect_outputs(&command);
        Ok(result)
    }

    /// Open a reader on a leased connection. `live` leases are handed to the caller and
    /// apply the wrap policy and telemetry themselves.
    async fn open_lease(
        &self,
        call: &Call,
        request: &CommandRequest,
        live: bool,
    ) -> Result<ReaderLease, DbError> {
        let cancel = &request.cancellation;
        let mut scope = self
            .connections
            .lease(&call.options, request.connection.as_ref(), cancel)
            .await?;
        match self.start_reader(&scope, call, request).await {
            Ok((reader, command, guard)) => {
                let errors = if live {
                    call.errors.clone()
                } else {
                    WrapPolicy {
                        wrap: false,
                        ..call.errors.clone()
                    }
                };
                let lease =
                    ReaderLease::new(reader, Some(command), guard, scope, cancel.clone(), errors);
                Ok(if live {
                    lease.with_telemetry(Arc::clone(&self.telemetry), call.span.clone())
                } else {
                    lease
                })
            }
            Err(err) => release_after(&mut scope, Err(err)).await,
        }
    }

    async fn start_reader(
        &self,
        scope: &ConnectionScope,
        call: &Call,
        request: &CommandRequest,
    ) -> Result<(Box<dyn RowReader>, RentedCommand, ConnectionGuard), DbError> {
        let mut command =
            self.commands
                .rent(scope.connection(), scope.transaction(), request, &call.options)?;
        let mut guard = scope.connection().lock_owned().await;
        let reader = dispatch::query(guard.as_mut(), &mut command, &request.cancellation).await?;
        Ok((reader, command, guard))
    }

    async fn open_cursor_once(
        &self,
        call: &Call,
        request: &CommandRequest,
        cursor_parameter: &str,
    ) -> Result<ReaderLease, DbError> {
        let cancel = &request.cancellation;
        let mut scope = self
            .connections
            .lease(&call.options, request.connection.as_ref(), cancel)
            .await?;
        match self
            .start_cursor(&scope, call, request, cursor_parameter)
            .await
        {
            Ok((reader, command, guard)) => Ok(ReaderLease::new(
                reader,
                Some(command),
                guard,
                scope,
                cancel.clone(),
                call.errors.clone(),
            )
            .with_telemetry(Arc::clone(&self.telemetry), call.span.clone())),
            Err(err) => release_after(&mut scope, Err(err)).await,
        }
    }

    async fn start_cursor(
        &self,
        scope: &ConnectionScope,
        call: &Call,
        request: &CommandRequest,
        cursor_parameter: &str,
    ) -> Result<(Box<dyn RowReader>, RentedCommand, ConnectionGuard), DbError> {
        let mut command =
            self.commands
                .rent(scope.connection(), scope.transaction(), request, &call.options)?;
        let mut guard = scope.connection().lock_owned().await;
        dispatch::execute(guard.as_mut(), &mut command, &request.cancellation).await?;
        let reader = ref_cursor::take_cursor(&mut command, cursor_parameter)?;
        Ok((reader, command, guard))
    }
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("provider", &self.options.provider)
            .field("validators", &self.validators.len())
            .field("command_pool", &self.commands)
            .finish_non_exhaustive()
    }
}

fn collect_outputs(command: &ProviderCommand) -> OutputParameters {
    let mut outputs = OutputParameters::new();
    for parameter in command.parameters.iter().filter(|p| p.direction.is_output()) {
        outputs.insert(parameter.logical_name(), parameter.value.clone());
    }
    outputs
}

/// Release `scope` after an attempt; a release failure never replaces the attempt's error.
async fn release_after<T>(
    scope: &mut ConnectionScope,
    outcome: Result<T, DbError>,
) -> Result<T, DbError> {
    match (outcome, scope.release().await) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(err)) => Err(err),
        (Err(err), Ok(())) => Err(err),
        (Err(err), Err(release_err)) => {
            warn!(
                connection = scope.connection().id(),
                error = %release_err,
                "connection release failed after an error"
            );
            Err(err)
        }
    }
}

async fn close_after<T>(
    lease: ReaderLease,
    outcome: Result<T, DbError>,
) -> Result<(T, StreamMetrics), DbError> {
    match (outcome, lease.close().await) {
        (Ok(value), Ok(metrics)) => Ok((value, metrics)),
        (Ok(_), Err(err)) => Err(err),
        (Err(err), Ok(_)) => Err(err),
        (Err(err), Err(close_err)) => {
            warn!(error = %close_err, "reader close failed after an error");
            Err(err)
        }
    }
}
