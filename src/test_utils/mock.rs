use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::driver::{
    BufferedReader, BufferedResult, ConnectionFactory, DbConnection, ProviderCommand, RowReader,
};
use crate::error::{DriverError, DriverErrorKind};
use crate::options::DbOptions;
use crate::request::{CommandKind, ReadBehavior};
use crate::types::{DbValue, IsolationLevel, ParameterDirection, Provider};

/// Physical operations that can be made to fail with [`MockFactory::fail_next`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockOp {
    Connect,
    Open,
    Close,
    Begin,
    Commit,
    Rollback,
    Batch,
}

/// Snapshot of a command as the driver received it.
#[derive(Debug, Clone, PartialEq)]
pub struct MockCommand {
    pub text: String,
    pub kind: CommandKind,
    pub parameter_names: Vec<String>,
    pub directions: Vec<ParameterDirection>,
    pub values: Vec<DbValue>,
    pub provider_types: Vec<Option<String>>,
    pub sizes: Vec<Option<u32>>,
    pub behavior: ReadBehavior,
    pub transaction_id: Option<u64>,
}

impl MockCommand {
    fn capture(command: &ProviderCommand) -> Self {
        Self {
            text: command.text.clone(),
            kind: command.kind,
            parameter_names: command.parameters.iter().map(|p| p.name.clone()).collect(),
            directions: command.parameters.iter().map(|p| p.direction).collect(),
            values: command.parameters.iter().map(|p| p.value.clone()).collect(),
            provider_types: command
                .parameters
                .iter()
                .map(|p| p.provider_type.clone())
                .collect(),
            sizes: command.parameters.iter().map(|p| p.size).collect(),
            behavior: command.behavior,
            transaction_id: command.transaction_id,
        }
    }
}

/// One entry of the call log. `connection` is the mock's own connection number.
#[derive(Debug, Clone, PartialEq)]
pub enum MockEvent {
    Open {
        connection: u64,
        sync: bool,
    },
    Close {
        connection: u64,
        sync: bool,
    },
    Begin {
        connection: u64,
        isolation: IsolationLevel,
        sync: bool,
    },
    Commit {
        connection: u64,
        sync: bool,
    },
    Rollback {
        connection: u64,
        sync: bool,
    },
    Batch {
        connection: u64,
        sql: String,
        sync: bool,
    },
    Execute {
        connection: u64,
        command: MockCommand,
        sync: bool,
    },
    Scalar {
        connection: u64,
        command: MockCommand,
        sync: bool,
    },
    Query {
        connection: u64,
        command: MockCommand,
        sync: bool,
    },
}

impl MockEvent {
    #[must_use]
    pub fn connection(&self) -> u64 {
        match self {
            MockEvent::Open { connection, .. }
            | MockEvent::Close { connection, .. }
            | MockEvent::Begin { connection, .. }
            | MockEvent::Commit { connection, .. }
            | MockEvent::Rollback { connection, .. }
            | MockEvent::Batch { connection, .. }
            | MockEvent::Execute { connection, .. }
            | MockEvent::Scalar { connection, .. }
            | MockEvent::Query { connection, .. } => *connection,
        }
    }

    #[must_use]
    pub fn is_sync(&self) -> bool {
        match self {
            MockEvent::Open { sync, .. }
            | MockEvent::Close { sync, .. }
            | MockEvent::Begin { sync, .. }
            | MockEvent::Commit { sync, .. }
            | MockEvent::Rollback { sync, .. }
            | MockEvent::Batch { sync, .. }
            | MockEvent::Execute { sync, .. }
            | MockEvent::Scalar { sync, .. }
            | MockEvent::Query { sync, .. } => *sync,
        }
    }

    #[must_use]
    pub fn command(&self) -> Option<&MockCommand> {
        match self {
            MockEvent::Execute { command, .. }
            | MockEvent::Scalar { command, .. }
            | MockEvent::Query { command, .. } => Some(command),
            _ => None,
        }
    }
}

/// Scripted answer to the next execute / scalar / query call.
#[derive(Debug, Clone)]
pub enum MockReply {
    Affected(u64),
    Scalar(DbValue),
    Rows(Vec<BufferedResult>),
    /// Write values into the named output parameters, then report `affected`.
    Outputs {
        affected: u64,
        values: Vec<(String, DbValue)>,
    },
    /// Attach a cursor over `result` to the named output parameter.
    Cursor {
        parameter: String,
        result: BufferedResult,
    },
    Fail {
        kind: DriverErrorKind,
        code: Option<String>,
    },
}

impl MockReply {
    #[must_use]
    pub fn rows(columns: &[&str], rows: Vec<Vec<DbValue>>) -> Self {
        MockReply::Rows(vec![BufferedResult::new(
            columns.iter().map(|c| (*c).to_string()).collect(),
            rows,
        )])
    }

    #[must_use]
    pub fn fail(kind: DriverErrorKind) -> Self {
        MockReply::Fail { kind, code: None }
    }

    /// A failure the default classifier treats as transient.
    #[must_use]
    pub fn transient() -> Self {
        MockReply::Fail {
            kind: DriverErrorKind::Deadlock,
            code: None,
        }
    }
}

#[derive(Debug, Default)]
struct MockState {
    next_connection: u64,
    events: Vec<MockEvent>,
    replies: VecDeque<MockReply>,
    failures: Vec<(MockOp, DriverErrorKind)>,
}

fn driver_error(provider: Provider, kind: DriverErrorKind, code: Option<String>) -> DriverError {
    let mut err = DriverError::new(kind, format!("scripted {kind:?} failure")).with_provider(provider);
    if let Some(code) = code {
        err = err.with_code(code);
    }
    err
}

/// Shared script and call log behind every [`MockConnection`].
#[derive(Debug, Clone)]
struct Shared {
    provider: Provider,
    state: Arc<Mutex<MockState>>,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_failure(&self, op: MockOp) -> Result<(), DriverError> {
        let mut state = self.state();
        match state.failures.iter().position(|(failing, _)| *failing == op) {
            Some(idx) => {
                let (_, kind) = state.failures.remove(idx);
                Err(driver_error(self.provider, kind, None))
            }
            None => Ok(()),
        }
    }

    fn record(&self, event: MockEvent) {
        self.state().events.push(event);
    }

    fn next_reply(&self) -> Option<MockReply> {
        self.state().replies.pop_front()
    }
}

/// [`ConnectionFactory`] handing out [`MockConnection`]s.
#[derive(Debug, Clone)]
pub struct MockFactory {
    shared: Shared,
}

impl MockFactory {
    #[must_use]
    pub fn new(provider: Provider) -> Self {
        Self {
            shared: Shared {
                provider,
                state: Arc::new(Mutex::new(MockState::default())),
            },
        }
    }

    /// Queue the answer to the next command call.
    pub fn reply(&self, reply: MockReply) {
        self.shared.state().replies.push_back(reply);
    }

    /// Make the next `op` fail with `kind`.
    pub fn fail_next(&self, op: MockOp, kind: DriverErrorKind) {
        self.shared.state().failures.push((op, kind));
    }

    #[must_use]
    pub fn events(&self) -> Vec<MockEvent> {
        self.shared.state().events.clone()
    }

    /// Commands in the order the driver received them.
    #[must_use]
    pub fn commands(&self) -> Vec<MockCommand> {
        self.shared
            .state()
            .events
            .iter()
            .filter_map(MockEvent::command)
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn count(&self, pred: impl Fn(&MockEvent) -> bool) -> usize {
        self.shared.state().events.iter().filter(|e| pred(e)).count()
    }

    /// Connections created so far.
    #[must_use]
    pub fn connections_created(&self) -> u64 {
        self.shared.state().next_connection
    }

    /// Connections opened and not yet closed.
    #[must_use]
    pub fn open_connections(&self) -> usize {
        let opened = self.count(|e| matches!(e, MockEvent::Open { .. }));
        let closed = self.count(|e| matches!(e, MockEvent::Close { .. }));
        opened.saturating_sub(closed)
    }

    pub fn clear_events(&self) {
        self.shared.state().events.clear();
    }
}

#[async_trait]
impl ConnectionFactory for MockFactory {
    async fn create_connection(
        &self,
        _options: &DbOptions,
    ) -> Result<Box<dyn DbConnection>, DriverError> {
        self.shared.take_failure(MockOp::Connect)?;
        let id = {
            let mut state = self.shared.state();
            state.next_connection += 1;
            state.next_connection
        };
        Ok(Box::new(MockConnection {
            id,
            open: false,
            in_transaction: false,
            shared: self.shared.clone(),
        }))
    }
}

/// A scripted connection. Every async entry point has a synchronous twin, so the same
/// script drives both dispatch paths.
#[derive(Debug)]
pub struct MockConnection {
    id: u64,
    open: bool,
    in_transaction: bool,
    shared: Shared,
}

impl MockConnection {
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    fn ensure_open(&self) -> Result<(), DriverError> {
        if self.open {
            Ok(())
        } else {
            Err(DriverError::connection_broken("connection is not open")
                .with_provider(self.shared.provider))
        }
    }

    fn ensure_transaction(&self) -> Result<(), DriverError> {
        self.ensure_open()?;
        if self.in_transaction {
            Ok(())
        } else {
            Err(DriverError::new(DriverErrorKind::Other, "no transaction is active")
                .with_provider(self.shared.provider))
        }
    }

    fn do_open(&mut self, sync: bool) -> Result<(), DriverError> {
        self.shared.take_failure(MockOp::Open)?;
        self.open = true;
        self.shared.record(MockEvent::Open {
            connection: self.id,
            sync,
        });
        Ok(())
    }

    fn do_close(&mut self, sync: bool) -> Result<(), DriverError> {
        self.shared.take_failure(MockOp::Close)?;
        self.open = false;
        self.in_transaction = false;
        self.shared.record(MockEvent::Close {
            connection: self.id,
            sync,
        });
        Ok(())
    }

    fn do_begin(&mut self, isolation: IsolationLevel, sync: bool) -> Result<(), DriverError> {
        self.ensure_open()?;
        if self.in_transaction {
            return Err(self.fail(DriverErrorKind::Other, None));
        }
        self.shared.take_failure(MockOp::Begin)?;
        self.in_transaction = true;
        self.shared.record(MockEvent::Begin {
            connection: self.id,
            isolation,
            sync,
        });
        Ok(())
    }

    fn do_commit(&mut self, sync: bool) -> Result<(), DriverError> {
        self.ensure_transaction()?;
        self.shared.take_failure(MockOp::Commit)?;
        self.in_transaction = false;
        self.shared.record(MockEvent::Commit {
            connection: self.id,
            sync,
        });
        Ok(())
    }

    fn do_rollback(&mut self, sync: bool) -> Result<(), DriverError> {
        self.ensure_transaction()?;
        self.shared.take_failure(MockOp::Rollback)?;
        self.in_transaction = false;
        self.shared.record(MockEvent::Rollback {
            connection: self.id,
            sync,
        });
        Ok(())
    }

    fn do_batch(&mut self, sql: &str, sync: bool) -> Result<(), DriverError> {
        self.ensure_open()?;
        self.shared.take_failure(MockOp::Batch)?;
        self.shared.record(MockEvent::Batch {
            connection: self.id,
            sql: sql.to_string(),
            sync,
        });
        Ok(())
    }

    fn fail(&self, kind: DriverErrorKind, code: Option<String>) -> DriverError {
        driver_error(self.shared.provider, kind, code)
    }

    fn do_execute(&mut self, command: &mut ProviderCommand, sync: bool) -> Result<u64, DriverError> {
        self.ensure_open()?;
        self.shared.record(MockEvent::Execute {
            connection: self.id,
            command: MockCommand::capture(command),
            sync,
        });
        match self.shared.next_reply() {
            None | Some(MockReply::Scalar(_)) => Ok(0),
            Some(MockReply::Affected(affected)) => Ok(affected),
            Some(MockReply::Rows(results)) => {
                Ok(results.iter().map(|r| r.rows.len() as u64).sum())
            }
            Some(MockReply::Outputs { affected, values }) => {
                write_outputs(command, values);
                Ok(affected)
            }
            Some(MockReply::Cursor { parameter, result }) => {
                if let Some(target) = command.parameter_mut(&parameter) {
                    target.cursor = Some(Box::new(BufferedReader::new(vec![result])));
                }
                Ok(0)
            }
            Some(MockReply::Fail { kind, code }) => Err(self.fail(kind, code)),
        }
    }

    fn do_scalar(
        &mut self,
        command: &mut ProviderCommand,
        sync: bool,
    ) -> Result<DbValue, DriverError> {
        self.ensure_open()?;
        self.shared.record(MockEvent::Scalar {
            connection: self.id,
            command: MockCommand::capture(command),
            sync,
        });
        match self.shared.next_reply() {
            None | Some(MockReply::Cursor { .. }) => Ok(DbValue::Null),
            Some(MockReply::Scalar(value)) => Ok(value),
            Some(MockReply::Affected(affected)) => {
                Ok(DbValue::Int(i64::try_from(affected).unwrap_or(i64::MAX)))
            }
            Some(MockReply::Rows(results)) => Ok(results
                .first()
                .and_then(|r| r.rows.front())
                .and_then(|row| row.first())
                .cloned()
                .unwrap_or(DbValue::Null)),
            Some(MockReply::Outputs { values, .. }) => {
                write_outputs(command, values);
                Ok(DbValue::Null)
            }
            Some(MockReply::Fail { kind, code }) => Err(self.fail(kind, code)),
        }
    }

    fn do_query(
        &mut self,
        command: &mut ProviderCommand,
        sync: bool,
    ) -> Result<Box<dyn RowReader>, DriverError> {
        self.ensure_open()?;
        self.shared.record(MockEvent::Query {
            connection: self.id,
            command: MockCommand::capture(command),
            sync,
        });
        match self.shared.next_reply() {
            Some(MockReply::Rows(results)) => {
                let mut results = results;
                if command.behavior.single_result {
                    results.truncate(1);
                }
                if command.behavior.single_row
                    && let Some(first) = results.first_mut()
                {
                    first.rows.truncate(1);
                }
                Ok(Box::new(BufferedReader::new(results)))
            }
            Some(MockReply::Fail { kind, code }) => Err(self.fail(kind, code)),
            Some(MockReply::Outputs { values, .. }) => {
                write_outputs(command, values);
                Ok(Box::new(BufferedReader::default()))
            }
            _ => Ok(Box::new(BufferedReader::default())),
        }
    }
}

fn write_outputs(command: &mut ProviderCommand, values: Vec<(String, DbValue)>) {
    for (name, value) in values {
        if let Some(target) = command.parameter_mut(&name) {
            target.value = value;
        }
    }
}

#[async_trait]
impl DbConnection for MockConnection {
    fn provider(&self) -> Provider {
        self.shared.provider
    }

    fn is_open(&self) -> bool {
        self.open
    }

    async fn open(&mut self) -> Result<(), DriverError> {
        self.do_open(false)
    }

    async fn close(&mut self) -> Result<(), DriverError> {
        self.do_close(false)
    }

    async fn begin(&mut self, isolation: IsolationLevel) -> Result<(), DriverError> {
        self.do_begin(isolation, false)
    }

    async fn commit(&mut self) -> Result<(), DriverError> {
        self.do_commit(false)
    }

    async fn rollback(&mut self) -> Result<(), DriverError> {
        self.do_rollback(false)
    }

    async fn execute_batch(&mut self, sql: &str) -> Result<(), DriverError> {
        self.do_batch(sql, false)
    }

    async fn execute(&mut self, command: &mut ProviderCommand) -> Result<u64, DriverError> {
        self.do_execute(command, false)
    }

    async fn execute_scalar(
        &mut self,
        command: &mut ProviderCommand,
    ) -> Result<DbValue, DriverError> {
        self.do_scalar(command, false)
    }

    async fn query(
        &mut self,
        command: &mut ProviderCommand,
    ) -> Result<Box<dyn RowReader>, DriverError> {
        self.do_query(command, false)
    }

    fn open_sync(&mut self) -> Result<(), DriverError> {
        self.do_open(true)
    }

    fn close_sync(&mut self) -> Result<(), DriverError> {
        self.do_close(true)
    }

    fn begin_sync(&mut self, isolation: IsolationLevel) -> Result<(), DriverError> {
        self.do_begin(isolation, true)
    }

    fn commit_sync(&mut self) -> Result<(), DriverError> {
        self.do_commit(true)
    }

    fn rollback_sync(&mut self) -> Result<(), DriverError> {
        self.do_rollback(true)
    }

    fn execute_batch_sync(&mut self, sql: &str) -> Result<(), DriverError> {
        self.do_batch(sql, true)
    }

    fn execute_sync(&mut self, command: &mut ProviderCommand) -> Result<u64, DriverError> {
        self.do_execute(command, true)
    }

    fn execute_scalar_sync(
        &mut self,
        command: &mut ProviderCommand,
    ) -> Result<DbValue, DriverError> {
        self.do_scalar(command, true)
    }

    fn query_sync(
        &mut self,
        command: &mut ProviderCommand,
    ) -> Result<Box<dyn RowReader>, DriverError> {
        self.do_query(command, true)
    }
}
