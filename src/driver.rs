//! The contract a database driver implements to plug into the core.
//!
//! Async entry points are required. The `*_sync` variants are optional and only called
//! for providers whose driver blocks anyway (see [`Provider::prefers_sync_path`]); their
//! default implementations report `DriverErrorKind::Unsupported`.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::DriverError;
use crate::options::DbOptions;
use crate::request::{CommandKind, ReadBehavior};
use crate::types::{DbType, DbValue, IsolationLevel, ParameterDirection, Provider, trim_parameter_prefix};

/// A parameter bound onto a [`ProviderCommand`].
///
/// Drivers write output values back into `value`, and cursor outputs into `cursor`.
pub struct ProviderParameter {
    /// Name including the provider prefix.
    pub name: String,
    pub db_type: DbType,
    pub direction: ParameterDirection,
    pub size: Option<u32>,
    pub precision: Option<u8>,
    pub scale: Option<u8>,
    pub nullable: bool,
    pub provider_type: Option<String>,
    pub value: DbValue,
    pub cursor: Option<Box<dyn RowReader>>,
}

impl Default for ProviderParameter {
    fn default() -> Self {
        Self {
            name: String::new(),
            db_type: DbType::default(),
            direction: ParameterDirection::default(),
            size: None,
            precision: None,
            scale: None,
            nullable: true,
            provider_type: None,
            value: DbValue::Null,
            cursor: None,
        }
    }
}

impl ProviderParameter {
    /// Name without its provider prefix.
    #[must_use]
    pub fn logical_name(&self) -> &str {
        trim_parameter_prefix(&self.name)
    }

    #[must_use]
    pub fn matches_name(&self, name: &str) -> bool {
        self.logical_name()
            .eq_ignore_ascii_case(trim_parameter_prefix(name))
    }

    /// Clear every field so the parameter can be reused.
    pub fn reset(&mut self) {
        self.name.clear();
        self.db_type = DbType::default();
        self.direction = ParameterDirection::default();
        self.size = None;
        self.precision = None;
        self.scale = None;
        self.nullable = true;
        self.provider_type = None;
        self.value = DbValue::Null;
        self.cursor = None;
    }
}

impl fmt::Debug for ProviderParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderParameter")
            .field("name", &self.name)
            .field("db_type", &self.db_type)
            .field("direction", &self.direction)
            .field("size", &self.size)
            .field("provider_type", &self.provider_type)
            .field("value", &self.value)
            .field("has_cursor", &self.cursor.is_some())
            .finish_non_exhaustive()
    }
}

/// The command object handed to a driver.
#[derive(Debug, Default)]
pub struct ProviderCommand {
    pub text: String,
    pub kind: CommandKind,
    pub parameters: Vec<ProviderParameter>,
    pub timeout: Option<Duration>,
    pub behavior: ReadBehavior,
    /// Connection this command is attached to while rented.
    pub connection_id: Option<u64>,
    /// Transaction this command is enlisted in while rented.
    pub transaction_id: Option<u64>,
}

impl ProviderCommand {
    #[must_use]
    pub fn parameter(&self, name: &str) -> Option<&ProviderParameter> {
        self.parameters.iter().find(|p| p.matches_name(name))
    }

    pub fn parameter_mut(&mut self, name: &str) -> Option<&mut ProviderParameter> {
        self.parameters.iter_mut().find(|p| p.matches_name(name))
    }

    /// Prefixed names of the bound parameters, in binding order.
    #[must_use]
    pub fn parameter_names(&self) -> Vec<&str> {
        self.parameters.iter().map(|p| p.name.as_str()).collect()
    }

    /// Input values in binding order.
    #[must_use]
    pub fn input_values(&self) -> Vec<&DbValue> {
        self.parameters
            .iter()
            .filter(|p| p.direction.is_input())
            .map(|p| &p.value)
            .collect()
    }
}

/// A live physical connection.
#[async_trait]
pub trait DbConnection: Send {
    fn provider(&self) -> Provider;

    fn is_open(&self) -> bool;

    async fn open(&mut self) -> Result<(), DriverError>;

    async fn close(&mut self) -> Result<(), DriverError>;

    async fn begin(&mut self, isolation: IsolationLevel) -> Result<(), DriverError>;

    async fn commit(&mut self) -> Result<(), DriverError>;

    async fn rollback(&mut self) -> Result<(), DriverError>;

    /// Run SQL without parameters or results (savepoints, session settings).
    async fn execute_batch(&mut self, sql: &str) -> Result<(), DriverError>;

    /// Non-query execution; output parameters are written back into `command`.
    async fn execute(&mut self, command: &mut ProviderCommand) -> Result<u64, DriverError>;

    async fn execute_scalar(&mut self, command: &mut ProviderCommand)
    -> Result<DbValue, DriverError>;

    async fn query(
        &mut self,
        command: &mut ProviderCommand,
    ) -> Result<Box<dyn RowReader>, DriverError>;

    fn open_sync(&mut self) -> Result<(), DriverError> {
        Err(DriverError::unsupported("open_sync"))
    }

    fn close_sync(&mut self) -> Result<(), DriverError> {
        Err(DriverError::unsupported("close_sync"))
    }

    fn begin_sync(&mut self, _isolation: IsolationLevel) -> Result<(), DriverError> {
        Err(DriverError::unsupported("begin_sync"))
    }

    fn commit_sync(&mut self) -> Result<(), DriverError> {
        Err(DriverError::unsupported("commit_sync"))
    }

    fn rollback_sync(&mut self) -> Result<(), DriverError> {
        Err(DriverError::unsupported("rollback_sync"))
    }

    fn execute_batch_sync(&mut self, _sql: &str) -> Result<(), DriverError> {
        Err(DriverError::unsupported("execute_batch_sync"))
    }

    fn execute_sync(&mut self, _command: &mut ProviderCommand) -> Result<u64, DriverError> {
        Err(DriverError::unsupported("execute_sync"))
    }

    fn execute_scalar_sync(
        &mut self,
        _command: &mut ProviderCommand,
    ) -> Result<DbValue, DriverError> {
        Err(DriverError::unsupported("execute_scalar_sync"))
    }

    fn query_sync(
        &mut self,
        _command: &mut ProviderCommand,
    ) -> Result<Box<dyn RowReader>, DriverError> {
        Err(DriverError::unsupported("query_sync"))
    }
}

/// Forward-only access to one or more result sets.
#[async_trait]
pub trait RowReader: Send {
    /// Column names of the current result set.
    fn columns(&self) -> Arc<Vec<String>>;

    async fn next_row(&mut self) -> Result<Option<Vec<DbValue>>, DriverError>;

    /// Advance to the next result set; `false` once exhausted.
    async fn next_result(&mut self) -> Result<bool, DriverError>;

    fn next_row_sync(&mut self) -> Result<Option<Vec<DbValue>>, DriverError> {
        Err(DriverError::unsupported("next_row_sync"))
    }

    fn next_result_sync(&mut self) -> Result<bool, DriverError> {
        Err(DriverError::unsupported("next_result_sync"))
    }

    fn records_affected(&self) -> Option<u64> {
        None
    }
}

/// Creates physical connections for a provider.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn create_connection(
        &self,
        options: &DbOptions,
    ) -> Result<Box<dyn DbConnection>, DriverError>;
}

/// One buffered result set.
#[derive(Debug, Clone, Default)]
pub struct BufferedResult {
    pub columns: Arc<Vec<String>>,
    pub rows: VecDeque<Vec<DbValue>>,
}

impl BufferedResult {
    #[must_use]
    pub fn new(columns: Vec<String>, rows: Vec<Vec<DbValue>>) -> Self {
        Self {
            columns: Arc::new(columns),
            rows: rows.into(),
        }
    }
}

/// A [`RowReader`] over result sets already held in memory.
///
/// Drivers whose row stream borrows the connection buffer into this; it also backs
/// cursor handles in the scripted test driver.
#[derive(Debug, Default)]
pub struct BufferedReader {
    results: VecDeque<BufferedResult>,
    current: BufferedResult,
    records_affected: Option<u64>,
}

impl BufferedReader {
    #[must_use]
    pub fn new(results: Vec<BufferedResult>) -> Self {
        let mut results: VecDeque<BufferedResult> = results.into();
        let current = results.pop_front().unwrap_or_default();
        Self {
            results,
            current,
            records_affected: None,
        }
    }

    #[must_use]
    pub fn single(columns: Vec<String>, rows: Vec<Vec<DbValue>>) -> Self {
        Self::new(vec![BufferedResult::new(columns, rows)])
    }

    #[must_use]
    pub fn with_records_affected(mut self, records: u64) -> Self {
        self.records_affected = Some(records);
        self
    }

    fn advance_row(&mut self) -> Option<Vec<DbValue>> {
        self.current.rows.pop_front()
    }

    fn advance_result(&mut self) -> bool {
        match self.results.pop_front() {
            Some(next) => {
                self.current = next;
                true
            }
            None => {
                self.current.rows.clear();
                false
            }
        }
    }
}

#[async_trait]
impl RowReader for BufferedReader {
    fn columns(&self) -> Arc<Vec<String>> {
        Arc::clone(&self.current.columns)
    }

    async fn next_row(&mut self) -> Result<Option<Vec<DbValue>>, DriverError> {
        Ok(self.advance_row())
    }

    async fn next_result(&mut self) -> Result<bool, DriverError> {
        Ok(self.advance_result())
    }

    fn next_row_sync(&mut self) -> Result<Option<Vec<DbValue>>, DriverError> {
        Ok(self.advance_row())
    }

    fn next_result_sync(&mut self) -> Result<bool, DriverError> {
        Ok(self.advance_result())
    }

    fn records_affected(&self) -> Option<u64> {
        self.records_affected
    }
}
