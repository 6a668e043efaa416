//! Convenient imports for common functionality.
//!
//! This module re-exports the types most programs need to build options, describe
//! commands, run them, and read results.

pub use crate::driver::ConnectionFactory;
pub use crate::error::{DbError, DriverError, DriverErrorKind};
pub use crate::executor::Database;
pub use crate::executor::telemetry::{TelemetrySink, TracingTelemetry};
pub use crate::executor::validation::Validator;
pub use crate::mapping::FromRow;
pub use crate::options::{DbOptions, DbOptionsBuilder};
pub use crate::parameter::ParameterDefinition;
pub use crate::request::{
    CommandKind, CommandRequest, ExecutionResult, ExternalConnection, ReadBehavior,
};
pub use crate::results::{DataRow, DataTable, ReaderLease, RowStream, TableSet};
pub use crate::transaction::{ScopeOption, TransactionScope, ambient};
pub use crate::types::{DbType, DbValue, IsolationLevel, ParameterDirection, Provider};

#[cfg(feature = "postgres")]
pub use crate::postgres::PostgresFactory;

#[cfg(feature = "mssql")]
pub use crate::mssql::MssqlFactory;
