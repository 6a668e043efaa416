//! Provider-agnostic command execution and transaction coordination for SQL Server,
//! PostgreSQL and Oracle.
//!
//! [`Database`] is the entry point. It validates and binds a [`CommandRequest`] onto a
//! pooled provider command, resolves the connection (explicit, ambient transaction, or a
//! freshly opened one), runs it through the retry policy and maps the outcome. Drivers
//! plug in through [`ConnectionFactory`].
//!
//! ```rust
//! use std::time::Duration;
//! use sqlbridge::prelude::*;
//!
//! let options = DbOptions::builder(Provider::Postgres, "postgres://app@localhost/app")
//!     .command_retries(3, Duration::from_millis(50))
//!     .build()
//!     .unwrap();
//! assert_eq!(options.provider, Provider::Postgres);
//!
//! let request = CommandRequest::text("SELECT name FROM users WHERE id = @id")
//!     .param(ParameterDefinition::input("id", 7));
//! assert_eq!(request.parameters.len(), 1);
//! ```

pub mod binder;
pub mod connection;
pub mod driver;
pub mod error;
pub mod executor;
pub mod mapping;
pub mod options;
pub mod parameter;
pub mod pool;
pub mod prelude;
pub mod request;
pub mod resilience;
pub mod results;
pub mod transaction;
pub mod translation;
pub mod types;

pub(crate) mod adapters;

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(feature = "mssql")]
pub mod mssql;

#[cfg(feature = "test-utils")]
pub mod test_utils;

pub use connection::{ConnectionHandle, ConnectionScope, Ownership};
pub use driver::{ConnectionFactory, DbConnection, ProviderCommand, RowReader};
pub use error::{DbError, DriverError, DriverErrorKind};
pub use executor::Database;
pub use mapping::FromRow;
pub use options::{DbOptions, DbOptionsBuilder};
pub use parameter::ParameterDefinition;
pub use request::{CommandKind, CommandRequest, ExecutionResult, OutputParameters, ReadBehavior};
pub use results::{DataRow, DataTable, ReaderLease, RowStream, TableSet};
pub use transaction::{ScopeOption, TransactionHandle, TransactionScope, ambient};
pub use types::{DbType, DbValue, IsolationLevel, ParameterDirection, Provider};
