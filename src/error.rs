use std::fmt;

use thiserror::Error;

use crate::types::Provider;

/// Errors surfaced by every public operation of this crate.
///
/// Core failures (validation, configuration, adapter invariants) have their own variants
/// and are never wrapped. Failures coming from a driver are either surfaced raw as
/// [`DbError::Driver`] or wrapped into [`DbError::DataAccess`], depending on
/// [`DbOptions::wrap_provider_errors`](crate::options::DbOptions) and the per-request
/// override.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Provider not supported: {0}")]
    ProviderNotSupported(String),

    #[error("Provider feature error: {0}")]
    ProviderFeature(String),

    #[error("Transaction feature not supported: {0}")]
    TransactionFeatureNotSupported(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Row mapping error: {0}")]
    Mapping(String),

    #[error("Data access error during {operation} ({command}): {source}")]
    DataAccess {
        operation: String,
        command: String,
        #[source]
        source: DriverError,
    },

    #[error(transparent)]
    Driver(#[from] DriverError),
}

impl DbError {
    /// The driver error behind this error, whether raw or wrapped.
    #[must_use]
    pub fn driver_error(&self) -> Option<&DriverError> {
        match self {
            DbError::Driver(err) | DbError::DataAccess { source: err, .. } => Some(err),
            _ => None,
        }
    }

    /// Errors raised before any network call; these are never retried.
    #[must_use]
    pub fn is_pre_execution(&self) -> bool {
        matches!(
            self,
            DbError::Configuration(_)
                | DbError::Validation(_)
                | DbError::ProviderNotSupported(_)
                | DbError::TransactionFeatureNotSupported(_)
        )
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, DbError::Cancelled)
    }
}

/// Coarse classification of a driver failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverErrorKind {
    /// Could not establish a connection.
    Connection,
    /// An established connection was reset or closed underneath us.
    ConnectionBroken,
    Timeout,
    Deadlock,
    /// The server asked the client to back off (resource governance, too many connections).
    Throttled,
    Syntax,
    Constraint,
    /// The driver does not implement the requested entry point.
    Unsupported,
    Other,
}

/// A normalized driver failure.
///
/// Drivers convert their native errors into this type so the resilience layer and the
/// error-wrapping policy can reason about every provider the same way. The native error
/// is kept as the `source`.
pub struct DriverError {
    pub provider: Option<Provider>,
    pub kind: DriverErrorKind,
    /// Provider error code (SQL Server error number, PostgreSQL SQLSTATE, `ORA-nnnnn`).
    pub code: Option<String>,
    pub message: String,
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl DriverError {
    #[must_use]
    pub fn new(kind: DriverErrorKind, message: impl Into<String>) -> Self {
        Self {
            provider: None,
            kind,
            code: None,
            message: message.into(),
            source: None,
        }
    }

    #[must_use]
    pub fn with_provider(mut self, provider: Provider) -> Self {
        self.provider = Some(provider);
        self
    }

    #[must_use]
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Error returned by the default `*_sync` entry points of a driver.
    #[must_use]
    pub fn unsupported(entry_point: &str) -> Self {
        Self::new(
            DriverErrorKind::Unsupported,
            format!("driver does not implement {entry_point}"),
        )
    }

    #[must_use]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(DriverErrorKind::Timeout, message)
    }

    #[must_use]
    pub fn connection_broken(message: impl Into<String>) -> Self {
        Self::new(DriverErrorKind::ConnectionBroken, message)
    }
}

impl fmt::Debug for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverError")
            .field("provider", &self.provider)
            .field("kind", &self.kind)
            .field("code", &self.code)
            .field("message", &self.message)
            .field("has_source", &self.source.is_some())
            .finish()
    }
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.provider, &self.code) {
            (Some(provider), Some(code)) => write!(f, "[{provider} {code}] {}", self.message),
            (Some(provider), None) => write!(f, "[{provider}] {}", self.message),
            (None, Some(code)) => write!(f, "[{code}] {}", self.message),
            (None, None) => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for DriverError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|err| err as &(dyn std::error::Error + 'static))
    }
}

#[cfg(feature = "postgres")]
impl From<tokio_postgres::Error> for DriverError {
    fn from(err: tokio_postgres::Error) -> Self {
        use tokio_postgres::error::SqlState;

        let code = err.code().cloned();
        let kind = match &code {
            Some(state) if *state == SqlState::T_R_SERIALIZATION_FAILURE => {
                DriverErrorKind::Deadlock
            }
            Some(state) if *state == SqlState::T_R_DEADLOCK_DETECTED => DriverErrorKind::Deadlock,
            Some(state) if *state == SqlState::TOO_MANY_CONNECTIONS => DriverErrorKind::Throttled,
            Some(state) if *state == SqlState::QUERY_CANCELED => DriverErrorKind::Timeout,
            Some(state) if *state == SqlState::SYNTAX_ERROR => DriverErrorKind::Syntax,
            Some(state) if state.code().starts_with("23") => DriverErrorKind::Constraint,
            Some(state) if state.code().starts_with("08") || state.code().starts_with("57P") => {
                DriverErrorKind::ConnectionBroken
            }
            Some(_) => DriverErrorKind::Other,
            None if err.is_closed() => DriverErrorKind::ConnectionBroken,
            None => DriverErrorKind::Connection,
        };
        let mut out = DriverError::new(kind, err.to_string()).with_provider(Provider::Postgres);
        if let Some(state) = code {
            out = out.with_code(state.code());
        }
        out.with_source(err)
    }
}

#[cfg(feature = "mssql")]
impl From<tiberius::error::Error> for DriverError {
    fn from(err: tiberius::error::Error) -> Self {
        let (kind, code) = match &err {
            tiberius::error::Error::Server(token) => {
                let number = token.code();
                let kind = match number {
                    1205 => DriverErrorKind::Deadlock,
                    10928 | 10929 | 40501 | 49918 => DriverErrorKind::Throttled,
                    53 | 64 | 233 | 10053 | 10054 | 40197 | 40613 => {
                        DriverErrorKind::ConnectionBroken
                    }
                    102 | 156 => DriverErrorKind::Syntax,
                    547 | 2601 | 2627 => DriverErrorKind::Constraint,
                    _ => DriverErrorKind::Other,
                };
                (kind, Some(number.to_string()))
            }
            tiberius::error::Error::Io { .. } => (DriverErrorKind::ConnectionBroken, None),
            tiberius::error::Error::Routing { .. } => (DriverErrorKind::Connection, None),
            _ => (DriverErrorKind::Other, None),
        };
        let mut out = DriverError::new(kind, err.to_string()).with_provider(Provider::SqlServer);
        if let Some(code) = code {
            out = out.with_code(code);
        }
        out.with_source(err)
    }
}

/// Decides how driver failures leave a public operation.
#[derive(Debug, Clone)]
pub(crate) struct WrapPolicy {
    pub wrap: bool,
    pub operation: &'static str,
    pub command: String,
}

impl WrapPolicy {
    /// Wrap a raw driver error into `DbError::DataAccess` when wrapping is on.
    ///
    /// Core errors pass through untouched.
    pub fn apply(&self, err: DbError) -> DbError {
        match err {
            DbError::Driver(source) if self.wrap => DbError::DataAccess {
                operation: self.operation.to_string(),
                command: self.command.clone(),
                source,
            },
            other => other,
        }
    }
}
