use async_trait::async_trait;
use deadpool_postgres::{Config as PgConfig, Pool, Runtime};
use tokio_postgres::NoTls;

use crate::driver::{ConnectionFactory, DbConnection};
use crate::error::{DbError, DriverError, DriverErrorKind};
use crate::options::DbOptions;
use crate::types::Provider;

use super::connection::PostgresConnection;

/// Hands out connections checked out from a `deadpool-postgres` pool.
#[derive(Clone)]
pub struct PostgresFactory {
    pool: Pool,
}

impl PostgresFactory {
    /// Build the pool from `options.connection_string` (URL or key/value form).
    ///
    /// # Errors
    /// Returns `DbError::Configuration` if the provider is not PostgreSQL or pool
    /// creation fails.
    pub fn new(options: &DbOptions) -> Result<Self, DbError> {
        if options.provider != Provider::Postgres {
            return Err(DbError::Configuration(format!(
                "PostgresFactory cannot serve provider {}",
                options.provider
            )));
        }
        let mut pg_config = PgConfig::new();
        pg_config.url = Some(options.connection_string.clone());
        let pool = pg_config
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| {
                DbError::Configuration(format!("Failed to create Postgres pool: {e}"))
            })?;
        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    #[must_use]
    pub fn from_pool(pool: Pool) -> Self {
        Self { pool }
    }
}

impl std::fmt::Debug for PostgresFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresFactory")
            .field("status", &self.pool.status())
            .finish()
    }
}

#[async_trait]
impl ConnectionFactory for PostgresFactory {
    async fn create_connection(
        &self,
        _options: &DbOptions,
    ) -> Result<Box<dyn DbConnection>, DriverError> {
        Ok(Box::new(PostgresConnection::new(self.pool.clone())))
    }
}

pub(super) fn pool_error(err: deadpool_postgres::PoolError) -> DriverError {
    match err {
        deadpool_postgres::PoolError::Backend(source) => DriverError::from(source),
        deadpool_postgres::PoolError::Timeout(stage) => DriverError::timeout(format!(
            "Failed to get Postgres connection: pool timed out ({stage:?})"
        ))
        .with_provider(Provider::Postgres),
        other => DriverError::new(
            DriverErrorKind::Connection,
            format!("Failed to get Postgres connection: {other}"),
        )
        .with_provider(Provider::Postgres),
    }
}
