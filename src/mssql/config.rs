use std::fmt;

use async_trait::async_trait;
use deadpool::managed::{Manager, Metrics, Object, Pool, PoolError, RecycleError, RecycleResult};
use tiberius::{Client, Config as TiberiusConfig};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};

use crate::driver::{ConnectionFactory, DbConnection};
use crate::error::{DbError, DriverError, DriverErrorKind};
use crate::options::DbOptions;
use crate::types::Provider;

use super::connection::MssqlConnection;

pub(super) type MssqlClient = Client<Compat<TcpStream>>;

pub(super) type MssqlPool = Pool<MssqlManager>;

pub(super) type PooledClient = Object<MssqlManager>;

/// Opens TDS sessions for the client pool.
pub struct MssqlManager {
    config: TiberiusConfig,
}

impl fmt::Debug for MssqlManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MssqlManager")
            .field("addr", &self.config.get_addr())
            .finish()
    }
}

impl Manager for MssqlManager {
    type Type = MssqlClient;
    type Error = tiberius::error::Error;

    async fn create(&self) -> Result<MssqlClient, tiberius::error::Error> {
        let tcp = TcpStream::connect(self.config.get_addr()).await?;
        tcp.set_nodelay(true)?;
        Client::connect(self.config.clone(), tcp.compat_write()).await
    }

    async fn recycle(
        &self,
        client: &mut MssqlClient,
        _metrics: &Metrics,
    ) -> RecycleResult<tiberius::error::Error> {
        client
            .simple_query("SELECT 1")
            .await
            .map_err(RecycleError::Backend)?
            .into_results()
            .await
            .map_err(RecycleError::Backend)?;
        Ok(())
    }
}

/// Hands out SQL Server connections backed by a pool of tiberius clients.
#[derive(Clone)]
pub struct MssqlFactory {
    pool: MssqlPool,
}

impl MssqlFactory {
    /// Build the pool from an ADO.NET style connection string.
    ///
    /// # Errors
    /// Returns `DbError::Configuration` if the provider is not SQL Server, the connection
    /// string cannot be parsed, or the pool cannot be built.
    pub fn new(options: &DbOptions) -> Result<Self, DbError> {
        if options.provider != Provider::SqlServer {
            return Err(DbError::Configuration(format!(
                "MssqlFactory cannot serve provider {}",
                options.provider
            )));
        }
        let config = TiberiusConfig::from_ado_string(&options.connection_string).map_err(|e| {
            DbError::Configuration(format!("Invalid SQL Server connection string: {e}"))
        })?;
        let pool = Pool::builder(MssqlManager { config })
            .max_size(20)
            .build()
            .map_err(|e| {
                DbError::Configuration(format!("Failed to create SQL Server pool: {e}"))
            })?;
        Ok(Self { pool })
    }
}

impl fmt::Debug for MssqlFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MssqlFactory")
            .field("status", &self.pool.status())
            .finish()
    }
}

#[async_trait]
impl ConnectionFactory for MssqlFactory {
    async fn create_connection(
        &self,
        _options: &DbOptions,
    ) -> Result<Box<dyn DbConnection>, DriverError> {
        Ok(Box::new(MssqlConnection::new(self.pool.clone())))
    }
}

pub(super) fn pool_error(err: PoolError<tiberius::error::Error>) -> DriverError {
    match err {
        PoolError::Backend(source) => DriverError::from(source),
        PoolError::Timeout(stage) => DriverError::timeout(format!(
            "Failed to get SQL Server connection: pool timed out ({stage:?})"
        ))
        .with_provider(Provider::SqlServer),
        other => DriverError::new(
            DriverErrorKind::Connection,
            format!("Failed to get SQL Server connection: {other}"),
        )
        .with_provider(Provider::SqlServer),
    }
}
