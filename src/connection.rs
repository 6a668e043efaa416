//! Connection leasing: explicit, ambient, or freshly opened.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{Mutex, MutexGuard, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::adapters::dispatch;
use crate::driver::{ConnectionFactory, DbConnection};
use crate::error::DbError;
use crate::options::DbOptions;
use crate::request::ExternalConnection;
use crate::transaction::{TransactionHandle, ambient};
use crate::types::Provider;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Shared handle to one physical connection.
///
/// The driver connection sits behind an async mutex; whoever runs a command holds the
/// lock for the duration of the driver call, and an open reader holds it until released.
#[derive(Clone)]
pub struct ConnectionHandle {
    id: u64,
    provider: Provider,
    inner: Arc<Mutex<Box<dyn DbConnection>>>,
}

impl ConnectionHandle {
    #[must_use]
    pub fn new(connection: Box<dyn DbConnection>) -> Self {
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            provider: connection.provider(),
            inner: Arc::new(Mutex::new(connection)),
        }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn provider(&self) -> Provider {
        self.provider
    }

    /// Same physical connection.
    #[must_use]
    pub fn same_as(&self, other: &ConnectionHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Lock the connection for one driver call.
    ///
    /// Sync-path providers try the lock first so an uncontended call never yields.
    pub async fn lock(&self) -> MutexGuard<'_, Box<dyn DbConnection>> {
        if self.provider.prefers_sync_path()
            && let Ok(guard) = self.inner.try_lock()
        {
            return guard;
        }
        self.inner.lock().await
    }

    pub(crate) async fn lock_owned(&self) -> OwnedMutexGuard<Box<dyn DbConnection>> {
        if self.provider.prefers_sync_path()
            && let Ok(guard) = Arc::clone(&self.inner).try_lock_owned()
        {
            return guard;
        }
        Arc::clone(&self.inner).lock_owned().await
    }

    /// Close the connection, ignoring a connection that is already closed.
    pub(crate) async fn close(&self, cancel: &CancellationToken) -> Result<(), DbError> {
        let mut conn = self.lock().await;
        if !conn.is_open() {
            return Ok(());
        }
        debug!(connection = self.id, provider = %self.provider, "closing connection");
        dispatch::close(conn.as_mut(), cancel).await
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("provider", &self.provider)
            .finish_non_exhaustive()
    }
}

/// Who is responsible for closing a leased connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// Opened for this operation; closed on release.
    Owned,
    /// Supplied by the caller; closed only when asked to.
    Wrapped { close_on_release: bool },
    /// Borrowed from the ambient transaction scope; never closed here.
    Ambient,
}

/// A leased connection plus the transaction commands should enlist in.
pub struct ConnectionScope {
    connection: ConnectionHandle,
    transaction: Option<TransactionHandle>,
    ownership: Ownership,
    released: bool,
}

impl ConnectionScope {
    #[must_use]
    pub fn connection(&self) -> &ConnectionHandle {
        &self.connection
    }

    #[must_use]
    pub fn transaction(&self) -> Option<&TransactionHandle> {
        self.transaction.as_ref()
    }

    #[must_use]
    pub fn ownership(&self) -> Ownership {
        self.ownership
    }

    #[must_use]
    pub fn provider(&self) -> Provider {
        self.connection.provider()
    }

    fn closes_on_release(&self) -> bool {
        matches!(
            self.ownership,
            Ownership::Owned
                | Ownership::Wrapped {
                    close_on_release: true
                }
        )
    }

    /// Give the connection back. Calling it again is a no-op.
    ///
    /// # Errors
    /// Returns the driver error raised while closing an owned connection.
    pub async fn release(&mut self) -> Result<(), DbError> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        if self.closes_on_release() {
            self.connection.close(&CancellationToken::new()).await?;
        }
        Ok(())
    }
}

impl Drop for ConnectionScope {
    fn drop(&mut self) {
        if self.released || !self.closes_on_release() {
            return;
        }
        let connection = self.connection.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(err) = connection.close(&CancellationToken::new()).await {
                        warn!(connection = connection.id(), error = %err, "close after drop failed");
                    }
                });
            }
            Err(_) => {
                warn!(
                    connection = connection.id(),
                    "connection scope dropped outside a runtime; connection left open"
                );
            }
        }
    }
}

impl fmt::Debug for ConnectionScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionScope")
            .field("connection", &self.connection.id())
            .field("transaction", &self.transaction.as_ref().map(TransactionHandle::id))
            .field("ownership", &self.ownership)
            .field("released", &self.released)
            .finish()
    }
}

/// Hands out connection scopes.
#[derive(Clone)]
pub struct ConnectionManager {
    factory: Arc<dyn ConnectionFactory>,
}

impl ConnectionManager {
    #[must_use]
    pub fn new(factory: Arc<dyn ConnectionFactory>) -> Self {
        Self { factory }
    }

    /// Lease a connection for one operation.
    ///
    /// An explicit connection wins, then the ambient transaction scope, then a new
    /// connection from the factory.
    ///
    /// # Errors
    /// Factory and driver errors are returned as `DbError::Driver`, unwrapped.
    pub async fn lease(
        &self,
        options: &DbOptions,
        external: Option<&ExternalConnection>,
        cancel: &CancellationToken,
    ) -> Result<ConnectionScope, DbError> {
        if let Some(external) = external {
            {
                let mut conn = external.connection.lock().await;
                if !conn.is_open() {
                    debug!(connection = external.connection.id(), "opening caller connection");
                    dispatch::open(conn.as_mut(), cancel).await?;
                }
            }
            return Ok(ConnectionScope {
                connection: external.connection.clone(),
                transaction: external.transaction.clone(),
                ownership: Ownership::Wrapped {
                    close_on_release: external.close_on_completion,
                },
                released: false,
            });
        }

        if let Some(frame) = ambient::current() {
            return Ok(ConnectionScope {
                connection: frame.connection,
                transaction: frame.transaction,
                ownership: Ownership::Ambient,
                released: false,
            });
        }

        let connection = self.open_new(options, cancel).await?;
        Ok(ConnectionScope {
            connection,
            transaction: None,
            ownership: Ownership::Owned,
            released: false,
        })
    }

    /// Create and open a connection that nobody else references yet.
    pub(crate) async fn open_new(
        &self,
        options: &DbOptions,
        cancel: &CancellationToken,
    ) -> Result<ConnectionHandle, DbError> {
        let connection = self.factory.create_connection(options).await?;
        let handle = ConnectionHandle::new(connection);
        {
            let mut conn = handle.lock().await;
            if !conn.is_open() {
                dispatch::open(conn.as_mut(), cancel).await?;
            }
        }
        debug!(connection = handle.id(), provider = %handle.provider(), "opened connection");
        Ok(handle)
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager").finish_non_exhaustive()
    }
}
