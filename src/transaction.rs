//! Transaction scopes over the ambient stack.
//!
//! A [`TransactionScope`] is one of three variants:
//!
//! | | commit / rollback | savepoints | dispose without commit |
//! |---|---|---|---|
//! | `Root` | physical, through the transaction retry policy | yes | rollback + close |
//! | `Dependent` | records the vote only | yes, on the shared transaction | warning |
//! | `Suppressed` | no-op | `TransactionFeatureNotSupported` | close |
//!
//! The outer scope is authoritative: a root commits even if a dependent scope finished
//! without committing (a warning is logged).

pub mod ambient;
pub mod savepoint;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, Ordering};

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::adapters::dispatch;
use crate::connection::{ConnectionHandle, ConnectionManager};
use crate::error::DbError;
use crate::options::DbOptions;
use crate::resilience::{ResilienceStrategy, RetryPolicy};
use crate::types::{IsolationLevel, Provider};

use ambient::AmbientFrame;

static NEXT_SCOPE_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_TRANSACTION_ID: AtomicU64 = AtomicU64::new(1);

/// How `begin` relates the new scope to the ambient one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScopeOption {
    /// Join the ambient transaction, or start one.
    #[default]
    Required,
    /// Always start an independent connection and transaction.
    RequiresNew,
    /// Run on a new connection without any transaction.
    Suppress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    Root,
    Dependent,
    Suppressed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Active,
    Committed,
    RolledBack,
}

impl TransactionStatus {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => TransactionStatus::Committed,
            2 => TransactionStatus::RolledBack,
            _ => TransactionStatus::Active,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            TransactionStatus::Active => 0,
            TransactionStatus::Committed => 1,
            TransactionStatus::RolledBack => 2,
        }
    }
}

struct TransactionState {
    id: u64,
    connection_id: u64,
    isolation: IsolationLevel,
    status: AtomicU8,
    abort_votes: AtomicU32,
}

/// Shared reference to one physical transaction.
#[derive(Clone)]
pub struct TransactionHandle {
    inner: Arc<TransactionState>,
}

impl TransactionHandle {
    pub(crate) fn new(connection_id: u64, isolation: IsolationLevel) -> Self {
        Self {
            inner: Arc::new(TransactionState {
                id: NEXT_TRANSACTION_ID.fetch_add(1, Ordering::Relaxed),
                connection_id,
                isolation,
                status: AtomicU8::new(TransactionStatus::Active.as_u8()),
                abort_votes: AtomicU32::new(0),
            }),
        }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    #[must_use]
    pub fn connection_id(&self) -> u64 {
        self.inner.connection_id
    }

    #[must_use]
    pub fn isolation(&self) -> IsolationLevel {
        self.inner.isolation
    }

    #[must_use]
    pub fn status(&self) -> TransactionStatus {
        TransactionStatus::from_u8(self.inner.status.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status() == TransactionStatus::Active
    }

    #[must_use]
    pub fn same_as(&self, other: &TransactionHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn set_status(&self, status: TransactionStatus) {
        self.inner.status.store(status.as_u8(), Ordering::Release);
    }

    fn record_abort_vote(&self) {
        self.inner.abort_votes.fetch_add(1, Ordering::AcqRel);
    }

    fn abort_votes(&self) -> u32 {
        self.inner.abort_votes.load(Ordering::Acquire)
    }
}

impl fmt::Debug for TransactionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionHandle")
            .field("id", &self.id())
            .field("connection_id", &self.connection_id())
            .field("isolation", &self.isolation())
            .field("status", &self.status())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeState {
    Active,
    Committed,
    RolledBack,
    Disposed,
}

struct ScopeCore {
    id: u64,
    connection: ConnectionHandle,
    state: ScopeState,
    policy: RetryPolicy,
    cancel: CancellationToken,
    /// Shared with the ambient frame so a chain can skip frames released elsewhere.
    released: Arc<AtomicBool>,
}

impl ScopeCore {
    fn new(connection: ConnectionHandle, policy: RetryPolicy, cancel: CancellationToken) -> Self {
        Self {
            id: NEXT_SCOPE_ID.fetch_add(1, Ordering::Relaxed),
            connection,
            state: ScopeState::Active,
            policy,
            cancel,
            released: Arc::new(AtomicBool::new(false)),
        }
    }

    fn ensure_active(&self, operation: &str) -> Result<(), DbError> {
        if self.state == ScopeState::Active {
            Ok(())
        } else {
            Err(DbError::Validation(format!(
                "cannot {operation}: transaction scope {} is {:?}",
                self.id, self.state
            )))
        }
    }

    async fn run_batch(&self, sql: &str) -> Result<(), DbError> {
        let mut conn = self.connection.lock().await;
        dispatch::execute_batch(conn.as_mut(), sql, &self.cancel).await
    }
}

#[derive(Debug, Clone, Copy)]
enum Finish {
    Commit,
    Rollback,
}

/// Run a physical commit or rollback through the transaction retry policy.
async fn finish(
    connection: &ConnectionHandle,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    how: Finish,
) -> Result<(), DbError> {
    policy
        .execute(cancel, |_| {
            let connection = connection.clone();
            let cancel = cancel.clone();
            async move {
                let mut conn = connection.lock().await;
                match how {
                    Finish::Commit => dispatch::commit(conn.as_mut(), &cancel).await,
                    Finish::Rollback => dispatch::rollback(conn.as_mut(), &cancel).await,
                }
            }
        })
        .await
}

/// Owns a connection and the transaction started on it.
pub struct RootScope {
    core: ScopeCore,
    transaction: TransactionHandle,
}

/// Shares the ambient root's connection and transaction.
pub struct DependentScope {
    core: ScopeCore,
    transaction: TransactionHandle,
}

/// Owns a connection with no transaction.
pub struct SuppressedScope {
    core: ScopeCore,
}

/// A transaction scope pushed onto the ambient stack.
///
/// Always finish with [`TransactionScope::dispose`]. Dropping an undisposed scope pops it
/// from the stack and spawns the rollback and close on the current runtime.
///
/// A scope is bound to the call chain that began it. Disposing it from another task
/// still releases it, and the owning chain skips its frame from then on.
pub enum TransactionScope {
    Root(RootScope),
    Dependent(DependentScope),
    Suppressed(SuppressedScope),
}

impl TransactionScope {
    fn core(&self) -> &ScopeCore {
        match self {
            TransactionScope::Root(scope) => &scope.core,
            TransactionScope::Dependent(scope) => &scope.core,
            TransactionScope::Suppressed(scope) => &scope.core,
        }
    }

    fn core_mut(&mut self) -> &mut ScopeCore {
        match self {
            TransactionScope::Root(scope) => &mut scope.core,
            TransactionScope::Dependent(scope) => &mut scope.core,
            TransactionScope::Suppressed(scope) => &mut scope.core,
        }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.core().id
    }

    #[must_use]
    pub fn kind(&self) -> ScopeKind {
        match self {
            TransactionScope::Root(_) => ScopeKind::Root,
            TransactionScope::Dependent(_) => ScopeKind::Dependent,
            TransactionScope::Suppressed(_) => ScopeKind::Suppressed,
        }
    }

    #[must_use]
    pub fn state(&self) -> ScopeState {
        self.core().state
    }

    #[must_use]
    pub fn connection(&self) -> &ConnectionHandle {
        &self.core().connection
    }

    fn release_frame(&self) {
        self.core().released.store(true, Ordering::Release);
        ambient::pop(self.id());
    }

    #[must_use]
    pub fn provider(&self) -> Provider {
        self.core().connection.provider()
    }

    /// The transaction commands enlist in; `None` for a suppressed scope.
    #[must_use]
    pub fn transaction(&self) -> Option<&TransactionHandle> {
        match self {
            TransactionScope::Root(scope) => Some(&scope.transaction),
            TransactionScope::Dependent(scope) => Some(&scope.transaction),
            TransactionScope::Suppressed(_) => None,
        }
    }

    /// Commit the scope.
    ///
    /// # Errors
    /// Returns `DbError::Validation` if the scope already finished, or the driver error
    /// once the transaction retry policy gives up.
    pub async fn commit(&mut self) -> Result<(), DbError> {
        self.core().ensure_active("commit")?;
        match self {
            TransactionScope::Root(root) => {
                let votes = root.transaction.abort_votes();
                if votes > 0 {
                    warn!(
                        scope = root.core.id,
                        transaction = root.transaction.id(),
                        votes,
                        "committing although dependent scopes did not complete"
                    );
                }
                finish(
                    &root.core.connection,
                    &root.core.policy,
                    &root.core.cancel,
                    Finish::Commit,
                )
                .await?;
                root.transaction.set_status(TransactionStatus::Committed);
                debug!(
                    scope = root.core.id,
                    transaction = root.transaction.id(),
                    "committed transaction"
                );
            }
            TransactionScope::Dependent(dependent) => {
                debug!(
                    scope = dependent.core.id,
                    transaction = dependent.transaction.id(),
                    "dependent scope complete"
                );
            }
            TransactionScope::Suppressed(_) => {}
        }
        self.core_mut().state = ScopeState::Committed;
        Ok(())
    }

    /// Roll the scope back.
    ///
    /// # Errors
    /// Returns `DbError::Validation` if the scope already finished, or the driver error
    /// once the transaction retry policy gives up.
    pub async fn rollback(&mut self) -> Result<(), DbError> {
        self.core().ensure_active("roll back")?;
        match self {
            TransactionScope::Root(root) => {
                finish(
                    &root.core.connection,
                    &root.core.policy,
                    &root.core.cancel,
                    Finish::Rollback,
                )
                .await?;
                root.transaction.set_status(TransactionStatus::RolledBack);
                debug!(
                    scope = root.core.id,
                    transaction = root.transaction.id(),
                    "rolled back transaction"
                );
            }
            TransactionScope::Dependent(dependent) => dependent.transaction.record_abort_vote(),
            TransactionScope::Suppressed(_) => {}
        }
        self.core_mut().state = ScopeState::RolledBack;
        Ok(())
    }

    fn savepoint_core(&self, operation: &str) -> Result<&ScopeCore, DbError> {
        if let TransactionScope::Suppressed(scope) = self {
            return Err(DbError::TransactionFeatureNotSupported(format!(
                "{operation} is not available on suppressed scope {}",
                scope.core.id
            )));
        }
        let core = self.core();
        core.ensure_active(operation)?;
        Ok(core)
    }

    /// Create a savepoint named `name`.
    ///
    /// # Errors
    /// `TransactionFeatureNotSupported` on a suppressed scope, `Validation` for a bad name
    /// or finished scope, or the driver error.
    pub async fn begin_savepoint(&self, name: &str) -> Result<(), DbError> {
        let core = self.savepoint_core("begin_savepoint")?;
        let sql = savepoint::begin_sql(core.connection.provider(), name)?;
        core.run_batch(&sql).await
    }

    /// Roll back to the savepoint named `name`.
    ///
    /// # Errors
    /// Same as [`TransactionScope::begin_savepoint`].
    pub async fn rollback_to_savepoint(&self, name: &str) -> Result<(), DbError> {
        let core = self.savepoint_core("rollback_to_savepoint")?;
        let sql = savepoint::rollback_sql(core.connection.provider(), name)?;
        core.run_batch(&sql).await
    }

    /// Release the savepoint named `name`; a no-op where the provider has no release.
    ///
    /// # Errors
    /// Same as [`TransactionScope::begin_savepoint`].
    pub async fn release_savepoint(&self, name: &str) -> Result<(), DbError> {
        let core = self.savepoint_core("release_savepoint")?;
        match savepoint::release_sql(core.connection.provider(), name)? {
            Some(sql) => core.run_batch(&sql).await,
            None => Ok(()),
        }
    }

    /// Pop the scope and release what it owns. Calling it again is a no-op.
    ///
    /// A root that was neither committed nor rolled back is rolled back here.
    ///
    /// # Errors
    /// Returns the rollback or close failure; the scope is disposed either way.
    pub async fn dispose(&mut self) -> Result<(), DbError> {
        if self.state() == ScopeState::Disposed {
            return Ok(());
        }
        self.release_frame();
        let cleanup = CancellationToken::new();
        let result = match self {
            TransactionScope::Root(root) => {
                let mut result = Ok(());
                if root.core.state == ScopeState::Active {
                    warn!(
                        scope = root.core.id,
                        transaction = root.transaction.id(),
                        "transaction scope disposed without commit; rolling back"
                    );
                    result = finish(
                        &root.core.connection,
                        &root.core.policy,
                        &cleanup,
                        Finish::Rollback,
                    )
                    .await;
                    if result.is_ok() {
                        root.transaction.set_status(TransactionStatus::RolledBack);
                    }
                }
                let closed = root.core.connection.close(&cleanup).await;
                result.and(closed)
            }
            TransactionScope::Dependent(dependent) => {
                if dependent.core.state == ScopeState::Active {
                    warn!(
                        scope = dependent.core.id,
                        transaction = dependent.transaction.id(),
                        "dependent transaction scope disposed without commit"
                    );
                    dependent.transaction.record_abort_vote();
                }
                Ok(())
            }
            TransactionScope::Suppressed(suppressed) => {
                suppressed.core.connection.close(&cleanup).await
            }
        };
        self.core_mut().state = ScopeState::Disposed;
        result
    }
}

impl Drop for TransactionScope {
    fn drop(&mut self) {
        if self.state() == ScopeState::Disposed {
            return;
        }
        self.release_frame();
        let (connection, policy, rollback) = match self {
            TransactionScope::Root(root) => {
                let rollback = root.core.state == ScopeState::Active;
                warn!(
                    scope = root.core.id,
                    rollback, "transaction scope dropped without dispose"
                );
                (root.core.connection.clone(), root.core.policy.clone(), rollback)
            }
            TransactionScope::Dependent(dependent) => {
                if dependent.core.state == ScopeState::Active {
                    warn!(
                        scope = dependent.core.id,
                        "dependent transaction scope dropped without commit"
                    );
                    dependent.transaction.record_abort_vote();
                }
                return;
            }
            TransactionScope::Suppressed(suppressed) => (
                suppressed.core.connection.clone(),
                suppressed.core.policy.clone(),
                false,
            ),
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(
                connection = connection.id(),
                "transaction scope dropped outside a runtime; connection left open"
            );
            return;
        };
        handle.spawn(async move {
            let cancel = CancellationToken::new();
            if rollback
                && let Err(err) = finish(&connection, &policy, &cancel, Finish::Rollback).await
            {
                warn!(connection = connection.id(), error = %err, "rollback after drop failed");
            }
            if let Err(err) = connection.close(&cancel).await {
                warn!(connection = connection.id(), error = %err, "close after drop failed");
            }
        });
    }
}

impl fmt::Debug for TransactionScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionScope")
            .field("id", &self.id())
            .field("kind", &self.kind())
            .field("state", &self.state())
            .field("connection", &self.connection().id())
            .field("transaction", &self.transaction().map(TransactionHandle::id))
            .finish()
    }
}

/// Creates transaction scopes.
#[derive(Debug, Clone)]
pub struct TransactionManager {
    connections: ConnectionManager,
}

impl TransactionManager {
    #[must_use]
    pub fn new(connections: ConnectionManager) -> Self {
        Self { connections }
    }

    /// Begin a scope and push it onto the ambient stack.
    ///
    /// # Errors
    /// `Configuration` when no ambient context is installed, `Validation` when a joined
    /// transaction runs at a different isolation level, or the driver error raised while
    /// opening the connection or starting the transaction.
    pub async fn begin(
        &self,
        isolation: IsolationLevel,
        options: &DbOptions,
        scope_option: ScopeOption,
        cancel: &CancellationToken,
    ) -> Result<TransactionScope, DbError> {
        ambient::ensure_installed()?;
        let policy = ResilienceStrategy::from_options(&options.resilience)
            .transaction()
            .clone();

        let scope = match scope_option {
            ScopeOption::Required => match ambient::current() {
                Some(AmbientFrame {
                    kind: ScopeKind::Root | ScopeKind::Dependent,
                    connection,
                    transaction: Some(transaction),
                    ..
                }) => {
                    if isolation != IsolationLevel::Unspecified
                        && isolation != transaction.isolation()
                    {
                        return Err(DbError::Validation(format!(
                            "requested isolation {isolation:?} differs from the ambient transaction's {:?}",
                            transaction.isolation()
                        )));
                    }
                    TransactionScope::Dependent(DependentScope {
                        core: ScopeCore::new(connection, policy, cancel.clone()),
                        transaction,
                    })
                }
                _ => self.begin_root(isolation, options, policy, cancel).await?,
            },
            ScopeOption::RequiresNew => self.begin_root(isolation, options, policy, cancel).await?,
            ScopeOption::Suppress => {
                let connection = self.connections.open_new(options, cancel).await?;
                TransactionScope::Suppressed(SuppressedScope {
                    core: ScopeCore::new(connection, policy, cancel.clone()),
                })
            }
        };

        let frame = AmbientFrame {
            scope_id: scope.id(),
            kind: scope.kind(),
            connection: scope.connection().clone(),
            transaction: scope.transaction().cloned(),
            released: scope.core().released.clone(),
        };
        ambient::push(frame)?;
        debug!(
            scope = scope.id(),
            kind = ?scope.kind(),
            connection = scope.connection().id(),
            depth = ambient::depth(),
            "began transaction scope"
        );
        Ok(scope)
    }

    async fn begin_root(
        &self,
        isolation: IsolationLevel,
        options: &DbOptions,
        policy: RetryPolicy,
        cancel: &CancellationToken,
    ) -> Result<TransactionScope, DbError> {
        let connection = self.connections.open_new(options, cancel).await?;
        let started = {
            let mut conn = connection.lock().await;
            dispatch::begin(conn.as_mut(), isolation, cancel).await
        };
        if let Err(err) = started {
            if let Err(close_err) = connection.close(&CancellationToken::new()).await {
                warn!(connection = connection.id(), error = %close_err, "close after failed begin");
            }
            return Err(err);
        }
        let transaction = TransactionHandle::new(connection.id(), isolation);
        Ok(TransactionScope::Root(RootScope {
            core: ScopeCore::new(connection, policy, cancel.clone()),
            transaction,
        }))
    }
}
