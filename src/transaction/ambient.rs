//! The ambient transaction stack.
//!
//! Frames live in a task-local, so they follow one logical call chain across `.await`
//! points and worker threads while independently spawned tasks never see each other's
//! frames. A chain opts in with [`scope`]; `Database::with_transaction` does this itself.

use std::cell::RefCell;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::warn;

use crate::connection::ConnectionHandle;
use crate::error::DbError;

use super::{ScopeKind, TransactionHandle};

/// One active transaction scope as seen by operations that run under it.
#[derive(Debug, Clone)]
pub(crate) struct AmbientFrame {
    pub scope_id: u64,
    pub kind: ScopeKind,
    pub connection: ConnectionHandle,
    /// Absent for suppressed scopes.
    pub transaction: Option<TransactionHandle>,
    pub released: Arc<AtomicBool>,
}

impl AmbientFrame {
    fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

tokio::task_local! {
    static AMBIENT: RefCell<Vec<AmbientFrame>>;
}

/// Run `fut` with an ambient transaction stack installed.
///
/// Nested calls reuse the stack that is already installed.
pub async fn scope<F, T>(fut: F) -> T
where
    F: Future<Output = T>,
{
    if is_installed() {
        fut.await
    } else {
        AMBIENT.scope(RefCell::new(Vec::new()), fut).await
    }
}

#[must_use]
pub fn is_installed() -> bool {
    AMBIENT.try_with(|_| ()).is_ok()
}

/// Number of live scopes on the stack.
#[must_use]
pub fn depth() -> usize {
    AMBIENT
        .try_with(|stack| stack.borrow().iter().filter(|f| !f.is_released()).count())
        .unwrap_or(0)
}

/// The innermost live frame.
///
/// Scopes belong to the chain that began them. One disposed from another task cannot
/// pop its frame here, so released frames are pruned on the way.
pub(crate) fn current() -> Option<AmbientFrame> {
    AMBIENT
        .try_with(|stack| {
            let mut stack = stack.borrow_mut();
            stack.retain(|frame| !frame.is_released());
            stack.last().cloned()
        })
        .ok()
        .flatten()
}

pub(crate) fn ensure_installed() -> Result<(), DbError> {
    if is_installed() {
        Ok(())
    } else {
        Err(DbError::Configuration(
            "no ambient transaction context; run inside sqlbridge::ambient::scope or Database::with_transaction"
                .to_string(),
        ))
    }
}

pub(crate) fn push(frame: AmbientFrame) -> Result<(), DbError> {
    AMBIENT
        .try_with(|stack| stack.borrow_mut().push(frame))
        .map_err(|_| {
            DbError::Configuration("ambient transaction context is not installed".to_string())
        })
}

/// Remove the frame for `scope_id`. Frames above it stay in place.
pub(crate) fn pop(scope_id: u64) {
    let _ = AMBIENT.try_with(|stack| {
        let mut stack = stack.borrow_mut();
        match stack.iter().rposition(|frame| frame.scope_id == scope_id) {
            Some(idx) if idx + 1 == stack.len() => {
                stack.pop();
            }
            Some(idx) => {
                warn!(
                    scope = scope_id,
                    above = stack.len() - idx - 1,
                    "transaction scope disposed out of order"
                );
                stack.remove(idx);
            }
            None => {}
        }
    });
}
