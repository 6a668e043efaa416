//! Retry executors for command execution and transaction commit/rollback.
//!
//! Two executors with independent settings live in a [`ResilienceStrategy`]. Each retries
//! failures its classifier accepts, sleeping with backoff between attempts; the sleep
//! races the caller's cancellation token so a cancel never turns into another attempt.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{DbError, DriverErrorKind};
use crate::options::{ResilienceOptions, RetrySettings};
use crate::types::Provider;

/// Decides whether a failure is worth another attempt.
pub type TransientClassifier = Arc<dyn Fn(&DbError) -> bool + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    Constant,
    Linear,
    #[default]
    Exponential,
}

impl Backoff {
    /// Delay before retry number `retry` (1-based).
    #[must_use]
    pub fn delay(self, base: Duration, max: Duration, retry: u32) -> Duration {
        let delay = match self {
            Backoff::Constant => base,
            Backoff::Linear => base.saturating_mul(retry),
            Backoff::Exponential => {
                base.saturating_mul(2u32.saturating_pow(retry.saturating_sub(1)))
            }
        };
        delay.min(max)
    }
}

const SQLSERVER_TRANSIENT: &[&str] = &[
    "-2", "53", "64", "233", "1205", "4060", "10053", "10054", "10928", "10929", "40197", "40501",
    "40613", "49918",
];
const POSTGRES_TRANSIENT: &[&str] = &[
    "40001", "40P01", "53300", "57P01", "57P02", "57P03", "08000", "08001", "08003", "08006",
];
const ORACLE_TRANSIENT: &[&str] = &[
    "ORA-00060", "ORA-03113", "ORA-03114", "ORA-12170", "ORA-12514", "ORA-12541", "ORA-12543",
];

/// Built-in classifier: transient driver kinds plus well-known provider codes.
#[must_use]
pub fn is_transient(err: &DbError) -> bool {
    let Some(driver) = err.driver_error() else {
        return false;
    };
    if matches!(
        driver.kind,
        DriverErrorKind::Timeout
            | DriverErrorKind::ConnectionBroken
            | DriverErrorKind::Deadlock
            | DriverErrorKind::Throttled
    ) {
        return true;
    }
    let Some(code) = driver.code.as_deref() else {
        return false;
    };
    match driver.provider {
        Some(Provider::SqlServer) => SQLSERVER_TRANSIENT.contains(&code),
        Some(Provider::Postgres) => POSTGRES_TRANSIENT.contains(&code),
        Some(Provider::Oracle) => ORACLE_TRANSIENT.contains(&code),
        None => {
            SQLSERVER_TRANSIENT.contains(&code)
                || POSTGRES_TRANSIENT.contains(&code)
                || ORACLE_TRANSIENT.contains(&code)
        }
    }
}

/// One retry executor.
#[derive(Clone)]
pub struct RetryPolicy {
    name: &'static str,
    enabled: bool,
    retry_count: u32,
    base_delay: Duration,
    max_delay: Duration,
    backoff: Backoff,
    classifier: TransientClassifier,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("name", &self.name)
            .field("enabled", &self.enabled)
            .field("retry_count", &self.retry_count)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn new(name: &'static str, settings: &RetrySettings, classifier: TransientClassifier) -> Self {
        Self {
            name,
            enabled: settings.enabled,
            retry_count: settings.retry_count,
            base_delay: Duration::from_millis(settings.base_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms.max(settings.base_delay_ms)),
            backoff: settings.backoff,
            classifier,
        }
    }

    /// A policy that runs the action exactly once.
    #[must_use]
    pub fn pass_through(name: &'static str) -> Self {
        Self {
            name,
            enabled: false,
            retry_count: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff: Backoff::Constant,
            classifier: Arc::new(|_: &DbError| false),
        }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    #[must_use]
    pub fn retry_count(&self) -> u32 {
        if self.enabled { self.retry_count } else { 0 }
    }

    fn should_retry(&self, err: &DbError, retries_done: u32) -> bool {
        self.enabled
            && retries_done < self.retry_count
            && !err.is_pre_execution()
            && !err.is_cancelled()
            && (self.classifier)(err)
    }

    /// Run `action` until it succeeds, fails with a non-transient error, or retries run out.
    ///
    /// `action` receives the 1-based attempt number.
    ///
    /// # Errors
    /// Returns the last error unchanged once retries are exhausted, or `DbError::Cancelled`
    /// if `cancel` fires while waiting between attempts.
    pub async fn execute<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut action: F,
    ) -> Result<T, DbError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, DbError>>,
    {
        let mut retries_done = 0u32;
        loop {
            let attempt = retries_done + 1;
            match action(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if self.should_retry(&err, retries_done) => {
                    retries_done += 1;
                    let delay = self
                        .backoff
                        .delay(self.base_delay, self.max_delay, retries_done);
                    warn!(
                        policy = self.name,
                        attempt,
                        retry_in_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %err,
                        "transient failure, retrying"
                    );
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => return Err(DbError::Cancelled),
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// The command and transaction executors, configured independently.
#[derive(Debug, Clone)]
pub struct ResilienceStrategy {
    command: RetryPolicy,
    transaction: RetryPolicy,
}

impl ResilienceStrategy {
    #[must_use]
    pub fn from_options(options: &ResilienceOptions) -> Self {
        if !options.enabled {
            return Self::disabled();
        }
        let classifier = options
            .classifier
            .clone()
            .unwrap_or_else(|| Arc::new(is_transient));
        Self {
            command: RetryPolicy::new("command", &options.command, classifier.clone()),
            transaction: RetryPolicy::new("transaction", &options.transaction, classifier),
        }
    }

    #[must_use]
    pub fn disabled() -> Self {
        Self {
            command: RetryPolicy::pass_through("command"),
            transaction: RetryPolicy::pass_through("transaction"),
        }
    }

    #[must_use]
    pub fn command(&self) -> &RetryPolicy {
        &self.command
    }

    #[must_use]
    pub fn transaction(&self) -> &RetryPolicy {
        &self.transaction
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::error::DriverError;

    fn settings(retry_count: u32) -> RetrySettings {
        RetrySettings {
            enabled: true,
            retry_count,
            base_delay_ms: 1,
            max_delay_ms: 5,
            backoff: Backoff::Exponential,
        }
    }

    #[test]
    fn backoff_shapes() {
        let base = Duration::from_millis(10);
        let max = Duration::from_millis(35);
        assert_eq!(Backoff::Constant.delay(base, max, 3), base);
        assert_eq!(Backoff::Linear.delay(base, max, 3), Duration::from_millis(30));
        assert_eq!(Backoff::Exponential.delay(base, max, 2), Duration::from_millis(20));
        assert_eq!(Backoff::Exponential.delay(base, max, 3), max);
    }

    #[test]
    fn classifies_codes_per_provider() {
        let pg = DbError::Driver(
            DriverError::new(DriverErrorKind::Other, "serialization")
                .with_provider(Provider::Postgres)
                .with_code("40001"),
        );
        let mssql_syntax = DbError::Driver(
            DriverError::new(DriverErrorKind::Other, "syntax")
                .with_provider(Provider::SqlServer)
                .with_code("102"),
        );
        assert!(is_transient(&pg));
        assert!(!is_transient(&mssql_syntax));
        assert!(!is_transient(&DbError::Validation("x".into())));
    }

    #[tokio::test]
    async fn validation_errors_are_never_retried() {
        let policy = RetryPolicy::new("command", &settings(3), Arc::new(|_: &DbError| true));
        let calls = AtomicU32::new(0);
        let result: Result<(), DbError> = policy
            .execute(&CancellationToken::new(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(DbError::Validation("bad".into())) }
            })
            .await;
        assert!(matches!(result, Err(DbError::Validation(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausting_retries_returns_last_error() {
        let policy = RetryPolicy::new("command", &settings(2), Arc::new(is_transient));
        let calls = AtomicU32::new(0);
        let result: Result<(), DbError> = policy
            .execute(&CancellationToken::new(), |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { Err(DbError::Driver(DriverError::timeout(format!("attempt {attempt}")))) }
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let err = result.unwrap_err();
        assert_eq!(err.driver_error().map(|e| e.message.as_str()), Some("attempt 3"));
    }

    #[test]
    fn each_executor_has_its_own_switch() {
        let mut options = ResilienceOptions::default();
        options.command.enabled = false;
        let strategy = ResilienceStrategy::from_options(&options);
        assert!(!strategy.command().is_enabled());
        assert_eq!(strategy.command().retry_count(), 0);
        assert!(strategy.transaction().is_enabled());
        assert_eq!(strategy.transaction().retry_count(), 1);

        let mut options = ResilienceOptions::default();
        options.transaction.enabled = false;
        let strategy = ResilienceStrategy::from_options(&options);
        assert!(strategy.command().is_enabled());
        assert!(!strategy.transaction().is_enabled());
    }
}
