use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::error::DbError;
use crate::resilience::{Backoff, TransientClassifier};
use crate::types::Provider;

/// Read-only configuration consumed by every component.
///
/// Loading is the caller's business; the struct derives `Deserialize` so it can come from
/// any serde source, and [`DbOptionsBuilder`] covers the programmatic path.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DbOptions {
    pub provider: Provider,
    /// Handed to the connection factory untouched.
    pub connection_string: String,
    /// Maximum number of idle pooled commands kept for reuse.
    pub command_pool_capacity: usize,
    /// Maximum number of idle pooled parameters kept for reuse.
    pub parameter_pool_capacity: usize,
    /// Default command timeout in seconds; `0` leaves the driver default.
    pub command_timeout_secs: u64,
    /// Wrap driver failures into `DbError::DataAccess`.
    pub wrap_provider_errors: bool,
    /// Skip the provider-type allow-list for every parameter.
    pub allow_unsafe_provider_types: bool,
    pub resilience: ResilienceOptions,
    pub bounds: ValueBounds,
}

impl Default for DbOptions {
    fn default() -> Self {
        Self {
            provider: Provider::Postgres,
            connection_string: String::new(),
            command_pool_capacity: 64,
            parameter_pool_capacity: 256,
            command_timeout_secs: 30,
            wrap_provider_errors: true,
            allow_unsafe_provider_types: false,
            resilience: ResilienceOptions::default(),
            bounds: ValueBounds::default(),
        }
    }
}

impl DbOptions {
    #[must_use]
    pub fn builder(provider: Provider, connection_string: impl Into<String>) -> DbOptionsBuilder {
        DbOptionsBuilder::new(provider, connection_string)
    }

    #[must_use]
    pub fn command_timeout(&self) -> Option<Duration> {
        (self.command_timeout_secs > 0).then(|| Duration::from_secs(self.command_timeout_secs))
    }

    /// Check the options before they are used.
    ///
    /// # Errors
    /// Returns `DbError::Configuration` describing the first invalid setting.
    pub fn validate(&self) -> Result<(), DbError> {
        if self.connection_string.trim().is_empty() {
            return Err(DbError::Configuration(
                "connection_string is required".to_string(),
            ));
        }
        if self.bounds.min_date >= self.bounds.max_date {
            return Err(DbError::Configuration(
                "bounds.min_date must be earlier than bounds.max_date".to_string(),
            ));
        }
        if self.bounds.decimal_min >= self.bounds.decimal_max {
            return Err(DbError::Configuration(
                "bounds.decimal_min must be lower than bounds.decimal_max".to_string(),
            ));
        }
        self.resilience.command.validate("command")?;
        self.resilience.transaction.validate("transaction")?;
        Ok(())
    }
}

/// Retry settings for the command and transaction executors.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceOptions {
    pub enabled: bool,
    pub command: RetrySettings,
    pub transaction: RetrySettings,
    /// Overrides the built-in transient classifier for both executors.
    #[serde(skip)]
    pub classifier: Option<TransientClassifier>,
}

impl Default for ResilienceOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            command: RetrySettings::default(),
            transaction: RetrySettings {
                retry_count: 1,
                ..RetrySettings::default()
            },
            classifier: None,
        }
    }
}

impl std::fmt::Debug for ResilienceOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilienceOptions")
            .field("enabled", &self.enabled)
            .field("command", &self.command)
            .field("transaction", &self.transaction)
            .field("classifier", &self.classifier.as_ref().map(|_| "<custom>"))
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Turns this executor off without touching the other one.
    pub enabled: bool,
    /// Retries after the first attempt.
    pub retry_count: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff: Backoff,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            retry_count: 3,
            base_delay_ms: 100,
            max_delay_ms: 5_000,
            backoff: Backoff::Exponential,
        }
    }
}

impl RetrySettings {
    fn validate(&self, which: &str) -> Result<(), DbError> {
        if self.max_delay_ms < self.base_delay_ms {
            return Err(DbError::Configuration(format!(
                "resilience.{which}.max_delay_ms must be >= base_delay_ms"
            )));
        }
        Ok(())
    }
}

/// Ranges values are clamped to before binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValueBounds {
    pub min_date: NaiveDateTime,
    pub max_date: NaiveDateTime,
    pub decimal_min: f64,
    pub decimal_max: f64,
}

impl Default for ValueBounds {
    fn default() -> Self {
        // SQL Server `datetime` range is the narrowest of the three engines.
        let min_date = NaiveDate::from_ymd_opt(1753, 1, 1)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .unwrap_or(NaiveDateTime::MIN);
        let max_date = NaiveDate::from_ymd_opt(9999, 12, 31)
            .and_then(|d| d.and_hms_milli_opt(23, 59, 59, 997))
            .unwrap_or(NaiveDateTime::MAX);
        Self {
            min_date,
            max_date,
            decimal_min: -79_228_162_514_264_337_593_543_950_335.0,
            decimal_max: 79_228_162_514_264_337_593_543_950_335.0,
        }
    }
}

/// Fluent builder for [`DbOptions`].
#[derive(Debug, Clone)]
pub struct DbOptionsBuilder {
    opts: DbOptions,
}

impl DbOptionsBuilder {
    #[must_use]
    pub fn new(provider: Provider, connection_string: impl Into<String>) -> Self {
        Self {
            opts: DbOptions {
                provider,
                connection_string: connection_string.into(),
                ..DbOptions::default()
            },
        }
    }

    #[must_use]
    pub fn command_pool_capacity(mut self, capacity: usize) -> Self {
        self.opts.command_pool_capacity = capacity;
        self
    }

    #[must_use]
    pub fn parameter_pool_capacity(mut self, capacity: usize) -> Self {
        self.opts.parameter_pool_capacity = capacity;
        self
    }

    #[must_use]
    pub fn command_timeout_secs(mut self, secs: u64) -> Self {
        self.opts.command_timeout_secs = secs;
        self
    }

    #[must_use]
    pub fn wrap_provider_errors(mut self, wrap: bool) -> Self {
        self.opts.wrap_provider_errors = wrap;
        self
    }

    #[must_use]
    pub fn allow_unsafe_provider_types(mut self, allow: bool) -> Self {
        self.opts.allow_unsafe_provider_types = allow;
        self
    }

    #[must_use]
    pub fn resilience_enabled(mut self, enabled: bool) -> Self {
        self.opts.resilience.enabled = enabled;
        self
    }

    #[must_use]
    pub fn command_retries_enabled(mut self, enabled: bool) -> Self {
        self.opts.resilience.command.enabled = enabled;
        self
    }

    #[must_use]
    pub fn transaction_retries_enabled(mut self, enabled: bool) -> Self {
        self.opts.resilience.transaction.enabled = enabled;
        self
    }

    #[must_use]
    pub fn command_retries(mut self, retry_count: u32, base_delay: Duration) -> Self {
        self.opts.resilience.command.retry_count = retry_count;
        self.opts.resilience.command.base_delay_ms = duration_ms(base_delay);
        self.opts.resilience.command.max_delay_ms = self
            .opts
            .resilience
            .command
            .max_delay_ms
            .max(self.opts.resilience.command.base_delay_ms);
        self
    }

    #[must_use]
    pub fn transaction_retries(mut self, retry_count: u32, base_delay: Duration) -> Self {
        self.opts.resilience.transaction.retry_count = retry_count;
        self.opts.resilience.transaction.base_delay_ms = duration_ms(base_delay);
        self.opts.resilience.transaction.max_delay_ms = self
            .opts
            .resilience
            .transaction
            .max_delay_ms
            .max(self.opts.resilience.transaction.base_delay_ms);
        self
    }

    #[must_use]
    pub fn transient_classifier(mut self, classifier: TransientClassifier) -> Self {
        self.opts.resilience.classifier = Some(classifier);
        self
    }

    #[must_use]
    pub fn bounds(mut self, bounds: ValueBounds) -> Self {
        self.opts.bounds = bounds;
        self
    }

    #[must_use]
    pub fn finish(self) -> DbOptions {
        self.opts
    }

    /// Validate and wrap the options for sharing.
    ///
    /// # Errors
    /// Returns `DbError::Configuration` if a setting is invalid.
    pub fn build(self) -> Result<Arc<DbOptions>, DbError> {
        self.opts.validate()?;
        Ok(Arc::new(self.opts))
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate_once_connection_string_is_set() {
        let opts = DbOptions::builder(Provider::SqlServer, "Server=db;").finish();
        assert!(opts.validate().is_ok());
        assert!(DbOptions::default().validate().is_err());
    }

    #[test]
    fn deserializes_partial_documents() {
        let opts: DbOptions = serde_json::from_str(
            r#"{"provider":"mssql","connection_string":"x","resilience":{"command":{"retry_count":5}}}"#,
        )
        .expect("valid options json");
        assert_eq!(opts.provider, Provider::SqlServer);
        assert_eq!(opts.resilience.command.retry_count, 5);
        assert_eq!(opts.resilience.command.base_delay_ms, 100);
        assert!(opts.wrap_provider_errors);
    }

    #[test]
    fn rejects_inverted_bounds() {
        let mut bounds = ValueBounds::default();
        std::mem::swap(&mut bounds.min_date, &mut bounds.max_date);
        let err = DbOptions::builder(Provider::Oracle, "x")
            .bounds(bounds)
            .build()
            .unwrap_err();
        assert!(matches!(err, DbError::Configuration(_)));
    }
}
