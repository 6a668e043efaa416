//! Scripted in-memory driver for tests.
//!
//! Enabled by the `test-utils` feature. [`MockFactory`] hands out connections that record
//! every call into a shared log and answer commands from a queue of [`MockReply`]s, so
//! tests can assert exactly which physical operations the core performed.

mod mock;

use std::sync::Arc;
use std::time::Duration;

pub use mock::{MockCommand, MockConnection, MockEvent, MockFactory, MockOp, MockReply};

use crate::error::DbError;
use crate::executor::Database;
use crate::options::{DbOptions, DbOptionsBuilder};
use crate::types::Provider;

/// Options tuned for tests: millisecond backoff and a placeholder connection string.
#[must_use]
pub fn test_options(provider: Provider) -> DbOptionsBuilder {
    DbOptions::builder(provider, "mock://test")
        .command_retries(2, Duration::from_millis(1))
        .transaction_retries(1, Duration::from_millis(1))
}

/// A [`Database`] over a fresh [`MockFactory`].
///
/// # Errors
/// Returns `DbError::Configuration` if the options do not validate.
pub fn mock_database(
    builder: DbOptionsBuilder,
) -> Result<(Database, Arc<MockFactory>), DbError> {
    let options = builder.build()?;
    let factory = Arc::new(MockFactory::new(options.provider));
    let db = Database::new(options, factory.clone())?;
    Ok((db, factory))
}
