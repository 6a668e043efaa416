//! SQL Server driver over tiberius.
//!
//! Commands bind their inputs as `@P1..@Pn`. Output, input/output and return-value
//! parameters are declared as batch variables and read back from a trailing select.
//! Result sets are buffered before they are handed to the caller.

mod config;
mod connection;
mod params;
mod query;

pub use config::{MssqlFactory, MssqlManager};
pub use connection::MssqlConnection;
