//! PostgreSQL driver over `deadpool-postgres` / `tokio-postgres`.
//!
//! Commands carry neutral `@name` markers; they are rewritten to `$n` before preparing.
//! Stored procedures run as `SELECT * FROM name($1, ...)`.

mod config;
mod connection;
mod params;
mod query;

pub use config::PostgresFactory;
pub use connection::PostgresConnection;
pub use query::PostgresReader;
