use std::fmt;

use chrono::{NaiveDate, NaiveDateTime};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Values that can be bound as parameters or read back from a row.
///
/// The same enum is used for every provider so calling code never branches on driver
/// types:
/// ```rust
/// use sqlbridge::prelude::*;
///
/// let values = vec![
///     DbValue::Int(1),
///     DbValue::Text("alice".into()),
///     DbValue::Bool(true),
/// ];
/// # let _ = values;
/// ```
#[derive(Debug, Clone, PartialEq, Default)]
pub enum DbValue {
    /// Integer value (64-bit)
    Int(i64),
    /// Floating point value (64-bit)
    Float(f64),
    /// Exact numeric carried as its decimal text form.
    Decimal(String),
    /// Text/string value
    Text(String),
    /// Boolean value
    Bool(bool),
    /// Timestamp value
    Timestamp(NaiveDateTime),
    /// Calendar date
    Date(NaiveDate),
    /// NULL value
    #[default]
    Null,
    /// JSON value
    Json(JsonValue),
    /// Binary data
    Blob(Vec<u8>),
    /// Ordered collection bound as an array / table-valued / associative-array parameter.
    Array(Vec<DbValue>),
}

impl DbValue {
    /// Check if this value is NULL
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            DbValue::Int(value) => Some(*value),
            DbValue::Decimal(text) => text.parse().ok(),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            DbValue::Text(value) | DbValue::Decimal(value) => Some(value),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            DbValue::Bool(value) => Some(*value),
            DbValue::Int(1) => Some(true),
            DbValue::Int(0) => Some(false),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_float(&self) -> Option<f64> {
        match self {
            DbValue::Float(value) => Some(*value),
            #[allow(clippy::cast_precision_loss)]
            DbValue::Int(value) => Some(*value as f64),
            DbValue::Decimal(text) => text.parse().ok(),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_timestamp(&self) -> Option<NaiveDateTime> {
        match self {
            DbValue::Timestamp(value) => Some(*value),
            DbValue::Date(date) => date.and_hms_opt(0, 0, 0),
            DbValue::Text(s) => NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
                .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f"))
                .ok(),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_blob(&self) -> Option<&[u8]> {
        if let DbValue::Blob(bytes) = self {
            Some(bytes)
        } else {
            None
        }
    }

    #[must_use]
    pub fn as_array(&self) -> Option<&[DbValue]> {
        if let DbValue::Array(values) = self {
            Some(values)
        } else {
            None
        }
    }

    /// Bytes and characters this value contributes to streaming metrics.
    #[must_use]
    pub(crate) fn payload_size(&self) -> (u64, u64) {
        match self {
            DbValue::Blob(bytes) => (bytes.len() as u64, 0),
            DbValue::Text(text) | DbValue::Decimal(text) => (0, text.chars().count() as u64),
            DbValue::Json(json) => (0, json.to_string().chars().count() as u64),
            DbValue::Array(values) => values.iter().fold((0, 0), |(b, c), v| {
                let (vb, vc) = v.payload_size();
                (b + vb, c + vc)
            }),
            _ => (0, 0),
        }
    }
}

impl From<i64> for DbValue {
    fn from(value: i64) -> Self {
        DbValue::Int(value)
    }
}

impl From<i32> for DbValue {
    fn from(value: i32) -> Self {
        DbValue::Int(i64::from(value))
    }
}

impl From<f64> for DbValue {
    fn from(value: f64) -> Self {
        DbValue::Float(value)
    }
}

impl From<bool> for DbValue {
    fn from(value: bool) -> Self {
        DbValue::Bool(value)
    }
}

impl From<&str> for DbValue {
    fn from(value: &str) -> Self {
        DbValue::Text(value.to_string())
    }
}

impl From<String> for DbValue {
    fn from(value: String) -> Self {
        DbValue::Text(value)
    }
}

impl From<NaiveDateTime> for DbValue {
    fn from(value: NaiveDateTime) -> Self {
        DbValue::Timestamp(value)
    }
}

impl<T: Into<DbValue>> From<Option<T>> for DbValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(DbValue::Null, Into::into)
    }
}

/// The database engines this crate normalizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// Microsoft SQL Server
    #[value(alias = "mssql")]
    #[serde(alias = "mssql")]
    SqlServer,
    /// `PostgreSQL`
    #[value(alias = "postgresql")]
    #[serde(alias = "postgresql")]
    Postgres,
    /// Oracle Database
    Oracle,
}

impl Provider {
    /// Prefix the provider expects on bound parameter names.
    #[must_use]
    pub fn parameter_prefix(self) -> &'static str {
        match self {
            Provider::SqlServer => "@",
            Provider::Postgres => "",
            Provider::Oracle => ":",
        }
    }

    /// Drivers for this provider run their async entry points synchronously; calls are
    /// routed to the `*_sync` driver methods instead.
    #[must_use]
    pub fn prefers_sync_path(self) -> bool {
        matches!(self, Provider::Oracle)
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Provider::SqlServer => "sqlserver",
            Provider::Postgres => "postgres",
            Provider::Oracle => "oracle",
        })
    }
}

/// Strip any provider prefix (`@`, `:`, `?`) from a parameter name.
#[must_use]
pub fn trim_parameter_prefix(name: &str) -> &str {
    name.trim_start_matches(['@', ':', '?'])
}

/// Provider-neutral logical type of a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DbType {
    #[default]
    Text,
    Int16,
    Int32,
    Int64,
    Double,
    Decimal,
    Boolean,
    Date,
    DateTime,
    Json,
    Binary,
    Guid,
    /// Server-side cursor handle (Oracle REF CURSOR, PostgreSQL `refcursor`).
    Cursor,
}

impl DbType {
    #[must_use]
    pub fn is_temporal(self) -> bool {
        matches!(self, DbType::Date | DbType::DateTime)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ParameterDirection {
    #[default]
    Input,
    Output,
    InputOutput,
    ReturnValue,
}

impl ParameterDirection {
    /// True for every direction whose value comes back from the server.
    #[must_use]
    pub fn is_output(self) -> bool {
        !matches!(self, ParameterDirection::Input)
    }

    /// True for directions whose value is sent to the server.
    #[must_use]
    pub fn is_input(self) -> bool {
        matches!(
            self,
            ParameterDirection::Input | ParameterDirection::InputOutput
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum IsolationLevel {
    /// Use the server default.
    #[default]
    Unspecified,
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
    Snapshot,
}

impl IsolationLevel {
    /// Isolation clause for the given provider, or `None` to keep the server default.
    ///
    /// Oracle only knows READ COMMITTED and SERIALIZABLE; other levels map to the
    /// nearest stronger one. PostgreSQL treats SNAPSHOT as REPEATABLE READ.
    #[must_use]
    pub fn to_sql(self, provider: Provider) -> Option<&'static str> {
        match (self, provider) {
            (IsolationLevel::Unspecified, _) => None,
            (IsolationLevel::ReadUncommitted | IsolationLevel::ReadCommitted, Provider::Oracle) => {
                Some("READ COMMITTED")
            }
            (_, Provider::Oracle) => Some("SERIALIZABLE"),
            (IsolationLevel::Snapshot, Provider::Postgres) => Some("REPEATABLE READ"),
            (IsolationLevel::Snapshot, Provider::SqlServer) => Some("SNAPSHOT"),
            (IsolationLevel::ReadUncommitted, _) => Some("READ UNCOMMITTED"),
            (IsolationLevel::ReadCommitted, _) => Some("READ COMMITTED"),
            (IsolationLevel::RepeatableRead, _) => Some("REPEATABLE READ"),
            (IsolationLevel::Serializable, _) => Some("SERIALIZABLE"),
        }
    }
}
