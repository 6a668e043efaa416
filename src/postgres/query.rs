use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use futures_util::StreamExt;
use serde_json::Value;
use tokio_postgres::types::Type;
use tokio_postgres::{Row, RowStream};

use crate::driver::RowReader;
use crate::error::DriverError;
use crate::types::DbValue;

use super::params::NumericText;

/// Rows of one `query_raw` call, pulled from the server as they are read.
pub struct PostgresReader {
    columns: Arc<Vec<String>>,
    stream: Pin<Box<RowStream>>,
    finished: bool,
    rows_affected: Option<u64>,
}

impl PostgresReader {
    pub(super) fn new(columns: Arc<Vec<String>>, stream: RowStream) -> Self {
        Self {
            columns,
            stream: Box::pin(stream),
            finished: false,
            rows_affected: None,
        }
    }
}

#[async_trait]
impl RowReader for PostgresReader {
    fn columns(&self) -> Arc<Vec<String>> {
        Arc::clone(&self.columns)
    }

    async fn next_row(&mut self) -> Result<Option<Vec<DbValue>>, DriverError> {
        if self.finished {
            return Ok(None);
        }
        match self.stream.next().await {
            Some(row) => {
                let row = row?;
                let mut values = Vec::with_capacity(row.len());
                for idx in 0..row.len() {
                    values.push(extract_value(&row, idx)?);
                }
                Ok(Some(values))
            }
            None => {
                self.finished = true;
                self.rows_affected = self.stream.rows_affected();
                Ok(None)
            }
        }
    }

    async fn next_result(&mut self) -> Result<bool, DriverError> {
        Ok(false)
    }

    fn records_affected(&self) -> Option<u64> {
        self.rows_affected
    }
}

fn array_of<T>(values: Option<Vec<Option<T>>>, convert: impl Fn(T) -> DbValue) -> Option<DbValue> {
    values.map(|items| {
        DbValue::Array(
            items
                .into_iter()
                .map(|item| item.map_or(DbValue::Null, &convert))
                .collect(),
        )
    })
}

/// Read column `idx` of `row` into a [`DbValue`] according to its server type.
///
/// Unknown types are read as text.
///
/// # Errors
/// Returns the driver error raised while decoding the column.
pub(super) fn extract_value(row: &Row, idx: usize) -> Result<DbValue, DriverError> {
    let ty = row.columns()[idx].type_().clone();
    let value = match ty {
        Type::INT2 => row
            .try_get::<_, Option<i16>>(idx)?
            .map(|v| DbValue::Int(i64::from(v))),
        Type::INT4 => row
            .try_get::<_, Option<i32>>(idx)?
            .map(|v| DbValue::Int(i64::from(v))),
        Type::INT8 => row.try_get::<_, Option<i64>>(idx)?.map(DbValue::Int),
        Type::FLOAT4 => row
            .try_get::<_, Option<f32>>(idx)?
            .map(|v| DbValue::Float(f64::from(v))),
        Type::FLOAT8 => row.try_get::<_, Option<f64>>(idx)?.map(DbValue::Float),
        Type::NUMERIC => row
            .try_get::<_, Option<NumericText>>(idx)?
            .map(|n| DbValue::Decimal(n.0)),
        Type::BOOL => row.try_get::<_, Option<bool>>(idx)?.map(DbValue::Bool),
        Type::TIMESTAMP => row
            .try_get::<_, Option<NaiveDateTime>>(idx)?
            .map(DbValue::Timestamp),
        Type::TIMESTAMPTZ => row
            .try_get::<_, Option<DateTime<Utc>>>(idx)?
            .map(|v| DbValue::Timestamp(v.naive_utc())),
        Type::DATE => row.try_get::<_, Option<NaiveDate>>(idx)?.map(DbValue::Date),
        Type::JSON | Type::JSONB => row.try_get::<_, Option<Value>>(idx)?.map(DbValue::Json),
        Type::BYTEA => row.try_get::<_, Option<Vec<u8>>>(idx)?.map(DbValue::Blob),
        Type::INT4_ARRAY => array_of(row.try_get::<_, Option<Vec<Option<i32>>>>(idx)?, |v| {
            DbValue::Int(i64::from(v))
        }),
        Type::INT8_ARRAY => array_of(
            row.try_get::<_, Option<Vec<Option<i64>>>>(idx)?,
            DbValue::Int,
        ),
        Type::TEXT_ARRAY | Type::VARCHAR_ARRAY => array_of(
            row.try_get::<_, Option<Vec<Option<String>>>>(idx)?,
            DbValue::Text,
        ),
        _ => row.try_get::<_, Option<String>>(idx)?.map(DbValue::Text),
    };
    Ok(value.unwrap_or(DbValue::Null))
}
