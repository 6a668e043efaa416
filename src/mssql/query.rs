use std::sync::Arc;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use futures_util::TryStreamExt;
use tiberius::{ColumnData, FromSql, QueryItem, QueryStream, Row};

use crate::driver::BufferedResult;
use crate::error::DriverError;
use crate::types::DbValue;

/// Drain a query stream into memory, one [`BufferedResult`] per result set.
///
/// Result sets without rows keep their column names.
pub(super) async fn collect_results(
    stream: QueryStream<'_>,
) -> Result<Vec<BufferedResult>, DriverError> {
    let mut stream = Box::pin(stream);
    let mut results: Vec<BufferedResult> = Vec::new();
    while let Some(item) = stream.try_next().await? {
        match item {
            QueryItem::Metadata(meta) => {
                let columns = meta.columns().iter().map(|c| c.name().to_string()).collect();
                results.push(BufferedResult::new(columns, Vec::new()));
            }
            QueryItem::Row(row) => {
                let values = row_values(&row)?;
                match results.last_mut() {
                    Some(current) => current.rows.push_back(values),
                    None => {
                        let columns: Vec<String> =
                            row.columns().iter().map(|c| c.name().to_string()).collect();
                        results.push(BufferedResult {
                            columns: Arc::new(columns),
                            rows: vec![values].into(),
                        });
                    }
                }
            }
        }
    }
    Ok(results)
}

pub(super) fn row_values(row: &Row) -> Result<Vec<DbValue>, DriverError> {
    row.cells().map(|(_, data)| column_value(data)).collect()
}

/// Convert one TDS value into a [`DbValue`].
pub(super) fn column_value(data: &ColumnData<'static>) -> Result<DbValue, DriverError> {
    let value = match data {
        ColumnData::U8(v) => v.map(|v| DbValue::Int(i64::from(v))),
        ColumnData::I16(v) => v.map(|v| DbValue::Int(i64::from(v))),
        ColumnData::I32(v) => v.map(|v| DbValue::Int(i64::from(v))),
        ColumnData::I64(v) => v.map(DbValue::Int),
        ColumnData::F32(v) => v.map(|v| DbValue::Float(f64::from(v))),
        ColumnData::F64(v) => v.map(DbValue::Float),
        ColumnData::Bit(v) => v.map(DbValue::Bool),
        ColumnData::String(v) => v.as_ref().map(|s| DbValue::Text(s.to_string())),
        ColumnData::Guid(v) => v.map(|g| DbValue::Text(g.to_string())),
        ColumnData::Binary(v) => v.as_ref().map(|b| DbValue::Blob(b.to_vec())),
        ColumnData::Numeric(v) => v.map(|n| DbValue::Decimal(n.to_string())),
        ColumnData::Date(_) => NaiveDate::from_sql(data)?.map(DbValue::Date),
        ColumnData::Time(_) => NaiveTime::from_sql(data)?.map(|t| DbValue::Text(t.to_string())),
        ColumnData::DateTime(_) | ColumnData::SmallDateTime(_) | ColumnData::DateTime2(_) => {
            NaiveDateTime::from_sql(data)?.map(DbValue::Timestamp)
        }
        ColumnData::DateTimeOffset(_) => {
            DateTime::<Utc>::from_sql(data)?.map(|v| DbValue::Timestamp(v.naive_utc()))
        }
        ColumnData::Xml(v) => v.as_ref().map(|xml| DbValue::Text(xml.to_string())),
    };
    Ok(value.unwrap_or(DbValue::Null))
}

#[cfg(test)]
mod tests {
    use std::borrow::Cow;

    use super::*;

    #[test]
    fn converts_scalar_column_data() {
        assert_eq!(column_value(&ColumnData::I32(Some(7))).unwrap(), DbValue::Int(7));
        assert_eq!(column_value(&ColumnData::Bit(None)).unwrap(), DbValue::Null);
        assert_eq!(
            column_value(&ColumnData::String(Some(Cow::Owned("x".into())))).unwrap(),
            DbValue::Text("x".into())
        );
    }
}
