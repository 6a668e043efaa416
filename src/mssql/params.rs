use std::borrow::Cow;

use serde_json::Value;
use tiberius::{ColumnData, ToSql};

use crate::driver::ProviderParameter;
use crate::error::DriverError;
use crate::types::{DbType, DbValue, Provider};

impl ToSql for DbValue {
    fn to_sql(&self) -> ColumnData<'_> {
        match self {
            DbValue::Int(i) => ColumnData::I64(Some(*i)),
            DbValue::Float(f) => ColumnData::F64(Some(*f)),
            DbValue::Decimal(text) | DbValue::Text(text) => {
                ColumnData::String(Some(Cow::from(text.as_str())))
            }
            DbValue::Bool(b) => ColumnData::Bit(Some(*b)),
            DbValue::Timestamp(ts) => ts.to_sql(),
            DbValue::Date(date) => date.to_sql(),
            DbValue::Null => ColumnData::String(None),
            DbValue::Json(json) => ColumnData::String(Some(Cow::from(json.to_string()))),
            DbValue::Blob(bytes) => ColumnData::Binary(Some(Cow::from(bytes.as_slice()))),
            // Collections travel as a JSON array for OPENJSON on the server side.
            DbValue::Array(values) => {
                ColumnData::String(Some(Cow::from(array_json(values).to_string())))
            }
        }
    }
}

fn array_json(values: &[DbValue]) -> Value {
    Value::Array(values.iter().map(json_value).collect())
}

fn json_value(value: &DbValue) -> Value {
    match value {
        DbValue::Int(i) => Value::from(*i),
        DbValue::Float(f) => Value::from(*f),
        DbValue::Decimal(text) | DbValue::Text(text) => Value::from(text.as_str()),
        DbValue::Bool(b) => Value::from(*b),
        DbValue::Timestamp(ts) => Value::from(ts.format("%Y-%m-%dT%H:%M:%S%.f").to_string()),
        DbValue::Date(date) => Value::from(date.format("%Y-%m-%d").to_string()),
        DbValue::Null => Value::Null,
        DbValue::Json(json) => json.clone(),
        DbValue::Blob(bytes) => Value::from(bytes.clone()),
        DbValue::Array(values) => array_json(values),
    }
}

/// T-SQL type used to declare the local variable backing an output parameter.
pub(super) fn declared_type(param: &ProviderParameter) -> Result<String, DriverError> {
    if let Some(provider_type) = &param.provider_type {
        return Ok(provider_type.clone());
    }
    let sized = |base: &str| match param.size {
        Some(size) if size > 0 && size <= 4000 => format!("{base}({size})"),
        _ => format!("{base}(MAX)"),
    };
    Ok(match param.db_type {
        DbType::Text | DbType::Json => sized("NVARCHAR"),
        DbType::Binary => sized("VARBINARY"),
        DbType::Int16 => "SMALLINT".to_string(),
        DbType::Int32 => "INT".to_string(),
        DbType::Int64 => "BIGINT".to_string(),
        DbType::Double => "FLOAT".to_string(),
        DbType::Decimal => format!(
            "DECIMAL({}, {})",
            param.precision.unwrap_or(38),
            param.scale.unwrap_or(10)
        ),
        DbType::Boolean => "BIT".to_string(),
        DbType::Date => "DATE".to_string(),
        DbType::DateTime => "DATETIME2".to_string(),
        DbType::Guid => "UNIQUEIDENTIFIER".to_string(),
        DbType::Cursor => {
            return Err(DriverError::unsupported("cursor parameters on SQL Server")
                .with_provider(Provider::SqlServer));
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn declared_types_follow_size_and_precision() {
        let mut param = ProviderParameter {
            name: "@name".into(),
            db_type: DbType::Text,
            size: Some(50),
            ..ProviderParameter::default()
        };
        assert_eq!(declared_type(&param).unwrap(), "NVARCHAR(50)");
        param.size = None;
        assert_eq!(declared_type(&param).unwrap(), "NVARCHAR(MAX)");
        param.db_type = DbType::Decimal;
        param.precision = Some(18);
        param.scale = Some(2);
        assert_eq!(declared_type(&param).unwrap(), "DECIMAL(18, 2)");
        param.provider_type = Some("MONEY".into());
        assert_eq!(declared_type(&param).unwrap(), "MONEY");
    }

    #[test]
    fn arrays_bind_as_json_text() {
        let value = DbValue::Array(vec![DbValue::Int(1), DbValue::Text("a".into()), DbValue::Null]);
        match value.to_sql() {
            ColumnData::String(Some(text)) => assert_eq!(text, r#"[1,"a",null]"#),
            other => panic!("unexpected column data {other:?}"),
        }
    }
}
