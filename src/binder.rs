//! Binds provider-neutral parameter definitions onto a rented provider command.

use lazy_static::lazy_static;
use regex::Regex;

use crate::driver::{ProviderCommand, ProviderParameter};
use crate::error::DbError;
use crate::options::{DbOptions, ValueBounds};
use crate::parameter::ParameterDefinition;
use crate::pool::ObjectPool;
use crate::request::CommandRequest;
use crate::types::{DbType, DbValue, ParameterDirection, Provider};

lazy_static! {
    /// `NAME`, `NAME(n)`, `NAME(p, s)`, optionally followed by `[]`.
    static ref PROVIDER_TYPE: Regex = Regex::new(
        r"^(?P<base>[A-Za-z][A-Za-z0-9_]*(?: [A-Za-z][A-Za-z0-9_]*)*)\s*(?:\(\s*(?:\d+|(?i:max))\s*(?:,\s*\d+\s*)?\))?(?P<array>\[\])?$"
    )
    .expect("static provider type pattern");
}

const SQLSERVER_TYPES: &[&str] = &[
    "BIGINT",
    "BINARY",
    "BIT",
    "CHAR",
    "DATE",
    "DATETIME",
    "DATETIME2",
    "DATETIMEOFFSET",
    "DECIMAL",
    "FLOAT",
    "IMAGE",
    "INT",
    "MONEY",
    "NCHAR",
    "NTEXT",
    "NUMERIC",
    "NVARCHAR",
    "REAL",
    "SMALLDATETIME",
    "SMALLINT",
    "SMALLMONEY",
    "STRUCTURED",
    "TEXT",
    "TIME",
    "TINYINT",
    "UNIQUEIDENTIFIER",
    "VARBINARY",
    "VARCHAR",
    "XML",
];

const POSTGRES_TYPES: &[&str] = &[
    "BIGINT",
    "BOOL",
    "BOOLEAN",
    "BYTEA",
    "CHAR",
    "CHARACTER VARYING",
    "CITEXT",
    "DATE",
    "DECIMAL",
    "DOUBLE PRECISION",
    "FLOAT4",
    "FLOAT8",
    "INT",
    "INT2",
    "INT4",
    "INT8",
    "INTEGER",
    "INTERVAL",
    "JSON",
    "JSONB",
    "NUMERIC",
    "REAL",
    "REFCURSOR",
    "SMALLINT",
    "TEXT",
    "TIME",
    "TIMESTAMP",
    "TIMESTAMPTZ",
    "UUID",
    "VARCHAR",
    "XML",
];

const ORACLE_TYPES: &[&str] = &[
    "ASSOCIATIVEARRAY",
    "BINARY_DOUBLE",
    "BINARY_FLOAT",
    "BLOB",
    "CHAR",
    "CLOB",
    "DATE",
    "DECIMAL",
    "FLOAT",
    "INTEGER",
    "NCHAR",
    "NCLOB",
    "NUMBER",
    "NVARCHAR2",
    "RAW",
    "REF CURSOR",
    "REFCURSOR",
    "TIMESTAMP",
    "VARCHAR2",
    "XMLTYPE",
];

fn allowed_types(provider: Provider) -> &'static [&'static str] {
    match provider {
        Provider::SqlServer => SQLSERVER_TYPES,
        Provider::Postgres => POSTGRES_TYPES,
        Provider::Oracle => ORACLE_TYPES,
    }
}

/// Check a provider-type hint against the provider's allow-list.
///
/// # Errors
/// Returns `DbError::Validation` when the hint is malformed or not allowed.
pub fn sanitize_provider_type(provider: Provider, hint: &str) -> Result<String, DbError> {
    let hint = hint.trim();
    let rejected = || {
        DbError::Validation(format!(
            "provider type '{hint}' is not allowed for {provider}"
        ))
    };
    let captures = PROVIDER_TYPE.captures(hint).ok_or_else(rejected)?;
    let base = captures
        .name("base")
        .map(|m| m.as_str().to_ascii_uppercase())
        .ok_or_else(rejected)?;
    if captures.name("array").is_some() && provider != Provider::Postgres {
        return Err(rejected());
    }
    if allowed_types(provider).contains(&base.as_str()) {
        Ok(hint.to_string())
    } else {
        Err(rejected())
    }
}

/// PostgreSQL element type name used for native array parameters.
fn postgres_element_type(db_type: DbType) -> &'static str {
    match db_type {
        DbType::Text | DbType::Cursor => "text",
        DbType::Int16 => "smallint",
        DbType::Int32 => "integer",
        DbType::Int64 => "bigint",
        DbType::Double => "double precision",
        DbType::Decimal => "numeric",
        DbType::Boolean => "boolean",
        DbType::Date => "date",
        DbType::DateTime => "timestamp",
        DbType::Json => "jsonb",
        DbType::Binary => "bytea",
        DbType::Guid => "uuid",
    }
}

/// Clamp temporal and decimal values into the configured bounds.
#[must_use]
pub fn normalize_value(value: DbValue, db_type: DbType, bounds: &ValueBounds) -> DbValue {
    match value {
        DbValue::Timestamp(ts) => DbValue::Timestamp(ts.clamp(bounds.min_date, bounds.max_date)),
        DbValue::Date(date) => {
            DbValue::Date(date.clamp(bounds.min_date.date(), bounds.max_date.date()))
        }
        DbValue::Decimal(text) => match text.trim().parse::<f64>() {
            Ok(parsed) if parsed < bounds.decimal_min => {
                DbValue::Decimal(bounds.decimal_min.to_string())
            }
            Ok(parsed) if parsed > bounds.decimal_max => {
                DbValue::Decimal(bounds.decimal_max.to_string())
            }
            _ => DbValue::Decimal(text),
        },
        DbValue::Float(float) if db_type == DbType::Decimal => {
            DbValue::Float(float.clamp(bounds.decimal_min, bounds.decimal_max))
        }
        DbValue::Array(values) => DbValue::Array(
            values
                .into_iter()
                .map(|v| normalize_value(v, db_type, bounds))
                .collect(),
        ),
        other => other,
    }
}

fn convert(definition: &ParameterDefinition, value: DbValue) -> Result<DbValue, DbError> {
    match &definition.converter {
        Some(converter) => converter(value),
        None => Ok(value),
    }
}

/// Fill one pooled parameter from its definition.
fn bind_parameter(
    target: &mut ProviderParameter,
    definition: &ParameterDefinition,
    options: &DbOptions,
    provider: Provider,
) -> Result<(), DbError> {
    target.name.push_str(provider.parameter_prefix());
    target.name.push_str(&definition.name);
    target.db_type = definition.db_type;
    target.direction = definition.direction;
    target.size = definition.size;
    target.precision = definition.precision;
    target.scale = definition.scale;
    target.nullable = definition.nullable;

    let unsafe_ok = definition.allow_unsafe_provider_type || options.allow_unsafe_provider_types;
    target.provider_type = match definition.provider_type.as_deref() {
        Some(hint) if unsafe_ok => Some(hint.to_string()),
        Some(hint) => Some(sanitize_provider_type(provider, hint)?),
        None => None,
    };

    if definition.is_list {
        let mut elements = Vec::with_capacity(definition.list_values.len());
        for element in &definition.list_values {
            let converted = convert(definition, element.clone())?;
            elements.push(normalize_value(converted, definition.db_type, &options.bounds));
        }
        match provider {
            Provider::Postgres => {
                if target.provider_type.is_none() {
                    target.provider_type =
                        Some(format!("{}[]", postgres_element_type(definition.db_type)));
                }
            }
            Provider::SqlServer => {
                // A caller hint names the table type.
                if target.provider_type.is_none() {
                    target.provider_type = Some("Structured".to_string());
                }
            }
            Provider::Oracle => {
                target.provider_type = Some("AssociativeArray".to_string());
                target.size = u32::try_from(elements.len()).ok();
            }
        }
        target.value = DbValue::Array(elements);
        return Ok(());
    }

    target.value = match definition.direction {
        ParameterDirection::Input | ParameterDirection::InputOutput => {
            let converted = convert(definition, definition.effective_value())?;
            normalize_value(converted, definition.db_type, &options.bounds)
        }
        ParameterDirection::Output | ParameterDirection::ReturnValue => DbValue::Null,
    };
    Ok(())
}

/// Bind `request` onto `command`, taking parameters from `parameters`.
///
/// # Errors
/// Returns `DbError::Validation` for a disallowed provider type, or the converter's
/// error.
pub(crate) fn bind(
    command: &mut ProviderCommand,
    request: &CommandRequest,
    options: &DbOptions,
    provider: Provider,
    parameters: &ObjectPool<ProviderParameter>,
) -> Result<(), DbError> {
    command.text.clone_from(&request.text);
    command.kind = request.kind;
    command.behavior = request.behavior;
    command.timeout = request.timeout.or_else(|| options.command_timeout());
    command.parameters.reserve(request.parameters.len());
    for definition in &request.parameters {
        // Pushed before binding so a failure still returns it to the pool.
        command
            .parameters
            .push(parameters.rent(ProviderParameter::default));
        if let Some(target) = command.parameters.last_mut() {
            bind_parameter(target, definition, options, provider)?;
        }
    }
    Ok(())
}
