use std::fmt;
use std::sync::Arc;

use lazy_static::lazy_static;
use regex::Regex;

use crate::error::DbError;
use crate::types::{DbType, DbValue, ParameterDirection, trim_parameter_prefix};

/// Converts a caller value before it is normalized and bound.
pub type ValueConverter = Arc<dyn Fn(DbValue) -> Result<DbValue, DbError> + Send + Sync>;

lazy_static! {
    static ref PARAMETER_NAME: Regex =
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("static parameter name pattern");
}

/// Provider-neutral description of one command parameter.
///
/// ```rust
/// use sqlbridge::prelude::*;
///
/// let status = ParameterDefinition::output("p_status", DbType::Text).with_size(32);
/// let id = ParameterDefinition::input("p_id", 42);
/// # let _ = (status, id);
/// ```
#[derive(Clone)]
pub struct ParameterDefinition {
    pub name: String,
    pub db_type: DbType,
    pub direction: ParameterDirection,
    pub size: Option<u32>,
    pub precision: Option<u8>,
    pub scale: Option<u8>,
    pub nullable: bool,
    pub value: DbValue,
    pub default_value: Option<DbValue>,
    pub provider_type: Option<String>,
    pub allow_unsafe_provider_type: bool,
    /// Bind as an array / table-valued / associative-array parameter.
    pub is_list: bool,
    pub list_values: Vec<DbValue>,
    pub converter: Option<ValueConverter>,
}

impl fmt::Debug for ParameterDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParameterDefinition")
            .field("name", &self.name)
            .field("db_type", &self.db_type)
            .field("direction", &self.direction)
            .field("size", &self.size)
            .field("precision", &self.precision)
            .field("scale", &self.scale)
            .field("nullable", &self.nullable)
            .field("value", &self.value)
            .field("provider_type", &self.provider_type)
            .field("is_list", &self.is_list)
            .field("list_len", &self.list_values.len())
            .field("converter", &self.converter.as_ref().map(|_| "<fn>"))
            .finish_non_exhaustive()
    }
}

impl ParameterDefinition {
    #[must_use]
    pub fn new(name: impl Into<String>, db_type: DbType, direction: ParameterDirection) -> Self {
        Self {
            name: trim_parameter_prefix(&name.into()).to_string(),
            db_type,
            direction,
            size: None,
            precision: None,
            scale: None,
            nullable: true,
            value: DbValue::Null,
            default_value: None,
            provider_type: None,
            allow_unsafe_provider_type: false,
            is_list: false,
            list_values: Vec::new(),
            converter: None,
        }
    }

    /// Input parameter; the logical type is inferred from the value.
    #[must_use]
    pub fn input(name: impl Into<String>, value: impl Into<DbValue>) -> Self {
        let value = value.into();
        let mut param = Self::new(name, infer_type(&value), ParameterDirection::Input);
        param.value = value;
        param
    }

    #[must_use]
    pub fn output(name: impl Into<String>, db_type: DbType) -> Self {
        Self::new(name, db_type, ParameterDirection::Output)
    }

    #[must_use]
    pub fn input_output(name: impl Into<String>, value: impl Into<DbValue>) -> Self {
        let value = value.into();
        let mut param = Self::new(name, infer_type(&value), ParameterDirection::InputOutput);
        param.value = value;
        param
    }

    #[must_use]
    pub fn return_value(name: impl Into<String>, db_type: DbType) -> Self {
        Self::new(name, db_type, ParameterDirection::ReturnValue)
    }

    /// Output parameter carrying a server-side cursor.
    #[must_use]
    pub fn cursor(name: impl Into<String>) -> Self {
        Self::new(name, DbType::Cursor, ParameterDirection::Output)
    }

    /// List parameter; `element_type` describes each element.
    #[must_use]
    pub fn list(
        name: impl Into<String>,
        element_type: DbType,
        values: impl IntoIterator<Item = DbValue>,
    ) -> Self {
        let mut param = Self::new(name, element_type, ParameterDirection::Input);
        param.is_list = true;
        param.list_values = values.into_iter().collect();
        param
    }

    #[must_use]
    pub fn with_type(mut self, db_type: DbType) -> Self {
        self.db_type = db_type;
        self
    }

    #[must_use]
    pub fn with_value(mut self, value: impl Into<DbValue>) -> Self {
        self.value = value.into();
        self
    }

    #[must_use]
    pub fn with_default(mut self, value: impl Into<DbValue>) -> Self {
        self.default_value = Some(value.into());
        self
    }

    #[must_use]
    pub fn with_size(mut self, size: u32) -> Self {
        self.size = Some(size);
        self
    }

    #[must_use]
    pub fn with_precision(mut self, precision: u8, scale: u8) -> Self {
        self.precision = Some(precision);
        self.scale = (scale > 0).then_some(scale);
        self
    }

    #[must_use]
    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// Provider-native type name; checked against the provider allow-list when bound.
    #[must_use]
    pub fn with_provider_type(mut self, provider_type: impl Into<String>) -> Self {
        self.provider_type = Some(provider_type.into());
        self
    }

    /// Bind the provider-type hint verbatim, skipping the allow-list.
    #[must_use]
    pub fn allow_unsafe_provider_type(mut self) -> Self {
        self.allow_unsafe_provider_type = true;
        self
    }

    #[must_use]
    pub fn with_converter(mut self, converter: ValueConverter) -> Self {
        self.converter = Some(converter);
        self
    }

    /// Name compared case-insensitively against column and provider parameter names.
    #[must_use]
    pub fn matches_name(&self, other: &str) -> bool {
        self.name.eq_ignore_ascii_case(trim_parameter_prefix(other))
    }

    /// Value sent to the server: the explicit value, else the default.
    #[must_use]
    pub fn effective_value(&self) -> DbValue {
        match (&self.value, &self.default_value) {
            (DbValue::Null, Some(default)) => default.clone(),
            (value, _) => value.clone(),
        }
    }

    /// Check the definition's own invariants.
    ///
    /// # Errors
    /// Returns `DbError::Validation` describing the first violation.
    pub fn validate(&self) -> Result<(), DbError> {
        if !PARAMETER_NAME.is_match(&self.name) {
            return Err(DbError::Validation(format!(
                "invalid parameter name '{}'",
                self.name
            )));
        }
        if self.is_list && self.list_values.is_empty() {
            return Err(DbError::Validation(format!(
                "list parameter '{}' must carry values",
                self.name
            )));
        }
        if self.is_list && self.direction != ParameterDirection::Input {
            return Err(DbError::Validation(format!(
                "list parameter '{}' must be an input parameter",
                self.name
            )));
        }
        if self.size == Some(0) {
            return Err(DbError::Validation(format!(
                "parameter '{}' size must be positive",
                self.name
            )));
        }
        if self.precision == Some(0) {
            return Err(DbError::Validation(format!(
                "parameter '{}' precision must be positive",
                self.name
            )));
        }
        if self.scale == Some(0) {
            return Err(DbError::Validation(format!(
                "parameter '{}' scale must be positive",
                self.name
            )));
        }
        if let (Some(precision), Some(scale)) = (self.precision, self.scale)
            && scale > precision
        {
            return Err(DbError::Validation(format!(
                "parameter '{}' scale {scale} exceeds precision {precision}",
                self.name
            )));
        }
        if !self.nullable && self.direction.is_input() && self.effective_value().is_null() {
            return Err(DbError::Validation(format!(
                "parameter '{}' is not nullable but has no value",
                self.name
            )));
        }
        Ok(())
    }
}

fn infer_type(value: &DbValue) -> DbType {
    match value {
        DbValue::Int(_) => DbType::Int64,
        DbValue::Float(_) => DbType::Double,
        DbValue::Decimal(_) => DbType::Decimal,
        DbValue::Bool(_) => DbType::Boolean,
        DbValue::Timestamp(_) => DbType::DateTime,
        DbValue::Date(_) => DbType::Date,
        DbValue::Json(_) => DbType::Json,
        DbValue::Blob(_) => DbType::Binary,
        DbValue::Array(values) => values.first().map_or(DbType::Text, infer_type),
        DbValue::Text(_) | DbValue::Null => DbType::Text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_is_stripped_on_construction() {
        let p = ParameterDefinition::input("@p_id", 1);
        assert_eq!(p.name, "p_id");
        assert!(p.matches_name(":P_ID"));
        assert_eq!(p.db_type, DbType::Int64);
    }

    #[test]
    fn list_without_values_is_rejected() {
        let p = ParameterDefinition::list("ids", DbType::Int64, Vec::new());
        assert!(matches!(p.validate(), Err(DbError::Validation(_))));
    }

    #[test]
    fn zero_size_or_precision_is_rejected() {
        assert!(ParameterDefinition::output("a", DbType::Text).with_size(0).validate().is_err());
        assert!(
            ParameterDefinition::output("a", DbType::Decimal)
                .with_precision(0, 0)
                .validate()
                .is_err()
        );
        assert!(
            ParameterDefinition::output("a", DbType::Decimal)
                .with_precision(10, 2)
                .validate()
                .is_ok()
        );
    }

    #[test]
    fn default_value_fills_null() {
        let p = ParameterDefinition::new("a", DbType::Int32, ParameterDirection::Input)
            .with_default(7)
            .not_null();
        assert_eq!(p.effective_value(), DbValue::Int(7));
        assert!(p.validate().is_ok());
    }
}
