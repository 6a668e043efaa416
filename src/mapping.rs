//! Row projection.
//!
//! `Database::query` accepts any closure over [`DataRow`]; types that always map the same
//! way implement [`FromRow`] and use `Database::query_as`.

use crate::error::DbError;
use crate::results::DataRow;
use crate::types::DbValue;

/// Build a value from one result row.
///
/// ```rust
/// use sqlbridge::prelude::*;
///
/// struct Order {
///     id: i64,
///     status: String,
/// }
///
/// impl FromRow for Order {
///     fn from_row(row: &DataRow) -> Result<Self, DbError> {
///         Ok(Order {
///             id: row.require("id")?.as_int().unwrap_or_default(),
///             status: row.require("status")?.as_text().unwrap_or_default().to_string(),
///         })
///     }
/// }
/// ```
pub trait FromRow: Sized {
    /// # Errors
    /// Returns `DbError::Mapping` when the row does not have the expected shape.
    fn from_row(row: &DataRow) -> Result<Self, DbError>;
}

impl FromRow for DataRow {
    fn from_row(row: &DataRow) -> Result<Self, DbError> {
        Ok(row.clone())
    }
}

impl FromRow for Vec<DbValue> {
    fn from_row(row: &DataRow) -> Result<Self, DbError> {
        Ok(row.values().to_vec())
    }
}

/// First column of the row.
impl FromRow for DbValue {
    fn from_row(row: &DataRow) -> Result<Self, DbError> {
        row.get_by_index(0)
            .cloned()
            .ok_or_else(|| DbError::Mapping("row has no columns".to_string()))
    }
}

macro_rules! first_column {
    ($ty:ty, $accessor:ident, $what:literal) => {
        impl FromRow for $ty {
            fn from_row(row: &DataRow) -> Result<Self, DbError> {
                let value = DbValue::from_row(row)?;
                value.$accessor().map(Into::into).ok_or_else(|| {
                    DbError::Mapping(format!(concat!("expected ", $what, ", found {:?}"), value))
                })
            }
        }
    };
}

first_column!(i64, as_int, "an integer");
first_column!(f64, as_float, "a number");
first_column!(bool, as_bool, "a boolean");
first_column!(String, as_text, "text");

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::results::Columns;

    #[test]
    fn scalars_map_from_the_first_column() {
        let row = DataRow::new(
            Columns::new(Arc::new(vec!["n".into(), "label".into()])),
            vec![DbValue::Int(7), DbValue::Text("seven".into())],
        );
        assert_eq!(i64::from_row(&row).unwrap(), 7);
        assert!(matches!(String::from_row(&row), Err(DbError::Mapping(_))));
        assert_eq!(Vec::<DbValue>::from_row(&row).unwrap().len(), 2);
    }
}
