use std::collections::HashMap;
use std::sync::Arc;

use crate::error::DbError;
use crate::types::DbValue;

/// Column names of one result set plus a case-insensitive lookup, shared by its rows.
#[derive(Debug, Default)]
pub struct Columns {
    names: Arc<Vec<String>>,
    lookup: HashMap<String, usize>,
}

impl Columns {
    #[must_use]
    pub fn new(names: Arc<Vec<String>>) -> Arc<Self> {
        let mut lookup = HashMap::with_capacity(names.len());
        for (idx, name) in names.iter().enumerate() {
            // First occurrence wins for duplicate column names.
            lookup.entry(name.to_ascii_lowercase()).or_insert(idx);
        }
        Arc::new(Self { names, lookup })
    }

    #[must_use]
    pub fn names(&self) -> &[String] {
        &self.names
    }

    #[must_use]
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.lookup
            .get(&name.to_ascii_lowercase())
            .copied()
            .or_else(|| {
                self.names
                    .iter()
                    .position(|col| col.eq_ignore_ascii_case(name))
            })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.names.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub(crate) fn same_names(&self, names: &Arc<Vec<String>>) -> bool {
        Arc::ptr_eq(&self.names, names) || self.names.as_slice() == names.as_slice()
    }
}

/// A row from a database query result
///
/// Column lookup by name is case-insensitive.
#[derive(Debug, Clone)]
pub struct DataRow {
    columns: Arc<Columns>,
    values: Vec<DbValue>,
}

impl DataRow {
    #[must_use]
    pub fn new(columns: Arc<Columns>, values: Vec<DbValue>) -> Self {
        Self { columns, values }
    }

    #[must_use]
    pub fn columns(&self) -> &[String] {
        self.columns.names()
    }

    /// Get the index of a column by name
    #[must_use]
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.index_of(name)
    }

    /// Get a value from the row by column name
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&DbValue> {
        self.column_index(name).and_then(|idx| self.values.get(idx))
    }

    /// Get a value from the row by column index
    #[must_use]
    pub fn get_by_index(&self, index: usize) -> Option<&DbValue> {
        self.values.get(index)
    }

    /// Like [`DataRow::get`], for row mappers that need the column to exist.
    ///
    /// # Errors
    /// Returns `DbError::Mapping` when the column is missing.
    pub fn require(&self, name: &str) -> Result<&DbValue, DbError> {
        self.get(name)
            .ok_or_else(|| DbError::Mapping(format!("column '{name}' not found")))
    }

    #[must_use]
    pub fn values(&self) -> &[DbValue] {
        &self.values
    }

    #[must_use]
    pub fn into_values(self) -> Vec<DbValue> {
        self.values
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_ignores_case() {
        let columns = Columns::new(Arc::new(vec!["P_Status".into(), "id".into()]));
        let row = DataRow::new(columns, vec![DbValue::Text("OK".into()), DbValue::Int(4)]);
        assert_eq!(row.get("p_status"), Some(&DbValue::Text("OK".into())));
        assert_eq!(row.get("ID"), Some(&DbValue::Int(4)));
        assert!(row.get("missing").is_none());
        assert!(matches!(row.require("missing"), Err(DbError::Mapping(_))));
    }
}
