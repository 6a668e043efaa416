use std::sync::Arc;

use super::row::{Columns, DataRow};

/// A buffered result set.
#[derive(Debug, Clone, Default)]
pub struct DataTable {
    columns: Arc<Columns>,
    rows: Vec<DataRow>,
}

impl DataTable {
    #[must_use]
    pub fn new(columns: Arc<Columns>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub(crate) fn push(&mut self, row: DataRow) {
        self.rows.push(row);
    }

    #[must_use]
    pub fn column_names(&self) -> &[String] {
        self.columns.names()
    }

    #[must_use]
    pub fn rows(&self) -> &[DataRow] {
        &self.rows
    }

    #[must_use]
    pub fn into_rows(self) -> Vec<DataRow> {
        self.rows
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, DataRow> {
        self.rows.iter()
    }
}

impl<'a> IntoIterator for &'a DataTable {
    type Item = &'a DataRow;
    type IntoIter = std::slice::Iter<'a, DataRow>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.iter()
    }
}

/// Every result set produced by one command, in order.
#[derive(Debug, Clone, Default)]
pub struct TableSet {
    pub tables: Vec<DataTable>,
    /// Rows changed by the statements in the batch, when the driver reports it.
    pub records_affected: Option<u64>,
}

impl TableSet {
    #[must_use]
    pub fn len(&self) -> usize {
        self.tables.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    #[must_use]
    pub fn table(&self, index: usize) -> Option<&DataTable> {
        self.tables.get(index)
    }
}
