//! Buffered tables, live reader leases, and row streams.

mod lease;
mod row;
mod table;

pub use lease::ReaderLease;
pub use row::{Columns, DataRow};
pub use table::{DataTable, TableSet};

use std::pin::Pin;

use futures_util::Stream;
use futures_util::stream;

use crate::error::DbError;

/// Lazily produced rows, projected one at a time.
pub type RowStream<T> = Pin<Box<dyn Stream<Item = Result<T, DbError>> + Send>>;

/// Read the current result set of `lease` into a table.
pub(crate) async fn read_table(lease: &mut ReaderLease) -> Result<DataTable, DbError> {
    let mut table = DataTable::new(lease.shared_columns());
    while let Some(row) = lease.next_row().await? {
        table.push(row);
    }
    Ok(table)
}

/// Read every remaining result set of `lease`.
pub(crate) async fn read_table_set(lease: &mut ReaderLease) -> Result<TableSet, DbError> {
    let mut set = TableSet::default();
    loop {
        set.tables.push(read_table(lease).await?);
        if !lease.next_result().await? {
            break;
        }
    }
    set.records_affected = lease.records_affected();
    Ok(set)
}

/// Turn a lease into a stream that closes the lease once the rows run out.
pub(crate) fn into_stream<T, F>(lease: ReaderLease, projector: F) -> RowStream<T>
where
    T: Send + 'static,
    F: Fn(&DataRow) -> Result<T, DbError> + Send + 'static,
{
    Box::pin(stream::try_unfold(
        Some((lease, projector)),
        |state| async move {
            let Some((mut lease, projector)) = state else {
                return Ok(None);
            };
            match lease.next_row().await {
                Ok(Some(row)) => match projector(&row) {
                    Ok(item) => Ok(Some((item, Some((lease, projector))))),
                    Err(err) => {
                        let _ = lease.release().await;
                        Err(err)
                    }
                },
                Ok(None) => {
                    lease.close().await?;
                    Ok(None)
                }
                Err(err) => {
                    let _ = lease.release().await;
                    Err(err)
                }
            }
        },
    ))
}
