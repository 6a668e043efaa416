//! Oracle REF CURSOR extraction.
//!
//! The cursor comes back through an output parameter of a non-query call rather than
//! as a result set; the handle is taken off the bound parameter and read like any other
//! reader.

use crate::driver::{ProviderCommand, RowReader};
use crate::error::DbError;
use crate::types::{DbType, Provider};

pub(crate) fn ensure_supported(provider: Provider) -> Result<(), DbError> {
    if provider == Provider::Oracle {
        Ok(())
    } else {
        Err(DbError::ProviderNotSupported(format!(
            "REF CURSOR output parameters require Oracle, not {provider}"
        )))
    }
}

/// Take the cursor handle bound to `name` off an executed command.
pub(crate) fn take_cursor(
    command: &mut ProviderCommand,
    name: &str,
) -> Result<Box<dyn RowReader>, DbError> {
    let Some(parameter) = command.parameter_mut(name) else {
        return Err(DbError::ProviderFeature(format!(
            "cursor parameter '{name}' is not bound on the command"
        )));
    };
    if parameter.db_type != DbType::Cursor {
        tracing::debug!(
            parameter = %parameter.name,
            db_type = ?parameter.db_type,
            "reading cursor from a parameter not declared as a cursor"
        );
    }
    parameter.cursor.take().ok_or_else(|| {
        DbError::ProviderFeature(format!(
            "parameter '{name}' did not return a cursor handle"
        ))
    })
}
