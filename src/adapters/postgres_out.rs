//! OUT-parameter emulation for PostgreSQL.
//!
//! PostgreSQL functions hand OUT values back as a result row rather than through bound
//! parameters. A request with output parameters is rewritten into a single-row query
//! and the row is mapped back onto the declared outputs.

use crate::error::DbError;
use crate::parameter::ParameterDefinition;
use crate::request::{CommandKind, CommandRequest, ExecutionResult, ReadBehavior};
use crate::results::{DataRow, ReaderLease};
use crate::types::{DbValue, ParameterDirection, Provider};

pub(crate) fn applies(provider: Provider, request: &CommandRequest) -> bool {
    provider == Provider::Postgres && request.has_output_parameters()
}

/// Clone `request` into the query that returns the OUT values.
///
/// Stored procedures become `SELECT * FROM name(@in1, @in2, ...)` over the input
/// parameters in declared order; text commands keep their text.
pub(crate) fn derive_request(request: &CommandRequest) -> CommandRequest {
    let inputs: Vec<ParameterDefinition> = request
        .parameters
        .iter()
        .filter(|p| p.direction.is_input())
        .cloned()
        .collect();
    let text = match request.kind {
        CommandKind::StoredProcedure => {
            let args = inputs
                .iter()
                .map(|p| format!("@{}", p.name))
                .collect::<Vec<_>>()
                .join(", ");
            format!("SELECT * FROM {}({args})", request.text)
        }
        CommandKind::Text => request.text.clone(),
    };
    request
        .clone()
        .with_text(text)
        .with_kind(CommandKind::Text)
        .with_parameters(inputs)
        .behavior(ReadBehavior::SINGLE_ROW)
}

/// Read the single row from `lease`, close it, and map it onto `request`'s outputs.
pub(crate) async fn read_outputs(
    mut lease: ReaderLease,
    request: &CommandRequest,
    want_scalar: bool,
) -> Result<ExecutionResult, DbError> {
    let row = lease.next_row().await;
    let rows_affected = lease.records_affected();
    let closed = lease.close().await;
    let row = row?;
    closed?;
    let mut result = map_row(request, row, want_scalar)?;
    result.rows_affected = rows_affected.unwrap_or(0);
    Ok(result)
}

pub(crate) fn map_row(
    request: &CommandRequest,
    row: Option<DataRow>,
    want_scalar: bool,
) -> Result<ExecutionResult, DbError> {
    let Some(row) = row else {
        return Err(DbError::ProviderFeature(
            "expected a result row but none was returned".to_string(),
        ));
    };

    let outputs: Vec<&ParameterDefinition> = request
        .parameters
        .iter()
        .filter(|p| p.direction.is_output())
        .collect();

    // Name matches claim their columns first; the rest take unclaimed columns in order.
    let mut claimed = vec![false; row.len()];
    let mut slots: Vec<Option<usize>> = outputs
        .iter()
        .map(|param| {
            let idx = row.column_index(&param.name).filter(|&idx| !claimed[idx])?;
            claimed[idx] = true;
            Some(idx)
        })
        .collect();
    let mut free = (0..row.len()).filter(|&idx| !claimed[idx]);
    for (slot, param) in slots.iter_mut().zip(&outputs) {
        if slot.is_none() {
            let idx = free.next().ok_or_else(|| {
                DbError::ProviderFeature(format!(
                    "no result column left for output parameter '{}'",
                    param.name
                ))
            })?;
            *slot = Some(idx);
        }
    }

    let mut result = ExecutionResult::default();
    let mut return_value = None;
    for (slot, param) in slots.into_iter().zip(outputs) {
        let value = slot
            .and_then(|idx| row.get_by_index(idx))
            .cloned()
            .unwrap_or(DbValue::Null);
        if param.direction == ParameterDirection::ReturnValue && return_value.is_none() {
            return_value = Some(value.clone());
        }
        result.outputs.insert(&param.name, value);
    }

    if want_scalar {
        result.scalar = Some(
            return_value
                .or_else(|| row.get_by_index(0).cloned())
                .unwrap_or(DbValue::Null),
        );
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::results::Columns;
    use crate::types::DbType;

    fn request() -> CommandRequest {
        CommandRequest::stored_procedure("billing.close_invoice")
            .param(ParameterDefinition::input("p_invoice", 10))
            .param(ParameterDefinition::output("p_total", DbType::Decimal))
            .param(ParameterDefinition::input_output("p_note", "draft"))
            .param(ParameterDefinition::output("p_status", DbType::Text))
    }

    fn row(columns: &[&str], values: Vec<DbValue>) -> DataRow {
        let names = columns.iter().map(|c| (*c).to_string()).collect();
        DataRow::new(Columns::new(Arc::new(names)), values)
    }

    #[test]
    fn procedure_becomes_select_over_inputs() {
        let derived = derive_request(&request());
        assert_eq!(
            derived.text,
            "SELECT * FROM billing.close_invoice(@p_invoice, @p_note)"
        );
        assert_eq!(derived.kind, CommandKind::Text);
        assert_eq!(derived.behavior, ReadBehavior::SINGLE_ROW);
        let names: Vec<_> = derived.parameters.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["p_invoice", "p_note"]);
    }

    #[test]
    fn text_commands_keep_their_text() {
        let req = CommandRequest::text("select * from f(@a)")
            .param(ParameterDefinition::input("a", 1))
            .param(ParameterDefinition::output("b", DbType::Int32));
        assert_eq!(derive_request(&req).text, "select * from f(@a)");
    }

    #[test]
    fn maps_by_name_then_by_position() {
        let row = row(
            &["P_STATUS", "x", "note_out"],
            vec![
                DbValue::Text("closed".into()),
                DbValue::Decimal("12.50".into()),
                DbValue::Text("final".into()),
            ],
        );
        let result = map_row(&request(), Some(row), false).unwrap();
        assert_eq!(result.outputs.len(), 3);
        assert_eq!(result.output("p_status"), Some(&DbValue::Text("closed".into())));
        // P_STATUS is claimed by name, so p_total and p_note take the remaining columns.
        assert_eq!(result.output("p_total"), Some(&DbValue::Decimal("12.50".into())));
        assert_eq!(result.output("p_note"), Some(&DbValue::Text("final".into())));
        assert!(result.scalar.is_none());
    }

    #[test]
    fn named_columns_are_not_reused_by_position() {
        let req = CommandRequest::stored_procedure("orders.place")
            .param(ParameterDefinition::output("p_reference", DbType::Text))
            .param(ParameterDefinition::output("p_status", DbType::Text));
        let row = row(
            &["p_status", "ref"],
            vec![DbValue::Text("OK".into()), DbValue::Text("ABC123".into())],
        );
        let result = map_row(&req, Some(row), false).unwrap();
        assert_eq!(result.output("p_reference"), Some(&DbValue::Text("ABC123".into())));
        assert_eq!(result.output("p_status"), Some(&DbValue::Text("OK".into())));
        let names: Vec<_> = result.outputs.iter().map(|(name, _)| name.to_string()).collect();
        assert_eq!(names, ["p_reference", "p_status"]);
    }

    #[test]
    fn too_few_columns_is_a_provider_feature_error() {
        let row = row(&["p_status"], vec![DbValue::Text("closed".into())]);
        let err = map_row(&request(), Some(row), false).unwrap_err();
        assert!(matches!(err, DbError::ProviderFeature(msg) if msg.contains("p_total")));
    }

    #[test]
    fn zero_rows_is_a_provider_feature_error() {
        let err = map_row(&request(), None, false).unwrap_err();
        assert!(matches!(err, DbError::ProviderFeature(msg) if msg.contains("none was returned")));
    }

    #[test]
    fn scalar_prefers_return_value_column() {
        let req = CommandRequest::stored_procedure("f")
            .param(ParameterDefinition::output("extra", DbType::Int32))
            .param(ParameterDefinition::return_value("result", DbType::Int32));
        let row = row(&["extra", "result"], vec![DbValue::Int(1), DbValue::Int(2)]);
        let result = map_row(&req, Some(row), true).unwrap();
        assert_eq!(result.scalar, Some(DbValue::Int(2)));

        let plain = CommandRequest::stored_procedure("g")
            .param(ParameterDefinition::output("only", DbType::Int32));
        let row = self::row(&["first"], vec![DbValue::Int(9)]);
        assert_eq!(map_row(&plain, Some(row), true).unwrap().scalar, Some(DbValue::Int(9)));
    }
}
