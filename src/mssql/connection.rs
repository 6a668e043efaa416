use async_trait::async_trait;
use tiberius::ToSql;
use tracing::warn;

use crate::driver::{BufferedReader, BufferedResult, DbConnection, ProviderCommand, RowReader};
use crate::error::DriverError;
use crate::request::CommandKind;
use crate::translation::{MarkerStyle, translate_markers};
use crate::types::{DbValue, IsolationLevel, ParameterDirection, Provider};

use super::config::{MssqlPool, PooledClient, pool_error};
use super::params::declared_type;

const ROWS_COLUMN: &str = "__rows_affected";

/// A pooled tiberius client checked out for the lifetime of an open connection.
pub struct MssqlConnection {
    pool: MssqlPool,
    client: Option<PooledClient>,
    in_transaction: bool,
}

impl MssqlConnection {
    pub(super) fn new(pool: MssqlPool) -> Self {
        Self {
            pool,
            client: None,
            in_transaction: false,
        }
    }

    fn client(&mut self) -> Result<&mut PooledClient, DriverError> {
        self.client.as_mut().ok_or_else(|| {
            DriverError::connection_broken("SQL Server connection is not open")
                .with_provider(Provider::SqlServer)
        })
    }

    async fn run_statement(&mut self, sql: &str) -> Result<(), DriverError> {
        self.client()?.execute(sql, &[]).await?;
        Ok(())
    }

    /// Run the command batch and write output values back into `command`.
    ///
    /// Returns the caller-visible result sets and the rows affected.
    async fn run_batch(
        &mut self,
        command: &mut ProviderCommand,
    ) -> Result<(Vec<BufferedResult>, u64), DriverError> {
        let batch = command_batch(command)?;
        let client = self.client()?;
        let mut results = {
            let values = bind_values(command);
            let stream = client.query(batch, &values).await?;
            super::query::collect_results(stream).await?
        };
        let mut affected = 0;
        if has_outputs(command)
            && let Some(mut outputs) = results.pop()
            && let Some(row) = outputs.rows.pop_front()
        {
            affected = write_outputs(command, &outputs.columns, row);
        }
        Ok((results, affected))
    }
}

fn has_outputs(command: &ProviderCommand) -> bool {
    command.parameters.iter().any(|p| p.direction.is_output())
}

fn bind_values(command: &ProviderCommand) -> Vec<&dyn ToSql> {
    command
        .parameters
        .iter()
        .filter(|p| p.direction.is_input())
        .map(|p| &p.value as &dyn ToSql)
        .collect()
}

/// Copy the trailing output row into the matching parameters; returns the captured
/// row count.
fn write_outputs(command: &mut ProviderCommand, columns: &[String], row: Vec<DbValue>) -> u64 {
    let mut affected = 0;
    for (column, value) in columns.iter().zip(row) {
        if column == ROWS_COLUMN {
            affected = value.as_int().and_then(|n| u64::try_from(n).ok()).unwrap_or(0);
        } else if let Some(param) = command.parameter_mut(column) {
            param.value = value;
        }
    }
    affected
}

/// Build the T-SQL batch for a command.
///
/// Inputs bind positionally as `@P1..@Pn`. Output parameters are declared as local
/// variables named after the parameter, passed with `OUTPUT`, and read back through a
/// trailing single-row select.
fn command_batch(command: &ProviderCommand) -> Result<String, DriverError> {
    let mut prelude = String::new();
    let mut markers: Vec<&str> = Vec::new();
    let mut args: Vec<String> = Vec::new();
    let mut selects: Vec<String> = Vec::new();
    let mut return_var: Option<&str> = None;

    for param in &command.parameters {
        let name = param.logical_name();
        if param.direction.is_input() {
            markers.push(if param.direction == ParameterDirection::Input {
                name
            } else {
                ""
            });
        }
        let position = markers.len();
        match param.direction {
            ParameterDirection::Input => args.push(format!("@{name} = @P{position}")),
            ParameterDirection::InputOutput => {
                prelude.push_str(&format!(
                    "DECLARE @{name} {} = @P{position};\n",
                    declared_type(param)?
                ));
                args.push(format!("@{name} = @{name} OUTPUT"));
                selects.push(format!("@{name} AS [{name}]"));
            }
            ParameterDirection::Output => {
                prelude.push_str(&format!("DECLARE @{name} {};\n", declared_type(param)?));
                args.push(format!("@{name} = @{name} OUTPUT"));
                selects.push(format!("@{name} AS [{name}]"));
            }
            ParameterDirection::ReturnValue => {
                prelude.push_str(&format!("DECLARE @{name} INT;\n"));
                return_var = Some(name);
                selects.push(format!("@{name} AS [{name}]"));
            }
        }
    }

    let body = match command.kind {
        CommandKind::Text => translate_markers(&command.text, MarkerStyle::AtP, &markers).into_owned(),
        CommandKind::StoredProcedure => {
            let target = match return_var {
                Some(var) => format!("@{var} = {}", command.text),
                None => command.text.clone(),
            };
            if args.is_empty() {
                format!("EXEC {target};")
            } else {
                format!("EXEC {target} {};", args.join(", "))
            }
        }
    };

    if selects.is_empty() {
        return Ok(body);
    }
    Ok(format!(
        "{prelude}DECLARE @{ROWS_COLUMN} INT;\n{body}\nSET @{ROWS_COLUMN} = @@ROWCOUNT;\nSELECT {}, @{ROWS_COLUMN} AS [{ROWS_COLUMN}];",
        selects.join(", ")
    ))
}

#[async_trait]
impl DbConnection for MssqlConnection {
    fn provider(&self) -> Provider {
        Provider::SqlServer
    }

    fn is_open(&self) -> bool {
        self.client.is_some()
    }

    async fn open(&mut self) -> Result<(), DriverError> {
        if self.client.is_none() {
            self.client = Some(self.pool.get().await.map_err(pool_error)?);
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), DriverError> {
        if self.in_transaction && self.client.is_some() {
            self.in_transaction = false;
            if let Err(err) = self.run_statement("IF @@TRANCOUNT > 0 ROLLBACK TRANSACTION").await {
                warn!(error = %err, "rollback on close failed; detaching client from pool");
                if let Some(client) = self.client.take() {
                    drop(PooledClient::take(client));
                }
                return Err(err);
            }
        }
        self.client = None;
        Ok(())
    }

    async fn begin(&mut self, isolation: IsolationLevel) -> Result<(), DriverError> {
        if let Some(level) = isolation.to_sql(Provider::SqlServer) {
            self.run_statement(&format!("SET TRANSACTION ISOLATION LEVEL {level}"))
                .await?;
        }
        self.run_statement("BEGIN TRANSACTION").await?;
        self.in_transaction = true;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), DriverError> {
        self.run_statement("COMMIT TRANSACTION").await?;
        self.in_transaction = false;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), DriverError> {
        self.run_statement("ROLLBACK TRANSACTION").await?;
        self.in_transaction = false;
        Ok(())
    }

    async fn execute_batch(&mut self, sql: &str) -> Result<(), DriverError> {
        self.client()?.simple_query(sql).await?.into_results().await?;
        Ok(())
    }

    async fn execute(&mut self, command: &mut ProviderCommand) -> Result<u64, DriverError> {
        if has_outputs(command) {
            let (_, affected) = self.run_batch(command).await?;
            return Ok(affected);
        }
        let batch = command_batch(command)?;
        let values = bind_values(command);
        let result = self.client()?.execute(batch, &values).await?;
        Ok(result.total())
    }

    async fn execute_scalar(
        &mut self,
        command: &mut ProviderCommand,
    ) -> Result<DbValue, DriverError> {
        let (mut results, _) = self.run_batch(command).await?;
        if results.is_empty() {
            return Ok(DbValue::Null);
        }
        let first = results.swap_remove(0);
        Ok(first
            .rows
            .into_iter()
            .next()
            .and_then(|row| row.into_iter().next())
            .unwrap_or(DbValue::Null))
    }

    async fn query(
        &mut self,
        command: &mut ProviderCommand,
    ) -> Result<Box<dyn RowReader>, DriverError> {
        let (results, affected) = self.run_batch(command).await?;
        let reader = BufferedReader::new(results);
        Ok(Box::new(if has_outputs(command) {
            reader.with_records_affected(affected)
        } else {
            reader
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::ProviderParameter;
    use crate::types::DbType;

    fn param(name: &str, db_type: DbType, direction: ParameterDirection) -> ProviderParameter {
        ProviderParameter {
            name: format!("@{name}"),
            db_type,
            direction,
            ..ProviderParameter::default()
        }
    }

    #[test]
    fn plain_text_only_rewrites_markers() {
        let command = ProviderCommand {
            text: "SELECT * FROM t WHERE id = @id".into(),
            kind: CommandKind::Text,
            parameters: vec![param("id", DbType::Int32, ParameterDirection::Input)],
            ..ProviderCommand::default()
        };
        assert_eq!(command_batch(&command).unwrap(), "SELECT * FROM t WHERE id = @P1");
    }

    #[test]
    fn procedure_outputs_are_declared_and_selected() {
        let command = ProviderCommand {
            text: "dbo.add_user".into(),
            kind: CommandKind::StoredProcedure,
            parameters: vec![
                param("name", DbType::Text, ParameterDirection::Input),
                param("id", DbType::Int32, ParameterDirection::Output),
                param("ret", DbType::Int32, ParameterDirection::ReturnValue),
            ],
            ..ProviderCommand::default()
        };
        let batch = command_batch(&command).unwrap();
        assert!(batch.starts_with("DECLARE @id INT;\nDECLARE @ret INT;\n"));
        assert!(batch.contains("EXEC @ret = dbo.add_user @name = @P1, @id = @id OUTPUT;"));
        assert!(batch.ends_with("SELECT @id AS [id], @ret AS [ret], @__rows_affected AS [__rows_affected];"));
    }

    #[test]
    fn output_row_updates_parameters() {
        let mut command = ProviderCommand {
            parameters: vec![param("id", DbType::Int32, ParameterDirection::Output)],
            ..ProviderCommand::default()
        };
        let affected = write_outputs(
            &mut command,
            &["id".to_string(), ROWS_COLUMN.to_string()],
            vec![DbValue::Int(42), DbValue::Int(1)],
        );
        assert_eq!(affected, 1);
        assert_eq!(command.parameters[0].value, DbValue::Int(42));
    }
}
