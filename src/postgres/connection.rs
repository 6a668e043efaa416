use std::sync::Arc;

use async_trait::async_trait;
use deadpool_postgres::{Object, Pool};
use tokio_postgres::types::ToSql;
use tracing::warn;

use crate::driver::{DbConnection, ProviderCommand, ProviderParameter, RowReader};
use crate::error::DriverError;
use crate::request::CommandKind;
use crate::translation::{MarkerStyle, translate_markers};
use crate::types::{DbValue, IsolationLevel, Provider};

use super::config::pool_error;
use super::query::{PostgresReader, extract_value};

/// A pooled `tokio-postgres` client checked out for the lifetime of an open connection.
///
/// `close` hands the client back to the pool; a client whose transaction could not be
/// rolled back is detached instead.
pub struct PostgresConnection {
    pool: Pool,
    client: Option<Object>,
    in_transaction: bool,
}

impl PostgresConnection {
    pub(super) fn new(pool: Pool) -> Self {
        Self {
            pool,
            client: None,
            in_transaction: false,
        }
    }

    fn client(&self) -> Result<&Object, DriverError> {
        self.client.as_ref().ok_or_else(|| {
            DriverError::connection_broken("Postgres connection is not open")
                .with_provider(Provider::Postgres)
        })
    }
}

fn inputs(command: &ProviderCommand) -> impl Iterator<Item = &ProviderParameter> {
    command.parameters.iter().filter(|p| p.direction.is_input())
}

/// SQL sent to the server: `$n` markers for text, a set-returning call for procedures.
fn command_sql(command: &ProviderCommand) -> String {
    let names: Vec<&str> = inputs(command).map(ProviderParameter::logical_name).collect();
    match command.kind {
        CommandKind::Text => {
            translate_markers(&command.text, MarkerStyle::Dollar, &names).into_owned()
        }
        CommandKind::StoredProcedure => {
            let args = (1..=names.len())
                .map(|n| format!("${n}"))
                .collect::<Vec<_>>()
                .join(", ");
            format!("SELECT * FROM {}({args})", command.text)
        }
    }
}

fn bind_values(command: &ProviderCommand) -> Vec<&(dyn ToSql + Sync)> {
    inputs(command)
        .map(|p| &p.value as &(dyn ToSql + Sync))
        .collect()
}

#[async_trait]
impl DbConnection for PostgresConnection {
    fn provider(&self) -> Provider {
        Provider::Postgres
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
        if let Some(client) = self.client.take()
            && self.in_transaction
        {
            self.in_transaction = false;
            if let Err(err) = client.batch_execute("ROLLBACK").await {
                warn!(error = %err, "rollback on close failed; detaching client from pool");
                drop(Object::take(client));
                return Err(err.into());
            }
        }
        Ok(())
    }

    async fn begin(&mut self, isolation: IsolationLevel) -> Result<(), DriverError> {
        let sql = match isolation.to_sql(Provider::Postgres) {
            Some(level) => format!("BEGIN ISOLATION LEVEL {level}"),
            None => "BEGIN".to_string(),
        };
        self.client()?.batch_execute(&sql).await?;
        self.in_transaction = true;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), DriverError> {
        self.client()?.batch_execute("COMMIT").await?;
        self.in_transaction = false;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), DriverError> {
        self.client()?.batch_execute("ROLLBACK").await?;
        self.in_transaction = false;
        Ok(())
    }

    async fn execute_batch(&mut self, sql: &str) -> Result<(), DriverError> {
        self.client()?.batch_execute(sql).await?;
        Ok(())
    }

    async fn execute(&mut self, command: &mut ProviderCommand) -> Result<u64, DriverError> {
        let client = self.client()?;
        let stmt = client.prepare_cached(&command_sql(command)).await?;
        let values = bind_values(command);
        Ok(client.execute(&stmt, &values).await?)
    }

    async fn execute_scalar(
        &mut self,
        command: &mut ProviderCommand,
    ) -> Result<DbValue, DriverError> {
        let client = self.client()?;
        let stmt = client.prepare_cached(&command_sql(command)).await?;
        let values = bind_values(command);
        let rows = client.query(&stmt, &values).await?;
        match rows.first() {
            Some(row) if !row.is_empty() => extract_value(row, 0),
            _ => Ok(DbValue::Null),
        }
    }

    async fn query(
        &mut self,
        command: &mut ProviderCommand,
    ) -> Result<Box<dyn RowReader>, DriverError> {
        let client = self.client()?;
        let stmt = client.prepare_cached(&command_sql(command)).await?;
        let columns = Arc::new(
            stmt.columns()
                .iter()
                .map(|c| c.name().to_string())
                .collect::<Vec<_>>(),
        );
        let stream = client.query_raw(&stmt, bind_values(command)).await?;
        Ok(Box::new(PostgresReader::new(columns, stream)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DbType, ParameterDirection};

    fn param(name: &str, direction: ParameterDirection) -> ProviderParameter {
        ProviderParameter {
            name: format!("@{name}"),
            db_type: DbType::Int32,
            direction,
            ..ProviderParameter::default()
        }
    }

    #[test]
    fn procedures_become_set_returning_calls() {
        let command = ProviderCommand {
            text: "public.add_user".into(),
            kind: CommandKind::StoredProcedure,
            parameters: vec![
                param("name", ParameterDirection::Input),
                param("id", ParameterDirection::Output),
                param("age", ParameterDirection::Input),
            ],
            ..ProviderCommand::default()
        };
        assert_eq!(command_sql(&command), "SELECT * FROM public.add_user($1, $2)");
    }

    #[test]
    fn text_markers_follow_input_order() {
        let command = ProviderCommand {
            text: "SELECT * FROM t WHERE b = @b AND a = @a".into(),
            kind: CommandKind::Text,
            parameters: vec![
                param("a", ParameterDirection::Input),
                param("b", ParameterDirection::Input),
            ],
            ..ProviderCommand::default()
        };
        assert_eq!(command_sql(&command), "SELECT * FROM t WHERE b = $2 AND a = $1");
    }
}
