use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::connection::ConnectionHandle;
use crate::options::DbOptions;
use crate::parameter::ParameterDefinition;
use crate::transaction::{TransactionHandle, TransactionScope};
use crate::types::{DbValue, trim_parameter_prefix};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommandKind {
    #[default]
    Text,
    StoredProcedure,
}

/// How the driver should produce rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReadBehavior {
    /// Columns are read in order and large values are not buffered.
    pub sequential_access: bool,
    /// Only the first row of the first result set is needed.
    pub single_row: bool,
    /// Only the first result set is needed.
    pub single_result: bool,
}

impl ReadBehavior {
    pub const DEFAULT: ReadBehavior = ReadBehavior {
        sequential_access: false,
        single_row: false,
        single_result: false,
    };
    pub const SEQUENTIAL: ReadBehavior = ReadBehavior {
        sequential_access: true,
        single_row: false,
        single_result: false,
    };
    pub const SINGLE_ROW: ReadBehavior = ReadBehavior {
        sequential_access: false,
        single_row: true,
        single_result: true,
    };
}

/// A caller-supplied connection used instead of leasing one.
#[derive(Clone)]
pub struct ExternalConnection {
    pub connection: ConnectionHandle,
    pub transaction: Option<TransactionHandle>,
    /// Close the connection once the operation completes.
    pub close_on_completion: bool,
}

impl ExternalConnection {
    #[must_use]
    pub fn new(connection: ConnectionHandle) -> Self {
        Self {
            connection,
            transaction: None,
            close_on_completion: false,
        }
    }

    #[must_use]
    pub fn with_transaction(mut self, transaction: TransactionHandle) -> Self {
        self.transaction = Some(transaction);
        self
    }

    #[must_use]
    pub fn close_on_completion(mut self, close: bool) -> Self {
        self.close_on_completion = close;
        self
    }
}

impl std::fmt::Debug for ExternalConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExternalConnection")
            .field("connection", &self.connection.id())
            .field("transaction", &self.transaction.as_ref().map(TransactionHandle::id))
            .field("close_on_completion", &self.close_on_completion)
            .finish()
    }
}

/// Immutable description of one command execution.
///
/// Builder methods consume and return the request; adapters that need a different shape
/// clone it instead of mutating the caller's copy.
///
/// ```rust
/// use sqlbridge::prelude::*;
///
/// let request = CommandRequest::stored_procedure("pkg_orders.place_order")
///     .param(ParameterDefinition::input("p_customer", 7))
///     .param(ParameterDefinition::output("p_status", DbType::Text).with_size(16))
///     .trace_name("place-order");
/// assert_eq!(request.parameters.len(), 2);
/// ```
#[derive(Debug, Clone)]
pub struct CommandRequest {
    pub text: String,
    pub kind: CommandKind,
    pub parameters: Vec<ParameterDefinition>,
    pub connection: Option<ExternalConnection>,
    pub options: Option<Arc<DbOptions>>,
    pub timeout: Option<Duration>,
    pub behavior: ReadBehavior,
    pub trace_name: Option<String>,
    pub validate: bool,
    /// Overrides `DbOptions::wrap_provider_errors` for this call.
    pub wrap_errors: Option<bool>,
    pub cancellation: CancellationToken,
}

impl CommandRequest {
    #[must_use]
    pub fn new(text: impl Into<String>, kind: CommandKind) -> Self {
        Self {
            text: text.into(),
            kind,
            parameters: Vec::new(),
            connection: None,
            options: None,
            timeout: None,
            behavior: ReadBehavior::DEFAULT,
            trace_name: None,
            validate: true,
            wrap_errors: None,
            cancellation: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::new(text, CommandKind::Text)
    }

    #[must_use]
    pub fn stored_procedure(name: impl Into<String>) -> Self {
        Self::new(name, CommandKind::StoredProcedure)
    }

    #[must_use]
    pub fn param(mut self, parameter: ParameterDefinition) -> Self {
        self.parameters.push(parameter);
        self
    }

    #[must_use]
    pub fn params(mut self, parameters: impl IntoIterator<Item = ParameterDefinition>) -> Self {
        self.parameters.extend(parameters);
        self
    }

    #[must_use]
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    #[must_use]
    pub fn with_kind(mut self, kind: CommandKind) -> Self {
        self.kind = kind;
        self
    }

    #[must_use]
    pub fn with_parameters(mut self, parameters: Vec<ParameterDefinition>) -> Self {
        self.parameters = parameters;
        self
    }

    #[must_use]
    pub fn on_connection(mut self, connection: ExternalConnection) -> Self {
        self.connection = Some(connection);
        self
    }

    /// Run on an explicit transaction scope instead of the ambient one.
    #[must_use]
    pub fn in_scope(self, scope: &TransactionScope) -> Self {
        let mut external = ExternalConnection::new(scope.connection().clone());
        external.transaction = scope.transaction().cloned();
        self.on_connection(external)
    }

    #[must_use]
    pub fn with_options(mut self, options: Arc<DbOptions>) -> Self {
        self.options = Some(options);
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn behavior(mut self, behavior: ReadBehavior) -> Self {
        self.behavior = behavior;
        self
    }

    #[must_use]
    pub fn trace_name(mut self, name: impl Into<String>) -> Self {
        self.trace_name = Some(name.into());
        self
    }

    #[must_use]
    pub fn skip_validation(mut self) -> Self {
        self.validate = false;
        self
    }

    #[must_use]
    pub fn wrap_errors(mut self, wrap: bool) -> Self {
        self.wrap_errors = Some(wrap);
        self
    }

    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    #[must_use]
    pub fn has_output_parameters(&self) -> bool {
        self.parameters.iter().any(|p| p.direction.is_output())
    }

    /// Label used for spans and error messages.
    #[must_use]
    pub fn label(&self) -> &str {
        self.trace_name.as_deref().unwrap_or(&self.text)
    }
}

/// Output parameter values keyed case-insensitively by name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutputParameters {
    entries: Vec<(String, DbValue)>,
}

impl OutputParameters {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace; names are stored without their provider prefix.
    pub fn insert(&mut self, name: &str, value: DbValue) {
        let name = trim_parameter_prefix(name);
        if let Some(slot) = self
            .entries
            .iter_mut()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
        {
            slot.1 = value;
        } else {
            self.entries.push((name.to_string(), value));
        }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&DbValue> {
        let name = trim_parameter_prefix(name);
        self.entries
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(key, _)| key.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &DbValue)> {
        self.entries.iter().map(|(key, value)| (key.as_str(), value))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Outcome of a non-query or scalar execution.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionResult {
    pub rows_affected: u64,
    pub scalar: Option<DbValue>,
    pub outputs: OutputParameters,
}

impl ExecutionResult {
    #[must_use]
    pub fn output(&self, name: &str) -> Option<&DbValue> {
        self.outputs.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outputs_are_case_insensitive_and_prefix_free() {
        let mut outputs = OutputParameters::new();
        outputs.insert("@P_Status", DbValue::Text("OK".into()));
        outputs.insert("p_status", DbValue::Text("DONE".into()));
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs.get(":P_STATUS"), Some(&DbValue::Text("DONE".into())));
        assert_eq!(outputs.keys().collect::<Vec<_>>(), vec!["P_Status"]);
    }

    #[test]
    fn label_prefers_trace_name() {
        let request = CommandRequest::text("select 1");
        assert_eq!(request.label(), "select 1");
        assert_eq!(request.trace_name("ping").label(), "ping");
    }
}
