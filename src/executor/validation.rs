//! Request validation hook.

use std::collections::HashSet;

use lazy_static::lazy_static;
use regex::Regex;

use crate::error::DbError;
use crate::request::{CommandKind, CommandRequest};

lazy_static! {
    // Optionally schema- and package-qualified identifier.
    static ref PROCEDURE_NAME: Regex =
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_$#]*(\.[A-Za-z_][A-Za-z0-9_$#]*){0,2}$")
            .expect("static procedure name pattern");
}

/// Checks a request before anything touches the network.
pub trait Validator: Send + Sync {
    /// # Errors
    /// Returns `DbError::Validation` for the first violation found.
    fn validate(&self, request: &CommandRequest) -> Result<(), DbError>;
}

/// Structural checks every request goes through before registered validators.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestShapeValidator;

impl Validator for RequestShapeValidator {
    fn validate(&self, request: &CommandRequest) -> Result<(), DbError> {
        if request.text.trim().is_empty() {
            return Err(DbError::Validation("command text is empty".to_string()));
        }
        if request.kind == CommandKind::StoredProcedure
            && !PROCEDURE_NAME.is_match(request.text.trim())
        {
            return Err(DbError::Validation(format!(
                "invalid stored procedure name '{}'",
                request.text
            )));
        }
        if request.timeout.is_some_and(|t| t.is_zero()) {
            return Err(DbError::Validation(
                "timeout must be positive when set".to_string(),
            ));
        }
        let mut seen = HashSet::with_capacity(request.parameters.len());
        for parameter in &request.parameters {
            parameter.validate()?;
            if !seen.insert(parameter.name.to_ascii_lowercase()) {
                return Err(DbError::Validation(format!(
                    "parameter '{}' is declared more than once",
                    parameter.name
                )));
            }
        }
        Ok(())
    }
}
