use std::collections::HashSet;
use std::time::Duration;

use crate::Value;

/// SQL text vs. a stored-procedure identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommandKind {
    #[default]
    Text,
    StoredProcedure,
}

/// Transaction isolation level hint. `Unspecified` means no transaction is
/// started for the command at all (see §4.5 step 3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    #[default]
    Unspecified,
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
    Snapshot,
    Chaos,
}

/// Direction of a bound parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParameterDirection {
    #[default]
    Input,
    Output,
    InputOutput,
    ReturnValue,
}

/// Immutable parameter binding. Cheaply cloneable so the executor can
/// re-bind the same parameter set on every retry attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryParameter {
    pub name: String,
    pub value: Option<Value>,
    pub db_type: Option<String>,
    pub direction: ParameterDirection,
    pub size: Option<i32>,
    pub precision: Option<u8>,
    pub scale: Option<u8>,
}

impl QueryParameter {
    pub fn new(name: impl Into<String>, value: impl Into<Option<Value>>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            db_type: None,
            direction: ParameterDirection::Input,
            size: None,
            precision: None,
            scale: None,
        }
    }

    pub fn with_db_type(mut self, db_type: impl Into<String>) -> Self {
        self.db_type = Some(db_type.into());
        self
    }

    pub fn with_direction(mut self, direction: ParameterDirection) -> Self {
        self.direction = direction;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryDefinitionError(pub String);

impl std::fmt::Display for QueryDefinitionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for QueryDefinitionError {}

/// Immutable description of a single command (§3, §4.1).
///
/// Parameters are validated for unique names at construction time; there is
/// no mutation after that, so the same definition can be handed to the
/// executor and re-used across retry attempts without defensive copying.
#[derive(Debug, Clone)]
pub struct QueryDefinition {
    pub command_text: String,
    pub command_kind: CommandKind,
    pub parameters: Vec<QueryParameter>,
    pub command_timeout: Option<Duration>,
    pub isolation: Option<IsolationLevel>,
    pub connection_name: Option<String>,
    pub tag: Option<String>,
}

impl QueryDefinition {
    fn validate(
        command_text: &str,
        parameters: &[QueryParameter],
    ) -> Result<(), QueryDefinitionError> {
        if command_text.trim().is_empty() {
            return Err(QueryDefinitionError(
                "command_text must not be empty".to_string(),
            ));
        }

        let mut seen = HashSet::with_capacity(parameters.len());
        for param in parameters {
            if !seen.insert(param.name.as_str()) {
                return Err(QueryDefinitionError(format!(
                    "duplicate parameter name '{}'",
                    param.name
                )));
            }
        }

        Ok(())
    }

    /// Build a plain SQL text command.
    pub fn text(command_text: impl Into<String>) -> Result<Self, QueryDefinitionError> {
        Self::text_with_parameters(command_text, Vec::new())
    }

    pub fn text_with_parameters(
        command_text: impl Into<String>,
        parameters: Vec<QueryParameter>,
    ) -> Result<Self, QueryDefinitionError> {
        let command_text = command_text.into();
        Self::validate(&command_text, &parameters)?;

        Ok(Self {
            command_text,
            command_kind: CommandKind::Text,
            parameters,
            command_timeout: None,
            isolation: None,
            connection_name: None,
            tag: None,
        })
    }

    /// Build a stored-procedure invocation.
    pub fn stored_procedure(
        procedure_name: impl Into<String>,
        parameters: Vec<QueryParameter>,
    ) -> Result<Self, QueryDefinitionError> {
        let command_text = procedure_name.into();
        Self::validate(&command_text, &parameters)?;

        Ok(Self {
            command_text,
            command_kind: CommandKind::StoredProcedure,
            parameters,
            command_timeout: None,
            isolation: None,
            connection_name: None,
            tag: None,
        })
    }

    pub fn with_connection_name(mut self, name: impl Into<String>) -> Self {
        self.connection_name = Some(name.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = Some(timeout);
        self
    }

    pub fn with_isolation(mut self, isolation: IsolationLevel) -> Self {
        self.isolation = Some(isolation);
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    /// Resolves the connection name against a default, per §8: blank
    /// `connection_name` targets `options.default_connection_name`.
    pub fn effective_connection_name<'a>(&'a self, default_connection_name: &'a str) -> &'a str {
        match self.connection_name.as_deref() {
            Some(name) if !name.trim().is_empty() => name,
            _ => default_connection_name,
        }
    }
}

/// A single row from a streamed query, addressed by column index or name.
#[derive(Debug, Clone, Default)]
pub struct RowView {
    pub columns: Vec<String>,
    pub values: Vec<Value>,
}

impl RowView {
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    pub fn get_named(&self, name: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name))
            .and_then(|i| self.values.get(i))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_rejects_blank_command() {
        let err = QueryDefinition::text("   ").unwrap_err();
        assert!(err.0.contains("empty"));
    }

    #[test]
    fn text_rejects_duplicate_parameter_names() {
        let params = vec![
            QueryParameter::new("id", Some(Value::Int(1))),
            QueryParameter::new("id", Some(Value::Int(2))),
        ];
        let err = QueryDefinition::text_with_parameters("SELECT 1", params).unwrap_err();
        assert!(err.0.contains("duplicate"));
    }

    #[test]
    fn effective_connection_name_falls_back_to_default_when_blank() {
        let q = QueryDefinition::text("SELECT 1").unwrap();
        assert_eq!(q.effective_connection_name("defaultDatabase"), "defaultDatabase");

        let q = q.with_connection_name("reporting");
        assert_eq!(q.effective_connection_name("defaultDatabase"), "reporting");
    }
}
