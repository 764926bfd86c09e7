use crate::query::{CommandKind, QueryDefinition};
use crate::task::CancelToken;

/// Per-execution ambient carried through every retry attempt (§3
/// "Resilience Context"). Created once per top-level call to the executor
/// and re-used, unmodified except for `operation_key`, across attempts.
#[derive(Debug, Clone)]
pub struct ResilienceContext {
    pub operation_key: String,
    pub connection_name: String,
    pub command_text: String,
    pub command_kind: CommandKind,
    pub tag: Option<String>,
    pub cancel_token: CancelToken,
}

impl ResilienceContext {
    /// Builds the context for one top-level execution, stamping the
    /// properties named in §4.5 step 1. `operation_key` defaults to
    /// `command_text` when not already set via the tag.
    pub fn for_execution(
        query: &QueryDefinition,
        connection_name: &str,
        cancel_token: CancelToken,
    ) -> Self {
        Self {
            operation_key: query.command_text.clone(),
            connection_name: connection_name.to_string(),
            command_text: query.command_text.clone(),
            command_kind: query.command_kind,
            tag: query.tag.clone(),
            cancel_token,
        }
    }
}
