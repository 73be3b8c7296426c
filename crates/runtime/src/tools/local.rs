//! In-process tool trait.

use async_trait::async_trait;
use policy::{PermissionRequest, RiskKind};
use serde_json::Value;

use super::{ToolDefinition, ToolError};

/// A tool executed inside this process.
///
/// This is the boundary between the model loop and local side effects.
/// `execute` reports every failure through its `Result`; the loop turns
/// it into a failed tool result and carries on.
#[async_trait]
pub trait LocalTool: Send + Sync {
    fn definition(&self) -> ToolDefinition;

    fn risk(&self) -> RiskKind;

    /// What the call touches (command, path, URL), shown when asking.
    fn scope(&self, _arguments: &Value) -> Option<String> {
        None
    }

    async fn execute(&self, arguments: Value) -> Result<String, ToolError>;
}

/// Build the gate request for a call to `tool`.
pub(crate) fn permission_request(
    tool: &dyn LocalTool,
    name: &str,
    arguments: &Value,
) -> PermissionRequest {
    let request = PermissionRequest::new(tool.risk(), name);
    match tool.scope(arguments) {
        Some(scope) => request.with_scope(scope),
        None => request,
    }
}

/// Pull a required string argument out of a JSON object.
pub(crate) fn string_arg<'a>(arguments: &'a Value, key: &str) -> Result<&'a str, ToolError> {
    arguments
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| ToolError::InvalidInput(format!("missing string argument '{key}'")))
}
