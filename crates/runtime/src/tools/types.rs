//! Tool-related types.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::ToolSpec;

/// Where a tool comes from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ToolOrigin {
    Local,
    Capability { server: String },
    Plugin { name: String },
}

impl fmt::Display for ToolOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => f.write_str("local"),
            Self::Capability { server } => write!(f, "capability:{server}"),
            Self::Plugin { name } => write!(f, "plugin:{name}"),
        }
    }
}

/// A tool as offered to the model. Immutable once registered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Unique registry name; capability tools are `<server>:<tool>`.
    pub name: String,
    pub description: String,
    pub parameters: Value,
    pub origin: ToolOrigin,
}

impl ToolDefinition {
    pub fn local(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            origin: ToolOrigin::Local,
        }
    }

    /// Definition for a tool discovered on a capability server.
    pub fn capability(server: &str, tool: &mcp::Tool) -> Self {
        Self {
            name: format!("{server}:{}", tool.name),
            description: tool.description.clone().unwrap_or_default(),
            parameters: tool.input_schema.clone(),
            origin: ToolOrigin::Capability {
                server: server.to_string(),
            },
        }
    }

    pub fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.name.clone(),
            description: self.description.clone(),
            schema: self.parameters.clone(),
        }
    }
}
