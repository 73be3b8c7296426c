//! Immutable merged tool set.

use std::collections::HashMap;
use std::sync::Arc;

use policy::{PermissionRequest, RiskKind};
use serde_json::Value;
use tracing::warn;

use super::local::permission_request;
use super::{LocalTool, ToolDefinition, ToolOrigin};
use crate::model::ToolSpec;

/// How a registered tool is executed.
#[derive(Clone)]
pub enum ToolHandler {
    Local(Arc<dyn LocalTool>),
    /// Forwarded to a capability server under the tool's own name.
    Capability { server: String, tool: String },
}

/// A tool with its source and executor.
#[derive(Clone)]
pub struct RegisteredTool {
    pub definition: ToolDefinition,
    pub risk: RiskKind,
    pub handler: ToolHandler,
}

impl RegisteredTool {
    pub fn local(tool: Arc<dyn LocalTool>) -> Self {
        Self {
            definition: tool.definition(),
            risk: tool.risk(),
            handler: ToolHandler::Local(tool),
        }
    }

    pub fn plugin(plugin: &str, tool: Arc<dyn LocalTool>) -> Self {
        let mut registered = Self::local(tool);
        registered.definition.origin = ToolOrigin::Plugin {
            name: plugin.to_string(),
        };
        registered
    }

    pub fn capability(server: &str, tool: &mcp::Tool) -> Self {
        Self {
            definition: ToolDefinition::capability(server, tool),
            risk: RiskKind::CapabilityCall,
            handler: ToolHandler::Capability {
                server: server.to_string(),
                tool: tool.name.clone(),
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    /// The gate request for calling this tool with `arguments`.
    pub fn permission_request(&self, arguments: &Value) -> PermissionRequest {
        match &self.handler {
            ToolHandler::Local(tool) => permission_request(tool.as_ref(), self.name(), arguments),
            ToolHandler::Capability { server, .. } => {
                PermissionRequest::capability(self.name(), server)
            }
        }
    }
}

impl std::fmt::Debug for RegisteredTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredTool")
            .field("name", &self.definition.name)
            .field("origin", &self.definition.origin)
            .field("risk", &self.risk)
            .finish()
    }
}

/// The tools offered to the model for one round.
///
/// Built in one step and never patched; a change produces a new registry.
#[derive(Debug, Default)]
pub struct ToolRegistry {
    tools: Vec<RegisteredTool>,
    index: HashMap<String, usize>,
}

impl ToolRegistry {
    /// Build a registry. On a name clash the earlier tool wins.
    pub fn new(tools: impl IntoIterator<Item = RegisteredTool>) -> Self {
        let mut registry = Self::default();
        for tool in tools {
            if let Some(&existing) = registry.index.get(tool.name()) {
                warn!(
                    tool = %tool.name(),
                    kept = %registry.tools[existing].definition.origin,
                    dropped = %tool.definition.origin,
                    "duplicate tool name"
                );
                continue;
            }
            registry.index.insert(tool.name().to_string(), registry.tools.len());
            registry.tools.push(tool);
        }
        registry
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredTool> {
        self.index.get(name).map(|&i| &self.tools[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &RegisteredTool> {
        self.tools.iter()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(RegisteredTool::name).collect()
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.iter().map(|t| t.definition.clone()).collect()
    }

    /// Provider-facing specs, in registry order.
    pub fn specs(&self) -> Vec<ToolSpec> {
        self.tools.iter().map(|t| t.definition.spec()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{Bash, ReadFile};

    fn mcp_tool(name: &str) -> mcp::Tool {
        serde_json::from_value(serde_json::json!({ "name": name })).unwrap()
    }

    #[test]
    fn preserves_merge_order() {
        let registry = ToolRegistry::new([
            RegisteredTool::local(Arc::new(Bash)),
            RegisteredTool::capability("git-tools", &mcp_tool("commit")),
            RegisteredTool::plugin("files", Arc::new(ReadFile)),
        ]);
        assert_eq!(registry.names(), vec!["bash", "git-tools:commit", "read_file"]);
        assert_eq!(
            registry.get("read_file").unwrap().definition.origin,
            ToolOrigin::Plugin { name: "files".into() }
        );
    }

    #[test]
    fn first_registration_wins() {
        let registry = ToolRegistry::new([
            RegisteredTool::local(Arc::new(Bash)),
            RegisteredTool::plugin("shadow", Arc::new(Bash)),
        ]);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("bash").unwrap().definition.origin, ToolOrigin::Local);
    }

    #[test]
    fn permission_requests_carry_kind_and_scope() {
        let registry = ToolRegistry::new([
            RegisteredTool::local(Arc::new(Bash)),
            RegisteredTool::capability("git-tools", &mcp_tool("push")),
        ]);

        let bash = registry.get("bash").unwrap();
        let req = bash.permission_request(&serde_json::json!({"command": "ls"}));
        assert_eq!(req.kind, RiskKind::BashExec);
        assert_eq!(req.scope.as_deref(), Some("ls"));

        let push = registry.get("git-tools:push").unwrap();
        let req = push.permission_request(&Value::Null);
        assert_eq!(req.kind, RiskKind::CapabilityCall);
        assert_eq!(req.scope.as_deref(), Some("git-tools"));
    }
}
