//! Plugins: named bundles of local tools.

use std::sync::Arc;

use super::LocalTool;

/// A bundle of extra tools registered under the plugin's name.
///
/// Tools keep their own names; the registry records the plugin as their
/// origin.
#[derive(Clone)]
pub struct Plugin {
    pub name: String,
    pub version: String,
    pub description: Option<String>,
    tools: Vec<Arc<dyn LocalTool>>,
}

impl Plugin {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            description: None,
            tools: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_tool(mut self, tool: impl LocalTool + 'static) -> Self {
        self.tools.push(Arc::new(tool));
        self
    }

    pub fn tools(&self) -> &[Arc<dyn LocalTool>] {
        &self.tools
    }
}

impl std::fmt::Debug for Plugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Plugin")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("tools", &self.tools.len())
            .finish()
    }
}
