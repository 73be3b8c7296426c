//! Built-in local tools: shell and filesystem access.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use policy::RiskKind;
use serde_json::{Value, json};
use tokio::process::Command;
use tracing::debug;

use super::local::string_arg;
use super::{LocalTool, ToolDefinition, ToolError};

/// Tool output beyond this many bytes is cut off.
pub const MAX_OUTPUT_SIZE: usize = mcp::MAX_OUTPUT_SIZE;

/// The standard local tool set.
pub fn builtin_tools() -> Vec<Arc<dyn LocalTool>> {
    vec![
        Arc::new(Bash),
        Arc::new(ReadFile),
        Arc::new(WriteFile),
        Arc::new(ListDir),
    ]
}

pub(crate) fn truncate(mut output: String) -> String {
    if output.len() <= MAX_OUTPUT_SIZE {
        return output;
    }
    let mut end = MAX_OUTPUT_SIZE;
    while !output.is_char_boundary(end) {
        end -= 1;
    }
    output.truncate(end);
    output.push_str("\n[output truncated]");
    output
}

/// Runs a shell command with `sh -c`.
#[derive(Debug, Default)]
pub struct Bash;

#[async_trait]
impl LocalTool for Bash {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::local(
            "bash",
            "Run a shell command and return its combined output.",
            json!({
                "type": "object",
                "properties": {
                    "command": { "type": "string", "description": "Command line to run" }
                },
                "required": ["command"]
            }),
        )
    }

    fn risk(&self) -> RiskKind {
        RiskKind::BashExec
    }

    fn scope(&self, arguments: &Value) -> Option<String> {
        string_arg(arguments, "command").ok().map(str::to_string)
    }

    async fn execute(&self, arguments: Value) -> Result<String, ToolError> {
        let command = string_arg(&arguments, "command")?;
        debug!(%command, "running shell command");

        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ToolError::Execution(format!("failed to start shell: {e}")))?;

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.is_empty() {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&stderr);
        }
        let text = truncate(text);

        if output.status.success() {
            Ok(text)
        } else {
            Err(ToolError::Execution(format!("{}\n{text}", output.status)))
        }
    }
}

/// Reads a UTF-8 text file.
#[derive(Debug, Default)]
pub struct ReadFile;

#[async_trait]
impl LocalTool for ReadFile {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::local(
            "read_file",
            "Read a text file.",
            json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string", "description": "File to read" }
                },
                "required": ["path"]
            }),
        )
    }

    fn risk(&self) -> RiskKind {
        RiskKind::FileRead
    }

    fn scope(&self, arguments: &Value) -> Option<String> {
        string_arg(arguments, "path").ok().map(str::to_string)
    }

    async fn execute(&self, arguments: Value) -> Result<String, ToolError> {
        let path = string_arg(&arguments, "path")?;
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| ToolError::Execution(format!("{path}: {e}")))?;
        Ok(truncate(content))
    }
}

/// Writes a file, creating parent directories.
#[derive(Debug, Default)]
pub struct WriteFile;

#[async_trait]
impl LocalTool for WriteFile {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::local(
            "write_file",
            "Write content to a file, replacing it if it exists.",
            json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string", "description": "File to write" },
                    "content": { "type": "string", "description": "New file content" }
                },
                "required": ["path", "content"]
            }),
        )
    }

    fn risk(&self) -> RiskKind {
        RiskKind::FileWrite
    }

    fn scope(&self, arguments: &Value) -> Option<String> {
        string_arg(arguments, "path").ok().map(str::to_string)
    }

    async fn execute(&self, arguments: Value) -> Result<String, ToolError> {
        let path = string_arg(&arguments, "path")?;
        let content = string_arg(&arguments, "content")?;

        if let Some(parent) = Path::new(path).parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ToolError::Execution(format!("{}: {e}", parent.display())))?;
        }
        tokio::fs::write(path, content)
            .await
            .map_err(|e| ToolError::Execution(format!("{path}: {e}")))?;
        Ok(format!("wrote {} bytes to {path}", content.len()))
    }
}

/// Lists a directory, one entry per line, directories suffixed with `/`.
#[derive(Debug, Default)]
pub struct ListDir;

#[async_trait]
impl LocalTool for ListDir {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::local(
            "list_dir",
            "List the entries of a directory.",
            json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string", "description": "Directory to list (default: .)" }
                }
            }),
        )
    }

    fn risk(&self) -> RiskKind {
        RiskKind::FileRead
    }

    fn scope(&self, arguments: &Value) -> Option<String> {
        Some(string_arg(arguments, "path").unwrap_or(".").to_string())
    }

    async fn execute(&self, arguments: Value) -> Result<String, ToolError> {
        let path = string_arg(&arguments, "path").unwrap_or(".");
        let mut dir = tokio::fs::read_dir(path)
            .await
            .map_err(|e| ToolError::Execution(format!("{path}: {e}")))?;

        let mut entries = Vec::new();
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| ToolError::Execution(format!("{path}: {e}")))?
        {
            let mut name = entry.file_name().to_string_lossy().into_owned();
            if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                name.push('/');
            }
            entries.push(name);
        }
        entries.sort();
        Ok(truncate(entries.join("\n")))
    }
}
