//! Message shapes of the capability protocol: JSON-RPC 2.0 envelopes plus
//! the MCP payloads a client needs (`initialize`, `tools/list`,
//! `tools/call`).

use serde::de::IgnoredAny;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// Protocol revision announced during `initialize`.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// JSON-RPC "method not found" error code.
pub const METHOD_NOT_FOUND: i32 = -32601;

/// The `"jsonrpc": "2.0"` marker. Always written; never checked on read,
/// since some servers leave it out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Version;

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("2.0")
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        IgnoredAny::deserialize(deserializer).map(|_| Version)
    }
}

/// Correlates a response with its request. Servers echo whatever we send.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    Text(String),
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        Self::Number(n)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self::Text(s.to_owned())
    }
}

/// A call that expects an answer.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: Version,
    pub id: RequestId,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: impl Into<RequestId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: Version,
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

/// A message that is never answered.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: Version,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            jsonrpc: Version,
            method: method.into(),
            params: None,
        }
    }
}

/// Answer to a request, in either direction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub jsonrpc: Version,
    pub id: RequestId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// Reply to a server-initiated request with an error.
    pub fn error(id: RequestId, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: Version,
            id,
            result: None,
            error: Some(error),
        }
    }

    /// Split into payload or error. A response with neither counts as a
    /// `null` result: void methods on some servers answer that way.
    pub fn into_result(self) -> Result<Value, JsonRpcError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.result.unwrap_or_default()),
        }
    }
}

/// Error object carried by a failed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{message} (code {code})")]
pub struct JsonRpcError {
    #[serde(default)]
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    pub fn method_not_found(method: &str) -> Self {
        Self {
            code: METHOD_NOT_FOUND,
            message: format!("method not found: {method}"),
            data: None,
        }
    }
}

/// Name and version of either end of a connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Implementation {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// `initialize` request. We advertise no optional client features.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    pub protocol_version: String,
    pub capabilities: Value,
    pub client_info: Implementation,
}

impl Default for InitializeParams {
    fn default() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION.to_owned(),
            capabilities: Value::Object(Default::default()),
            client_info: Implementation {
                name: "coxswain".to_owned(),
                version: Some(env!("CARGO_PKG_VERSION").to_owned()),
            },
        }
    }
}

/// `initialize` answer. Minimal servers reply with `{}`, so nothing is
/// required.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InitializeResult {
    pub protocol_version: Option<String>,
    pub capabilities: Value,
    pub server_info: Option<Implementation>,
    pub instructions: Option<String>,
}

/// A tool as advertised by `tools/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tool {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// JSON Schema of the arguments. Older servers call it `parameters`.
    #[serde(alias = "parameters", default = "empty_schema")]
    pub input_schema: Value,
}

fn empty_schema() -> Value {
    serde_json::json!({ "type": "object", "properties": {} })
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListToolsResult {
    #[serde(default)]
    pub tools: Vec<Tool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CallToolParams {
    pub name: String,
    pub arguments: Value,
}

/// `tools/call` answer: MCP content blocks, a bare `output` string, or
/// both. `is_error` reports a failure inside the tool, not the protocol.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CallToolResult {
    pub content: Vec<ToolContent>,
    pub output: Option<String>,
    pub is_error: bool,
}

impl CallToolResult {
    /// Every text block, then `output`, one per line.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(ToolContent::as_text)
            .chain(self.output.as_deref())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// One content block. Only text is surfaced to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ToolContent {
    Text {
        text: String,
    },
    #[serde(other)]
    Other,
}

impl ToolContent {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            Self::Other => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initialize_request_shape() {
        let params = serde_json::to_value(InitializeParams::default()).unwrap();
        let req = JsonRpcRequest::new(1i64, "initialize", Some(params));
        let json: Value = serde_json::to_value(&req).unwrap();
        assert_eq!(json["jsonrpc"], "2.0");
        assert_eq!(json["id"], 1);
        assert_eq!(json["params"]["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(json["params"]["clientInfo"]["name"], "coxswain");
    }

    #[test]
    fn response_without_version_or_result() {
        let resp: JsonRpcResponse = serde_json::from_str(r#"{"id":"a","result":null}"#).unwrap();
        assert_eq!(resp.id, RequestId::from("a"));
        assert_eq!(resp.into_result().unwrap(), Value::Null);
    }

    #[test]
    fn minimal_initialize_result() {
        let result: InitializeResult = serde_json::from_str("{}").unwrap();
        assert!(result.server_info.is_none());

        let result: InitializeResult =
            serde_json::from_str(r#"{"serverInfo":{"name":"git"},"capabilities":{"tools":{}}}"#)
                .unwrap();
        assert_eq!(result.server_info.unwrap().name, "git");
        assert!(result.capabilities["tools"].is_object());
    }

    #[test]
    fn tool_accepts_parameters_alias() {
        let json = r#"{
            "name": "commit",
            "description": "Commit staged changes",
            "parameters": {"type": "object", "properties": {"message": {"type": "string"}}}
        }"#;
        let tool: Tool = serde_json::from_str(json).unwrap();
        assert_eq!(tool.name, "commit");
        assert_eq!(tool.input_schema["properties"]["message"]["type"], "string");
    }

    #[test]
    fn tool_without_schema_gets_empty_object() {
        let tool: Tool = serde_json::from_str(r#"{"name":"ping"}"#).unwrap();
        assert_eq!(tool.input_schema["type"], "object");
    }

    #[test]
    fn call_result_plain_output() {
        let result: CallToolResult = serde_json::from_str(r#"{"output":"ok"}"#).unwrap();
        assert_eq!(result.text(), "ok");
        assert!(!result.is_error);
    }

    #[test]
    fn call_result_content_blocks() {
        let json = r#"{"content":[{"type":"text","text":"a"},{"type":"image","data":"..","mimeType":"image/png"},{"type":"text","text":"b"}],"isError":true}"#;
        let result: CallToolResult = serde_json::from_str(json).unwrap();
        assert_eq!(result.text(), "a\nb");
        assert!(result.is_error);
    }

    #[test]
    fn error_display() {
        let err = JsonRpcError::method_not_found("roots/list");
        assert_eq!(err.to_string(), "method not found: roots/list (code -32601)");
    }
}
