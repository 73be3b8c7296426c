//! Anthropic API backend.

use std::collections::HashMap;
use std::sync::Arc;

use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio_stream::wrappers::LinesStream;
use tokio_stream::StreamExt;
use tokio_util::io::StreamReader;
use tracing::debug;

use crate::model::{
    Backend, ChunkStream, FinishReason, Message, ModelError, ModelRequest, ModelResponse, Part,
    Role, StreamChunk, ToolCall, ToolResult, ToolSpec, Usage,
};

const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";

// ─────────────────────────────────────────────────────────────────────────────
// API Wire Types
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct ApiRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<ApiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ApiTool>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Debug, Serialize)]
struct ApiMessage {
    role: &'static str,
    content: ApiContent,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum ApiContent {
    Text(String),
    Blocks(Vec<ApiContentBlock>),
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ApiContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },
}

#[derive(Debug, Serialize)]
struct ApiTool {
    name: String,
    description: String,
    input_schema: Value,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    content: Vec<ApiResponseBlock>,
    usage: ApiUsage,
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ApiResponseBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Default, Deserialize)]
struct ApiUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

/// Anthropic streaming event
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ApiStreamEvent {
    MessageStart {
        message: ApiStreamMessage,
    },
    ContentBlockStart {
        index: usize,
        content_block: ApiResponseBlock,
    },
    ContentBlockDelta {
        index: usize,
        delta: ApiDelta,
    },
    ContentBlockStop {
        index: usize,
    },
    MessageDelta {
        delta: ApiMessageDelta,
        #[serde(default)]
        usage: ApiUsage,
    },
    MessageStop,
    Error {
        error: ApiErrorBody,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct ApiStreamMessage {
    #[serde(default)]
    usage: ApiUsage,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ApiDelta {
    TextDelta {
        text: String,
    },
    InputJsonDelta {
        partial_json: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct ApiMessageDelta {
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    message: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Tool names
// ─────────────────────────────────────────────────────────────────────────────

/// Wire-safe form of a registry name. The API accepts `[a-zA-Z0-9_-]`.
fn wire_name(name: &str) -> String {
    let mut wire = String::with_capacity(name.len());
    for c in name.chars() {
        match c {
            ':' => wire.push_str("__"),
            c if c.is_ascii_alphanumeric() || c == '_' || c == '-' => wire.push(c),
            _ => wire.push('_'),
        }
    }
    wire
}

/// Maps wire names back to the registry names of one request.
#[derive(Debug, Default, Clone)]
struct NameMap(HashMap<String, String>);

impl NameMap {
    fn new(tools: &[ToolSpec]) -> Self {
        Self(
            tools
                .iter()
                .map(|t| (wire_name(&t.name), t.name.clone()))
                .collect(),
        )
    }

    fn resolve(&self, wire: String) -> String {
        self.0.get(&wire).cloned().unwrap_or(wire)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Streaming
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct PartialToolUse {
    id: String,
    name: String,
    json: String,
}

/// Folds stream events into chunks.
#[derive(Debug, Default)]
struct StreamState {
    names: NameMap,
    tool_uses: HashMap<usize, PartialToolUse>,
    usage: Usage,
    stop_reason: Option<String>,
}

impl StreamState {
    fn apply(&mut self, event: ApiStreamEvent) -> Option<Result<StreamChunk, ModelError>> {
        match event {
            ApiStreamEvent::MessageStart { message } => {
                self.usage.input_tokens = message.usage.input_tokens;
                None
            }
            ApiStreamEvent::ContentBlockStart {
                index,
                content_block,
            } => match content_block {
                ApiResponseBlock::ToolUse { id, name, .. } => {
                    self.tool_uses.insert(
                        index,
                        PartialToolUse {
                            id,
                            name,
                            json: String::new(),
                        },
                    );
                    None
                }
                ApiResponseBlock::Text { text } if !text.is_empty() => {
                    Some(Ok(StreamChunk::Text(text)))
                }
                _ => None,
            },
            ApiStreamEvent::ContentBlockDelta { index, delta } => match delta {
                ApiDelta::TextDelta { text } => Some(Ok(StreamChunk::Text(text))),
                ApiDelta::InputJsonDelta { partial_json } => {
                    if let Some(partial) = self.tool_uses.get_mut(&index) {
                        partial.json.push_str(&partial_json);
                    }
                    None
                }
                ApiDelta::Other => None,
            },
            ApiStreamEvent::ContentBlockStop { index } => {
                let partial = self.tool_uses.remove(&index)?;
                let input = if partial.json.trim().is_empty() {
                    Value::Object(Default::default())
                } else {
                    match serde_json::from_str(&partial.json) {
                        Ok(input) => input,
                        Err(e) => {
                            return Some(Err(ModelError::InvalidResponse(format!(
                                "tool input for {}: {e}",
                                partial.name
                            ))));
                        }
                    }
                };
                Some(Ok(StreamChunk::ToolCall(ToolCall {
                    id: partial.id,
                    name: self.names.resolve(partial.name),
                    input,
                })))
            }
            ApiStreamEvent::MessageDelta { delta, usage } => {
                if delta.stop_reason.is_some() {
                    self.stop_reason = delta.stop_reason;
                }
                if usage.output_tokens > 0 {
                    self.usage.output_tokens = usage.output_tokens;
                }
                None
            }
            ApiStreamEvent::MessageStop => Some(Ok(StreamChunk::Finish {
                reason: self
                    .stop_reason
                    .as_deref()
                    .map(FinishReason::from_api)
                    .unwrap_or(FinishReason::EndTurn),
                usage: self.usage,
            })),
            ApiStreamEvent::Error { error } => Some(Err(ModelError::Api(error.message))),
            ApiStreamEvent::Other => None,
        }
    }
}

/// Parse a server-sent event body into chunks. Only `data:` lines carry
/// payloads; the event name is repeated inside each payload.
fn sse_chunks<R>(reader: R, names: NameMap) -> ChunkStream
where
    R: AsyncBufRead + Send + Unpin + 'static,
{
    let mut state = StreamState {
        names,
        ..Default::default()
    };
    let stream = LinesStream::new(reader.lines()).filter_map(move |line| {
        let line = match line {
            Ok(line) => line,
            Err(e) => return Some(Err(ModelError::Network(e.to_string()))),
        };
        let data = line.strip_prefix("data:")?.trim();
        if data.is_empty() || data == "[DONE]" {
            return None;
        }
        match serde_json::from_str::<ApiStreamEvent>(data) {
            Ok(event) => state.apply(event),
            Err(e) => {
                debug!("skipping unparseable stream event: {e}");
                None
            }
        }
    });
    Box::pin(stream)
}

// ─────────────────────────────────────────────────────────────────────────────
// Backend Implementation
// ─────────────────────────────────────────────────────────────────────────────

/// Builder for creating an Anthropic backend.
#[derive(Debug, Clone)]
pub struct AnthropicBackendBuilder {
    api_key: String,
    model: String,
    max_tokens: u32,
    system: Option<String>,
    base_url: String,
}

impl AnthropicBackendBuilder {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: model.into(),
            max_tokens: 4096,
            system: None,
            base_url: ANTHROPIC_BASE_URL.to_string(),
        }
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    /// API root for proxies and gateways; `/v1/messages` is appended.
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn build(self) -> AnthropicBackend {
        AnthropicBackend {
            client: reqwest::Client::new(),
            api_key: Arc::from(self.api_key),
            model: self.model,
            max_tokens: self.max_tokens,
            system: self.system,
            endpoint: format!("{}/v1/messages", self.base_url.trim_end_matches('/')),
        }
    }
}

/// Anthropic API backend.
pub struct AnthropicBackend {
    client: reqwest::Client,
    api_key: Arc<str>,
    model: String,
    max_tokens: u32,
    system: Option<String>,
    endpoint: String,
}

impl AnthropicBackend {
    pub fn builder(api_key: impl Into<String>, model: impl Into<String>) -> AnthropicBackendBuilder {
        AnthropicBackendBuilder::new(api_key, model)
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn role_to_api(role: Role) -> &'static str {
        match role {
            Role::User | Role::System | Role::Tool => "user",
            Role::Assistant => "assistant",
        }
    }

    fn message_to_api(msg: &Message) -> ApiMessage {
        let role = Self::role_to_api(msg.role);

        // Simple case: single text part
        if let [Part::Text(text)] = msg.parts.as_slice() {
            return ApiMessage {
                role,
                content: ApiContent::Text(text.clone()),
            };
        }

        let blocks: Vec<ApiContentBlock> = msg
            .parts
            .iter()
            .map(|part| match part {
                Part::Text(text) => ApiContentBlock::Text { text: text.clone() },
                Part::ToolCall(call) => ApiContentBlock::ToolUse {
                    id: call.id.clone(),
                    name: wire_name(&call.name),
                    input: call.input.clone(),
                },
                Part::ToolResult(result) => ApiContentBlock::ToolResult {
                    tool_use_id: result.tool_call_id().to_string(),
                    content: result.output_text(),
                    is_error: matches!(result, ToolResult::Failure { .. }),
                },
            })
            .collect();

        ApiMessage {
            role,
            content: ApiContent::Blocks(blocks),
        }
    }

    fn tool_to_api(spec: &ToolSpec) -> ApiTool {
        ApiTool {
            name: wire_name(&spec.name),
            description: spec.description.clone(),
            input_schema: spec.schema.clone(),
        }
    }

    fn response_to_message(blocks: Vec<ApiResponseBlock>, names: &NameMap) -> Message {
        let parts: Vec<Part> = blocks
            .into_iter()
            .filter_map(|block| match block {
                ApiResponseBlock::Text { text } => Some(Part::Text(text)),
                ApiResponseBlock::ToolUse { id, name, input } => Some(Part::ToolCall(ToolCall {
                    id,
                    name: names.resolve(name),
                    input,
                })),
                ApiResponseBlock::Unknown => None,
            })
            .collect();

        Message {
            role: Role::Assistant,
            parts,
        }
    }

    fn api_request(&self, request: &ModelRequest<'_>, stream: bool) -> ApiRequest {
        ApiRequest {
            model: self.model.clone(),
            max_tokens: self.max_tokens,
            messages: request
                .messages
                .iter()
                .filter(|m| m.role != Role::System)
                .map(Self::message_to_api)
                .collect(),
            system: self.system.clone(),
            tools: request.tools.iter().map(Self::tool_to_api).collect(),
            stream,
        }
    }

    async fn send(&self, body: &ApiRequest, accept: &str) -> Result<reqwest::Response, ModelError> {
        let response = self
            .client
            .post(&self.endpoint)
            .header("x-api-key", self.api_key.as_ref())
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .header("accept", accept)
            .json(body)
            .send()
            .await
            .map_err(|e| ModelError::Network(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ModelError::Api(format!("{status}: {body}")));
        }
        Ok(response)
    }
}

impl std::fmt::Display for AnthropicBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "anthropic({})", self.model)
    }
}

impl Backend for AnthropicBackend {
    async fn call(&self, request: ModelRequest<'_>) -> Result<ModelResponse, ModelError> {
        let names = NameMap::new(request.tools);
        let body = self.api_request(&request, false);
        let response = self.send(&body, "application/json").await?;

        let api_response: ApiResponse = response
            .json()
            .await
            .map_err(|e| ModelError::InvalidResponse(e.to_string()))?;

        let message = Self::response_to_message(api_response.content, &names);
        let usage = Usage {
            input_tokens: api_response.usage.input_tokens,
            output_tokens: api_response.usage.output_tokens,
        };
        let finish = api_response
            .stop_reason
            .as_deref()
            .map(FinishReason::from_api)
            .unwrap_or(FinishReason::EndTurn);

        Ok(ModelResponse {
            message,
            usage,
            finish,
        })
    }

    async fn stream(&self, request: ModelRequest<'_>) -> Result<ChunkStream, ModelError> {
        let names = NameMap::new(request.tools);
        let body = self.api_request(&request, true);
        let response = self.send(&body, "text/event-stream").await?;

        let bytes = response.bytes_stream().map_err(std::io::Error::other);
        let reader = BufReader::new(StreamReader::new(Box::pin(bytes)));
        Ok(sse_chunks(reader, names))
    }
}
