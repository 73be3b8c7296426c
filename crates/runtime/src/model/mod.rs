//! LLM protocol types and backend trait.

pub mod errors;
pub mod types;

pub use errors::ModelError;
pub use types::{
    Backend, ChunkStream, FinishReason, Message, ModelRequest, ModelResponse, Part, Role,
    StreamChunk, ToolCall, ToolResult, ToolSpec, Usage, replay,
};
