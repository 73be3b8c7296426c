//! Coxswain runtime: the agent loop and everything it drives.
//!
//! # Overview
//!
//! - **Agent**: runs one user turn at a time, alternating model rounds and
//!   tool execution until the model answers without tool calls.
//! - **CapabilityManager**: owns local tools, plugins and capability server
//!   connections, and publishes a merged [`ToolRegistry`] snapshot.
//! - **Backend**: a trait abstracting LLM providers (Anthropic, etc.).
//! - **TurnEvent**: the ordered stream a consumer watches while a turn runs.
//!
//! Permission decisions come from the `policy` crate's gate; capability
//! servers are spoken to through the `mcp` crate.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use policy::PermissionGate;
//! use runtime::{Agent, AgentConfig, AnthropicBackend, CapabilityManager, RejectAll};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> runtime::Result<()> {
//! let backend = AnthropicBackend::builder("sk-ant-api01-...", "claude-sonnet-4-20250514").build();
//! let capabilities = Arc::new(CapabilityManager::builder().builtin_tools().build());
//! let gate = Arc::new(PermissionGate::default());
//!
//! let mut agent = Agent::new(backend, capabilities, gate, Arc::new(RejectAll), AgentConfig::default());
//! let (sink, mut events) = runtime::event_channel();
//! let outcome = agent.process_turn("Hello!", sink, CancellationToken::new()).await;
//! while let Some(event) = events.try_recv() {
//!     println!("{event:?}");
//! }
//! println!("{outcome:?}");
//! # Ok(())
//! # }
//! ```

mod agent;
mod capability;
mod conversation;
mod error;
mod events;
pub mod model;
mod providers;
pub mod tools;

pub use agent::{Agent, AgentConfig, Approver, DEFAULT_MAX_ROUNDS, RejectAll, TurnOutcome};
pub use capability::{CapabilityManager, CapabilityManagerBuilder, ReloadReport, ServerStatus};
pub use conversation::Conversation;
pub use error::{Error, Result};
pub use events::{EventSink, EventStream, TurnEvent, event_channel};
pub use model::{
    Backend, ChunkStream, FinishReason, Message, ModelError, ModelRequest, ModelResponse, Part,
    Role, StreamChunk, ToolCall, ToolResult, ToolSpec, Usage,
};
pub use providers::{AnthropicBackend, AnthropicBackendBuilder};
pub use tools::{LocalTool, Plugin, ToolDefinition, ToolError, ToolOrigin, ToolRegistry};
