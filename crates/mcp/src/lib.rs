//! MCP (Model Context Protocol) client library.
//!
//! Speaks line-delimited JSON-RPC to capability servers over a spawned
//! process (stdio) or an HTTP event stream (SSE), and tracks each
//! server's liveness.
//!
//! # Example
//!
//! ```no_run
//! use mcp::{ConnectOptions, Connection, DEFAULT_TIMEOUT, ServerConfig};
//!
//! # async fn example() -> mcp::Result<()> {
//! let config = ServerConfig::stdio("filesystem", "mcp-filesystem", ["--root", "./workspace"]);
//! let conn = Connection::connect(config, ConnectOptions::default()).await?;
//!
//! for tool in conn.tools() {
//!     println!("Tool: {}", tool.name);
//! }
//!
//! let result = conn
//!     .invoke("read_file", serde_json::json!({ "path": "./README.md" }), DEFAULT_TIMEOUT)
//!     .await?;
//! println!("{}", result.text());
//!
//! conn.close();
//! # Ok(())
//! # }
//! ```

pub mod codec;
mod connection;
mod error;
mod protocol;
mod transport;

pub use codec::{Inbound, MAX_MESSAGE_SIZE, MAX_OUTPUT_SIZE, Outbound, ParseError};
pub use connection::{
    CONNECT_TIMEOUT, ConnectOptions, Connection, ConnectionState, DEFAULT_TIMEOUT, DeadHook,
};
pub use error::{Error, Result};
pub use protocol::{
    CallToolParams, CallToolResult, Implementation, InitializeParams, InitializeResult,
    JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, ListToolsResult,
    PROTOCOL_VERSION, RequestId, Tool, ToolContent, Version,
};
pub use transport::{ServerConfig, TransportConfig};
