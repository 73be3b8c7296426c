use thiserror::Error;

use crate::model::ModelError;

/// Errors from managing capability servers and conversation state.
///
/// Failures of a single tool call are not errors at this level; they
/// become failed [`ToolResult`](crate::ToolResult)s.
#[derive(Debug, Error)]
pub enum Error {
    #[error("capability server already exists: {0}")]
    DuplicateServer(String),

    #[error("capability server not found: {0}")]
    ServerNotFound(String),

    #[error("tool result does not match a pending call: {0}")]
    UnmatchedToolResult(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Capability(#[from] mcp::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
