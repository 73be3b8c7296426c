//! MCP error types.

use crate::codec::ParseError;
use crate::protocol::JsonRpcError;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to spawn server: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("timeout after {0:?} waiting for response")]
    Timeout(Duration),

    #[error("response too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },

    #[error("malformed payload: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("invalid message: {0}")]
    Parse(#[from] ParseError),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("server returned an error: {0}")]
    JsonRpc(#[from] JsonRpcError),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid server config: {0}")]
    Config(String),
}

impl Error {
    /// Whether the failure means the server did not answer at all (as
    /// opposed to answering with an error).
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
