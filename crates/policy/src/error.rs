//! Policy error types.

use thiserror::Error;

/// Policy errors.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A risk kind name that is not one of the known kinds.
    #[error("unknown risk kind: {0}")]
    UnknownKind(String),

    /// The permission configuration is contradictory.
    #[error("invalid permissions: {0}")]
    Invalid(String),

    /// Failed to parse a permissions file.
    #[error("failed to parse permissions: {0}")]
    Parse(String),

    /// An I/O error occurred while reading permissions.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
