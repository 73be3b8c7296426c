//! Permission gate for tool execution.
//!
//! Core principle: **a side effect runs only after an explicit yes**, from
//! the session flags or from the user.

mod error;
mod gate;
mod kind;
mod policy;

pub use error::{Error, Result};
pub use gate::{Decision, KindState, PermissionGate, SessionPermissionFlags, UserDecision};
pub use kind::{PermissionRequest, RiskKind};
pub use policy::PermissionConfig;
