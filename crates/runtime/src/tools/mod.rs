//! Tool model: definitions, local executors, plugins and the registry.

mod builtin;
pub mod errors;
mod local;
mod plugin;
mod registry;
mod types;

pub(crate) use builtin::truncate;
pub use builtin::{Bash, ListDir, MAX_OUTPUT_SIZE, ReadFile, WriteFile, builtin_tools};
pub use errors::ToolError;
pub use local::LocalTool;
pub use plugin::Plugin;
pub use registry::{RegisteredTool, ToolHandler, ToolRegistry};
pub use types::{ToolDefinition, ToolOrigin};
