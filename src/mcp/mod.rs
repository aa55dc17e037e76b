//! MCP surface exposing the command runner as a tool.
//!
//! - `types`: Serializable response types for MCP tools
//! - `commands`: MCP tool implementations

pub mod commands;
pub mod types;

pub use commands::McpShellRunner;
