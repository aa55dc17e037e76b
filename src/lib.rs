pub mod mcp;
pub mod runner;
