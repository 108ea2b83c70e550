/// Model Context Protocol (MCP) server implementation
///
/// Exposes the code graph through named tools over stdio JSON-RPC,
/// enabling assistant integration without any HTTP surface.
pub mod server;
pub mod tools;
pub mod types;

pub use server::MCPServer;
pub use tools::{definitions, ToolContext};
pub use types::*;
