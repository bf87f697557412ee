//! A minimal client for MCP servers that speak framed JSON-RPC over stdio.
//!
//! The crate is intentionally lightweight – it is only capable of:
//!   1. Spawning a subprocess that launches a conforming MCP server.
//!   2. Sending one JSON-RPC request at a time and pairing it with its
//!      response by id.
//!   3. Offering convenience helpers for the `initialize`, `tools/list` and
//!      `tools/call` requests.

mod framing;
mod mcp_client;

pub use framing::FrameBuffer;
pub use framing::encode_message;
pub use mcp_client::MCP_PROTOCOL_VERSION;
pub use mcp_client::McpClientError;
pub use mcp_client::McpStdioClient;
pub use mcp_client::ProcessMeta;
