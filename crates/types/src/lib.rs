//! Shared wire model for the Manifold MCP proxy.
//!
//! This crate defines the JSON-RPC 2.0 message shapes the transports frame
//! and correlate, the MCP tool/result model the registry aggregates, and the
//! environment-variable model shared by the configuration layer. It carries
//! no I/O; everything here is plain serde data.

pub mod env;
pub mod jsonrpc;
pub mod tool;

pub use env::EnvVar;
pub use jsonrpc::{
    JsonRpcError, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, RequestId,
};
pub use tool::{CallToolResult, InitializeResult, ServerInfo, ToolContent, ToolMetadata};
