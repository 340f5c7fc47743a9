//! `mcpv-proto` — JSON-RPC 2.0 framing and MCP payload types.
//!
//! This crate provides:
//! - JSON-RPC request/notification/response/error types and incoming
//!   message classification (responses vs. server-initiated requests vs.
//!   notifications).
//! - MCP handshake payloads, server capabilities, and the typed
//!   tool/resource/prompt definitions the aggregation indexes snapshot.
//! - MCP error codes, including `-32042` (URL elicitation required),
//!   which must be propagated verbatim.

pub mod jsonrpc;
pub mod mcp;

// Re-exports for convenience.
pub use jsonrpc::{Incoming, JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
pub use mcp::{PromptDef, ResourceDef, ServerCapabilities, ToolDef};
