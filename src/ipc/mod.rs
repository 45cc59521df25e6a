//! IPC Layer - framing and message types for both channels
//!
//! This module provides:
//! - Newline-delimited JSON codec and write sink
//! - Application-facing wire messages (register, invoke, respond, relay)
//! - Agent-facing JSON-RPC envelope and tool-protocol payloads

pub mod codec;
pub mod rpc;
pub mod wire;

pub use codec::{MessageSink, MessageStream, NdJsonCodec, message_stream};
pub use rpc::{
    CallToolParams, CallToolResult, ErrorCode, InitializeResult, ListToolsResult, Methods,
    RequestId, RpcError, RpcRequest, RpcResponse, ServerCapabilities, ServerInfo, ToolContent,
    ToolsCapability,
};
pub use wire::{NamespacedToolName, ToolDefinition, ToolResult, WireMessage};
