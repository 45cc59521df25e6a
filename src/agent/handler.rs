//! Request handling for the agent-facing protocol.
//!
//! `LocalHandler` answers from this process's registry and routing engine.
//! The relay bridge provides a second implementation that forwards to a
//! primary router.

use std::future::Future;
use std::sync::Arc;

use serde_json::{Value, json};

use crate::ipc::{
    CallToolParams, CallToolResult, InitializeResult, ListToolsResult, Methods, RpcError,
    RpcRequest, RpcResponse, ServerCapabilities, ServerInfo,
};
use crate::router::Router;

/// Default protocol version announced in `initialize`.
pub const DEFAULT_PROTOCOL_VERSION: &str = "2024-11-05";

/// Handler trait for processing agent requests
pub trait RequestHandler: Send + Sync {
    /// Handle a request. Notifications produce `None`.
    fn handle(&self, request: RpcRequest) -> impl Future<Output = Option<RpcResponse>> + Send;
}

/// What this router announces during capability negotiation.
#[derive(Debug, Clone)]
pub struct ServerIdentity {
    pub name: String,
    pub version: String,
    pub protocol_version: String,
}

impl Default for ServerIdentity {
    fn default() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            protocol_version: DEFAULT_PROTOCOL_VERSION.to_string(),
        }
    }
}

impl ServerIdentity {
    pub fn initialize_result(&self) -> InitializeResult {
        InitializeResult {
            protocol_version: self.protocol_version.clone(),
            capabilities: ServerCapabilities::default(),
            server_info: ServerInfo {
                name: self.name.clone(),
                version: self.version.clone(),
            },
        }
    }

    /// Response to `initialize`, identical whichever handler produces it.
    pub fn initialize_response(&self, request: &RpcRequest) -> RpcResponse {
        match serde_json::to_value(self.initialize_result()) {
            Ok(result) => RpcResponse::success(request.id.clone(), result),
            Err(e) => RpcResponse::error(request.id.clone(), RpcError::internal_error(e.to_string())),
        }
    }
}

/// Serves the agent protocol from the local routing engine.
pub struct LocalHandler {
    router: Arc<Router>,
    identity: ServerIdentity,
}

impl LocalHandler {
    pub fn new(router: Arc<Router>, identity: ServerIdentity) -> Self {
        Self { router, identity }
    }

    pub fn identity(&self) -> &ServerIdentity {
        &self.identity
    }

    /// Build the live catalog. Never cached.
    fn list_tools(&self, request: &RpcRequest) -> RpcResponse {
        let result = ListToolsResult {
            tools: self.router.registry().get_all_tools(),
        };
        to_response(request, &result)
    }

    async fn call_tool(&self, request: &RpcRequest) -> RpcResponse {
        let params: CallToolParams = match request.params.clone().map(serde_json::from_value) {
            Some(Ok(params)) => params,
            Some(Err(e)) => {
                return RpcResponse::error(
                    request.id.clone(),
                    RpcError::invalid_params(format!("Invalid tools/call params: {}", e)),
                );
            }
            None => {
                return RpcResponse::error(
                    request.id.clone(),
                    RpcError::invalid_params("Missing tools/call params"),
                );
            }
        };

        let arguments = params.arguments.unwrap_or_else(|| json!({}));
        let result = self.router.call_tool(&params.name, arguments).await;
        to_response(request, &CallToolResult::from(result))
    }
}

fn to_response<T: serde::Serialize>(request: &RpcRequest, result: &T) -> RpcResponse {
    match serde_json::to_value(result) {
        Ok(value) => RpcResponse::success(request.id.clone(), value),
        Err(e) => RpcResponse::error(request.id.clone(), RpcError::internal_error(e.to_string())),
    }
}

impl RequestHandler for LocalHandler {
    async fn handle(&self, request: RpcRequest) -> Option<RpcResponse> {
        if request.is_notification() {
            log::debug!("Agent notification: {}", request.method);
            return None;
        }

        let response = match request.method.as_str() {
            Methods::INITIALIZE => self.identity.initialize_response(&request),
            Methods::PING => RpcResponse::success(request.id.clone(), Value::Object(Default::default())),
            Methods::TOOLS_LIST => self.list_tools(&request),
            Methods::TOOLS_CALL => self.call_tool(&request).await,
            other => RpcResponse::error(request.id.clone(), RpcError::method_not_found(other)),
        };
        Some(response)
    }
}
