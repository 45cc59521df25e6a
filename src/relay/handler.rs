//! Agent handler for a secondary router: forwards requests to the primary.
//!
//! `initialize` and `ping` are answered locally; everything else goes through
//! the relay client.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::agent::{RequestHandler, ServerIdentity};
use crate::ipc::{CallToolResult, Methods, RpcError, RpcRequest, RpcResponse};

use super::client::{DEFAULT_REQUEST_TIMEOUT, RelayClient};

/// Agent handler for a secondary router.
///
/// `initialize` is answered locally with the same identity the primary
/// announces; everything else is forwarded. Relay failures become the same
/// structured errors a sole router would produce.
pub struct RelayHandler {
    client: Arc<RelayClient>,
    identity: ServerIdentity,
    request_timeout: Duration,
}

impl RelayHandler {
    pub fn new(client: Arc<RelayClient>, identity: ServerIdentity) -> Self {
        Self {
            client,
            identity,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn client(&self) -> &Arc<RelayClient> {
        &self.client
    }

    fn relay_failure(request: &RpcRequest, message: String) -> RpcResponse {
        if request.method == Methods::TOOLS_CALL {
            let result = CallToolResult::error_text(message);
            match serde_json::to_value(&result) {
                Ok(value) => RpcResponse::success(request.id.clone(), value),
                Err(e) => RpcResponse::error(request.id.clone(), RpcError::internal_error(e.to_string())),
            }
        } else {
            RpcResponse::error(request.id.clone(), RpcError::internal_error(message))
        }
    }
}

impl RequestHandler for RelayHandler {
    async fn handle(&self, request: RpcRequest) -> Option<RpcResponse> {
        if request.is_notification() {
            log::debug!("Not relaying notification: {}", request.method);
            return None;
        }
        match request.method.as_str() {
            Methods::INITIALIZE => Some(self.identity.initialize_response(&request)),
            Methods::PING => Some(RpcResponse::success(request.id.clone(), Value::Object(Default::default()))),
            _ => {
                let response = match self.client.forward(request.clone(), self.request_timeout).await {
                    Ok(response) => response,
                    Err(e) => {
                        log::warn!("Relay of '{}' failed: {}", request.method, e);
                        Self::relay_failure(&request, e.to_string())
                    }
                };
                Some(response)
            }
        }
    }
}
