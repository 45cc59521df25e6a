//! Application-facing listener
//!
//! Accepts tool-host connections and relay peers on one TCP address. Each
//! connection runs as a tracked task; the first registration message decides
//! whether it is an application or a relay peer for the rest of its life.

use std::net::SocketAddr;
use std::sync::Arc;

use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::agent::{LocalHandler, RequestHandler};
use crate::auth::Authenticator;
use crate::error::Result;
use crate::id::ConnectionId;
use crate::ipc::{
    MessageSink, NamespacedToolName, RpcError, RpcRequest, RpcResponse, WireMessage, message_stream,
};
use crate::registry::RegistrationOutcome;

use super::engine::Router;

/// Well-known address shared by tool hosts and relay secondaries.
pub const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1:7642";

pub const DEFAULT_MAX_CONNECTIONS: usize = 64;

/// Configuration for the application listener
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub bind_address: String,
    /// Connections beyond this are closed on accept
    pub max_connections: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}

impl ListenerConfig {
    pub fn with_bind_address(mut self, address: impl Into<String>) -> Self {
        self.bind_address = address.into();
        self
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }
}

/// What a connection turned out to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerRole {
    Unassigned,
    Application(String),
    Relay,
}

/// Shared services every connection task needs.
#[derive(Clone)]
pub struct ConnectionContext {
    pub router: Arc<Router>,
    /// Executes relayed agent requests against the local routing table
    pub handler: Arc<LocalHandler>,
    pub auth: Arc<dyn Authenticator>,
}

pub struct AppListener {
    listener: TcpListener,
    config: ListenerConfig,
    context: ConnectionContext,
}

impl AppListener {
    /// Bind the listener.
    ///
    /// The raw IO error is returned so callers can tell `AddrInUse` apart.
    pub async fn bind(config: ListenerConfig, context: ConnectionContext) -> std::io::Result<Self> {
        let listener = TcpListener::bind(&config.bind_address).await?;
        log::info!("Application listener bound to {}", config.bind_address);
        Ok(Self {
            listener,
            config,
            context,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `shutdown` fires, then wait for every
    /// connection task to finish.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let mut tasks: JoinSet<()> = JoinSet::new();

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            if tasks.len() >= self.config.max_connections {
                                log::warn!(
                                    "Rejecting connection from {}: at capacity ({})",
                                    peer,
                                    self.config.max_connections
                                );
                                drop(stream);
                                continue;
                            }
                            let _ = stream.set_nodelay(true);

                            let connection_id = ConnectionId::generate();
                            tracing::info!(connection_id = %connection_id, peer = %peer, "Accepted connection");

                            let context = self.context.clone();
                            let token = shutdown.child_token();
                            tasks.spawn(async move {
                                if let Err(e) = serve_connection(stream, connection_id.clone(), context, token).await {
                                    tracing::warn!(connection_id = %connection_id, error = %e, "Connection ended with error");
                                }
                            });
                        }
                        Err(e) => {
                            log::warn!("Accept error: {}", e);
                        }
                    }
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        log::warn!("Connection task failed: {}", e);
                    }
                }
                _ = shutdown.cancelled() => {
                    break;
                }
            }
        }

        log::info!("Listener shutting down, joining {} connection tasks", tasks.len());
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                log::warn!("Connection task failed: {}", e);
            }
        }
        Ok(())
    }
}

/// Serve one connection until it closes or `shutdown` fires.
pub async fn serve_connection<S>(
    stream: S,
    connection_id: ConnectionId,
    context: ConnectionContext,
    shutdown: CancellationToken,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, writer) = tokio::io::split(stream);
    let sink = Arc::new(MessageSink::<WireMessage>::new(writer));
    let mut messages = message_stream::<_, WireMessage>(reader);
    let mut relayed: JoinSet<()> = JoinSet::new();
    let mut role = PeerRole::Unassigned;

    let outcome: Result<()> = loop {
        let next = tokio::select! {
            next = messages.next() => next,
            Some(_) = relayed.join_next(), if !relayed.is_empty() => continue,
            _ = shutdown.cancelled() => break Ok(()),
        };

        let message = match next {
            Some(Ok(message)) => message,
            Some(Err(e)) => break Err(e.into()),
            None => break Ok(()),
        };

        match handle_message(message, &connection_id, &context, &sink, &mut role, &mut relayed).await {
            Ok(true) => {}
            Ok(false) => break Ok(()),
            Err(e) => break Err(e),
        }
    };

    relayed.shutdown().await;
    match &role {
        PeerRole::Application(_) => {
            context.router.connection_closed(&connection_id);
        }
        PeerRole::Relay => {
            tracing::info!(connection_id = %connection_id, "Relay peer disconnected");
        }
        PeerRole::Unassigned => {
            tracing::debug!(connection_id = %connection_id, "Connection closed before registering");
        }
    }
    sink.close().await;
    outcome
}

/// Returns `Ok(false)` when the connection should be closed.
async fn handle_message(
    message: WireMessage,
    connection_id: &ConnectionId,
    context: &ConnectionContext,
    sink: &Arc<MessageSink<WireMessage>>,
    role: &mut PeerRole,
    relayed: &mut JoinSet<()>,
) -> Result<bool> {
    match message {
        WireMessage::Register {
            app_name,
            tools,
            secret,
        } => {
            if *role == PeerRole::Relay {
                reject(sink, "Relay connections cannot register tools").await;
                return Ok(true);
            }
            if !context.auth.verify(secret.as_deref()) {
                tracing::warn!(connection_id = %connection_id, app = %app_name, "Registration rejected: bad secret");
                reject(sink, "Authentication failed").await;
                return Ok(false);
            }
            if let Some(problem) = NamespacedToolName::registration_problem(&app_name, &tools) {
                tracing::warn!(connection_id = %connection_id, "Registration rejected: {}", problem);
                reject(sink, &problem).await;
                return Ok(true);
            }
            if *role == PeerRole::Unassigned {
                context.router.attach(connection_id, Arc::clone(sink));
            }
            let count = tools.len();
            let outcome = context
                .router
                .registry()
                .register_app(connection_id, &app_name, tools);
            tracing::info!(
                connection_id = %connection_id,
                app = %app_name,
                tools = count,
                updated = outcome == RegistrationOutcome::Updated,
                "Application registered"
            );
            *role = PeerRole::Application(app_name);
        }

        WireMessage::ToolResponse {
            correlation_id,
            result,
        } => match role {
            PeerRole::Application(_) => {
                context.router.resolve(connection_id, correlation_id, result);
            }
            _ => {
                tracing::warn!(connection_id = %connection_id, correlation_id, "toolResponse from unregistered connection");
            }
        },

        WireMessage::RelayRegister { secret } => match role {
            PeerRole::Application(_) => {
                reject(sink, "Application connections cannot become relays").await;
            }
            PeerRole::Relay => {
                tracing::debug!(connection_id = %connection_id, "Duplicate relay registration");
                sink.send(WireMessage::RelayAck).await?;
            }
            PeerRole::Unassigned => {
                if !context.auth.verify(secret.as_deref()) {
                    tracing::warn!(connection_id = %connection_id, "Relay registration rejected: bad secret");
                    reject(sink, "Authentication failed").await;
                    return Ok(false);
                }
                *role = PeerRole::Relay;
                sink.send(WireMessage::RelayAck).await?;
                tracing::info!(connection_id = %connection_id, "Relay peer registered");
            }
        },

        WireMessage::RelayRequest { payload } => {
            if *role != PeerRole::Relay {
                tracing::warn!(connection_id = %connection_id, "mcp_request from non-relay connection");
                reject(sink, "Connection is not registered as a relay").await;
                return Ok(true);
            }
            let handler = Arc::clone(&context.handler);
            let sink = Arc::clone(sink);
            relayed.spawn(async move {
                let Some(response) = execute_relayed(&*handler, payload).await else {
                    return;
                };
                match serde_json::to_value(&response) {
                    Ok(payload) => {
                        if let Err(e) = sink.send(WireMessage::RelayResponse { payload }).await {
                            log::warn!("Failed to return relayed response: {}", e);
                        }
                    }
                    Err(e) => log::warn!("Failed to encode relayed response: {}", e),
                }
            });
        }

        WireMessage::Error { message } => {
            tracing::warn!(connection_id = %connection_id, error = %message, "Peer reported error");
        }

        other => {
            tracing::warn!(connection_id = %connection_id, kind = other.kind(), "Unexpected message, ignoring");
        }
    }
    Ok(true)
}

/// Run one wrapped agent message through the local handler.
async fn execute_relayed<H: RequestHandler>(handler: &H, payload: serde_json::Value) -> Option<RpcResponse> {
    let id = payload
        .get("id")
        .cloned()
        .and_then(|id| serde_json::from_value(id).ok());
    match serde_json::from_value::<RpcRequest>(payload) {
        Ok(request) => handler.handle(request).await,
        Err(e) => id.map(|id| {
            RpcResponse::error(Some(id), RpcError::invalid_request(format!("Invalid request: {}", e)))
        }),
    }
}

async fn reject(sink: &MessageSink<WireMessage>, message: &str) {
    let error = WireMessage::Error {
        message: message.to_string(),
    };
    if let Err(e) = sink.send(error).await {
        log::debug!("Failed to send error to peer: {}", e);
    }
}
