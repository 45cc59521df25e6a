//! Router bootstrap
//!
//! Binds the application-facing listener, or, when another router already
//! owns the address, connects to it as a relay. Either way the agent gets
//! the same endpoint on stdio.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::agent::{LocalHandler, RequestHandler, SessionSummary, serve_agent};
use crate::auth;
use crate::config::Config;
use crate::error::{Result, ToolmuxError};
use crate::ipc::{RpcRequest, RpcResponse};
use crate::registry::AppRegistry;
use crate::relay::{RelayClient, RelayHandler};
use crate::router::{AppListener, ConnectionContext, Router};

/// Whichever handler serves this process's agent.
pub enum AgentBackend {
    Local(Arc<LocalHandler>),
    Relay(RelayHandler),
}

impl RequestHandler for AgentBackend {
    async fn handle(&self, request: RpcRequest) -> Option<RpcResponse> {
        match self {
            Self::Local(handler) => handler.handle(request).await,
            Self::Relay(handler) => handler.handle(request).await,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceRole {
    /// Owns the listener and routing table
    Primary(SocketAddr),
    /// Relays to the router at this address
    Relay(String),
}

pub struct Service {
    role: ServiceRole,
    backend: AgentBackend,
    router: Option<Arc<Router>>,
    listener: Option<JoinHandle<Result<()>>>,
    shutdown: CancellationToken,
}

impl Service {
    pub async fn start(config: &Config, shutdown: CancellationToken) -> Result<Self> {
        let identity = config.agent.identity();
        let registry = Arc::new(AppRegistry::with_retention(config.routing.disconnected_retention));
        let router = Arc::new(Router::new(registry, config.routing.timeout_policy()));
        let handler = Arc::new(LocalHandler::new(Arc::clone(&router), identity.clone()));
        let context = ConnectionContext {
            router: Arc::clone(&router),
            handler: Arc::clone(&handler),
            auth: auth::from_secret(config.listener.shared_secret.as_deref()),
        };

        let address = &config.listener.bind_address;
        match AppListener::bind(config.listener.listener_config(), context).await {
            Ok(listener) => {
                let local = listener.local_addr()?;
                log::info!("Serving as primary router on {}", local);
                let task = tokio::spawn(listener.run(shutdown.child_token()));
                Ok(Self {
                    role: ServiceRole::Primary(local),
                    backend: AgentBackend::Local(handler),
                    router: Some(router),
                    listener: Some(task),
                    shutdown,
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                log::info!("{} is already in use, relaying to the router that owns it", address);
                let client = RelayClient::connect(
                    address,
                    config.listener.shared_secret.as_deref(),
                    Duration::from_millis(config.relay.handshake_timeout_ms),
                )
                .await?;
                let relay = RelayHandler::new(Arc::new(client), identity)
                    .with_request_timeout(Duration::from_millis(config.relay.request_timeout_ms));
                Ok(Self {
                    role: ServiceRole::Relay(address.clone()),
                    backend: AgentBackend::Relay(relay),
                    router: None,
                    listener: None,
                    shutdown,
                })
            }
            Err(e) => Err(ToolmuxError::Ipc(format!("Failed to bind {}: {}", address, e))),
        }
    }

    pub fn role(&self) -> &ServiceRole {
        &self.role
    }

    pub fn backend(&self) -> &AgentBackend {
        &self.backend
    }

    /// The local routing engine, if this process is the primary.
    pub fn router(&self) -> Option<&Arc<Router>> {
        self.router.as_ref()
    }

    /// Serve one agent session over the given streams.
    pub async fn serve_agent<R, W>(&self, reader: R, writer: W) -> Result<SessionSummary>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Send + 'static,
    {
        serve_agent(reader, writer, &self.backend, self.shutdown.child_token()).await
    }

    /// Stop accepting connections and wait for connection tasks to finish.
    pub async fn shutdown(mut self) -> Result<()> {
        self.shutdown.cancel();
        if let AgentBackend::Relay(relay) = &self.backend {
            relay.client().close().await;
        }
        if let Some(task) = self.listener.take() {
            task.await
                .map_err(|e| ToolmuxError::Ipc(format!("Listener task failed: {}", e)))??;
        }
        log::info!("Router stopped");
        Ok(())
    }
}
