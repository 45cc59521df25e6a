//! Tool host side of the application-facing channel

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, ToolmuxError};
use crate::ipc::{MessageSink, WireMessage, message_stream};

use super::ToolHost;

pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(2);

impl ToolHost {
    /// Serve invocations over an established stream until it closes.
    ///
    /// Sends the full registration first. Each invocation runs as its own
    /// task so a slow tool never holds up other correlation ids.
    pub async fn serve<S>(self: &Arc<Self>, stream: S, shutdown: CancellationToken) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let sink = Arc::new(MessageSink::<WireMessage>::new(writer));
        let mut messages = message_stream::<_, WireMessage>(reader);
        let mut invocations: JoinSet<()> = JoinSet::new();

        sink.send(self.registration()).await?;
        log::info!("Registered '{}' with {} tools", self.app_name(), self.tool_count());

        let outcome: Result<()> = loop {
            let next = tokio::select! {
                next = messages.next() => next,
                Some(_) = invocations.join_next(), if !invocations.is_empty() => continue,
                _ = shutdown.cancelled() => break Ok(()),
            };

            match next {
                Some(Ok(WireMessage::ToolInvocation {
                    correlation_id,
                    tool,
                    parameters,
                })) => {
                    log::debug!("Invocation {} of '{}'", correlation_id, tool);
                    let host = Arc::clone(self);
                    let sink = Arc::clone(&sink);
                    invocations.spawn(async move {
                        let result = host.dispatch(&tool, parameters).await;
                        let response = WireMessage::ToolResponse { correlation_id, result };
                        if let Err(e) = sink.send(response).await {
                            log::warn!("Failed to send response {}: {}", correlation_id, e);
                        }
                    });
                }
                Some(Ok(WireMessage::Error { message })) => {
                    log::warn!("Router reported error: {}", message);
                }
                Some(Ok(other)) => {
                    log::debug!("Ignoring unexpected '{}' from router", other.kind());
                }
                Some(Err(e)) => break Err(e.into()),
                None => break Ok(()),
            }
        };

        invocations.shutdown().await;
        sink.close().await;
        outcome
    }

    /// Connect to the router at `address` and serve until the connection ends.
    pub async fn connect(self: &Arc<Self>, address: &str, shutdown: CancellationToken) -> Result<()> {
        let stream = TcpStream::connect(address)
            .await
            .map_err(|e| ToolmuxError::Ipc(format!("Failed to connect to router at {}: {}", address, e)))?;
        let _ = stream.set_nodelay(true);
        log::info!("Connected to router at {}", address);
        self.serve(stream, shutdown).await
    }

    /// Stay connected to the router, re-registering after every reconnect,
    /// until `shutdown` fires.
    pub async fn run(self: Arc<Self>, address: &str, reconnect_delay: Duration, shutdown: CancellationToken) {
        loop {
            match self.connect(address, shutdown.child_token()).await {
                Ok(()) => log::info!("Connection to router closed"),
                Err(e) => log::warn!("{}", e),
            }
            if shutdown.is_cancelled() {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(reconnect_delay) => {}
                _ = shutdown.cancelled() => break,
            }
        }
        log::info!("Tool host '{}' stopped", self.app_name());
    }
}
