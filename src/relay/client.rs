//! Relay client: the secondary router's connection to the primary.
//!
//! Agent requests travel as `mcp_request` envelopes and come back as
//! `mcp_response`. Responses are matched to their waiting caller by the inner
//! JSON-RPC id.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::{Result, ToolmuxError};
use crate::ipc::{MessageSink, MessageStream, RequestId, RpcRequest, RpcResponse, WireMessage, message_stream};

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Must exceed the primary's slowest tool deadline so the primary's own
/// timeout result arrives first.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(135);

type RelayPending = DashMap<RequestId, oneshot::Sender<RpcResponse>>;

struct RelayGuard<'a> {
    pending: &'a RelayPending,
    id: RequestId,
}

impl Drop for RelayGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

pub struct RelayClient {
    sink: Arc<MessageSink<WireMessage>>,
    pending: Arc<RelayPending>,
    connected: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl RelayClient {
    /// Connect to the primary router at `address` and register as a relay.
    pub async fn connect(address: &str, secret: Option<&str>, handshake_timeout: Duration) -> Result<Self> {
        let stream = TcpStream::connect(address)
            .await
            .map_err(|e| ToolmuxError::Relay(format!("Failed to connect to primary router at {}: {}", address, e)))?;
        let _ = stream.set_nodelay(true);
        Self::handshake(stream, secret, handshake_timeout).await
    }

    /// Register as a relay over an established stream and wait for the ack.
    pub async fn handshake<S>(stream: S, secret: Option<&str>, timeout: Duration) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let sink = Arc::new(MessageSink::<WireMessage>::new(writer));
        let mut messages = message_stream::<_, WireMessage>(reader);

        sink.send(WireMessage::RelayRegister {
            secret: secret.map(str::to_string),
        })
        .await?;

        tokio::time::timeout(timeout, await_ack(&mut messages))
            .await
            .map_err(|_| {
                ToolmuxError::Relay(format!(
                    "Primary router did not acknowledge relay within {}ms",
                    timeout.as_millis()
                ))
            })??;
        log::info!("Relay registered with primary router");

        let pending = Arc::new(RelayPending::new());
        let connected = Arc::new(AtomicBool::new(true));
        let reader = tokio::spawn(receive_loop(
            messages,
            Arc::clone(&pending),
            Arc::clone(&connected),
        ));

        Ok(Self {
            sink,
            pending,
            connected,
            reader,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && self.sink.is_open()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Forward one request and wait for the primary's response.
    pub async fn forward(&self, request: RpcRequest, timeout: Duration) -> Result<RpcResponse> {
        let id = request
            .id
            .clone()
            .ok_or_else(|| ToolmuxError::Protocol("Cannot relay a notification as a request".into()))?;
        if !self.is_connected() {
            return Err(ToolmuxError::Relay("Relay connection to primary router is closed".into()));
        }

        let (sender, mut receiver) = oneshot::channel();
        if self.pending.insert(id.clone(), sender).is_some() {
            log::warn!("Relay request id {} reused while still pending", id);
        }
        let _guard = RelayGuard {
            pending: &self.pending,
            id: id.clone(),
        };

        let payload = serde_json::to_value(&request)?;
        self.sink.send(WireMessage::RelayRequest { payload }).await?;

        match tokio::time::timeout(timeout, &mut receiver).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(ToolmuxError::Relay("Primary router disconnected".into())),
            Err(_) => {
                if self.pending.remove(&id).is_none() {
                    if let Ok(response) = receiver.await {
                        return Ok(response);
                    }
                }
                Err(ToolmuxError::Relay(format!(
                    "Primary router did not respond within {}ms",
                    timeout.as_millis()
                )))
            }
        }
    }

    pub async fn close(&self) {
        self.sink.close().await;
        self.reader.abort();
    }
}

impl Drop for RelayClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn await_ack<R: AsyncRead + Unpin>(messages: &mut MessageStream<R, WireMessage>) -> Result<()> {
    while let Some(message) = messages.next().await {
        match message? {
            WireMessage::RelayAck => return Ok(()),
            WireMessage::Error { message } => {
                return Err(ToolmuxError::Auth(format!("Primary router refused relay: {}", message)));
            }
            other => log::debug!("Ignoring '{}' during relay handshake", other.kind()),
        }
    }
    Err(ToolmuxError::Relay("Primary router closed the connection during handshake".into()))
}

async fn receive_loop<R: AsyncRead + Unpin>(
    mut messages: MessageStream<R, WireMessage>,
    pending: Arc<RelayPending>,
    connected: Arc<AtomicBool>,
) {
    while let Some(message) = messages.next().await {
        match message {
            Ok(WireMessage::RelayResponse { payload }) => {
                let response: RpcResponse = match serde_json::from_value(payload) {
                    Ok(response) => response,
                    Err(e) => {
                        log::warn!("Dropping malformed relay response: {}", e);
                        continue;
                    }
                };
                let Some(id) = response.id.clone() else {
                    log::warn!("Relay response without id, discarding");
                    continue;
                };
                match pending.remove(&id) {
                    Some((_, sender)) => {
                        let _ = sender.send(response);
                    }
                    None => log::debug!("No pending relay request for id {}, discarding", id),
                }
            }
            Ok(WireMessage::Error { message }) => {
                log::warn!("Primary router reported error: {}", message);
            }
            Ok(other) => log::debug!("Ignoring '{}' from primary router", other.kind()),
            Err(e) => {
                log::warn!("Relay connection read error: {}", e);
                break;
            }
        }
    }

    connected.store(false, Ordering::SeqCst);
    let orphaned = pending.len();
    // Dropping the senders fails every waiting request at once
    pending.clear();
    log::warn!("Relay connection to primary router closed ({} requests failed)", orphaned);
}
