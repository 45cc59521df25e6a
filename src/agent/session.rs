//! Agent-Facing Server session loop.
//!
//! One long-lived session per agent stream. Requests are processed to
//! completion one at a time; a slow tool call delays the next request on the
//! same channel. End of input only stops reading: every request already
//! received is still answered. Shutdown abandons the in-flight request (its
//! pending call is cleaned up by the routing engine).

use futures::StreamExt;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::ipc::{MessageSink, Methods, RpcError, RpcRequest, RpcResponse, message_stream};

use super::handler::RequestHandler;

/// Capacity of the queue between the reader task and request processing.
const REQUEST_QUEUE: usize = 32;

/// Negotiation state of one agent session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Ready,
}

/// Counters reported when a session ends.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSummary {
    pub requests: u64,
    pub notifications: u64,
    pub rejected: u64,
}

/// Message read from the agent, after envelope validation.
enum Incoming {
    Request(RpcRequest),
    Invalid(RpcResponse),
}

fn classify(value: Value) -> Option<Incoming> {
    // Responses from the agent; we never send it requests
    if value.get("method").is_none() && (value.get("result").is_some() || value.get("error").is_some()) {
        log::debug!("Ignoring response-shaped message from agent");
        return None;
    }

    let id = value
        .get("id")
        .cloned()
        .and_then(|id| serde_json::from_value(id).ok());

    match serde_json::from_value::<RpcRequest>(value) {
        Ok(request) => Some(Incoming::Request(request)),
        Err(e) => match id {
            Some(id) => Some(Incoming::Invalid(RpcResponse::error(
                Some(id),
                RpcError::invalid_request(format!("Invalid request: {}", e)),
            ))),
            None => {
                log::warn!("Dropping invalid agent message: {}", e);
                None
            }
        },
    }
}

/// Serve one agent session until its stream closes or `shutdown` fires.
pub async fn serve_agent<R, W, H>(
    reader: R,
    writer: W,
    handler: &H,
    shutdown: CancellationToken,
) -> Result<SessionSummary>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Send + 'static,
    H: RequestHandler,
{
    let sink: MessageSink<RpcResponse> = MessageSink::new(writer);
    let (tx, mut rx) = mpsc::channel::<Incoming>(REQUEST_QUEUE);
    let session = shutdown.child_token();

    let reader_task = {
        let session = session.clone();
        tokio::spawn(async move {
            let mut stream = message_stream::<R, Value>(reader);
            loop {
                let next = tokio::select! {
                    next = stream.next() => next,
                    _ = session.cancelled() => break,
                };
                match next {
                    Some(Ok(value)) => {
                        if let Some(incoming) = classify(value) {
                            if tx.send(incoming).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Err(e)) => {
                        log::warn!("Agent stream read error: {}", e);
                        break;
                    }
                    None => break,
                }
            }
            // Dropping `tx` lets the queue drain, then `recv` yields None
            log::info!("Agent stream closed");
        })
    };

    let mut state = SessionState::Uninitialized;
    let mut summary = SessionSummary::default();

    loop {
        let incoming = tokio::select! {
            biased;
            _ = session.cancelled() => None,
            incoming = rx.recv() => incoming,
        };
        let Some(incoming) = incoming else {
            break;
        };

        let request = match incoming {
            Incoming::Request(request) => request,
            Incoming::Invalid(response) => {
                summary.rejected += 1;
                if let Err(e) = sink.send(response).await {
                    log::warn!("Failed to write to agent: {}", e);
                    break;
                }
                continue;
            }
        };

        if request.is_notification() {
            summary.notifications += 1;
        } else {
            summary.requests += 1;
        }

        if request.method == Methods::INITIALIZE {
            state = SessionState::Ready;
        } else if state == SessionState::Uninitialized && !request.is_notification() {
            log::warn!("Agent sent '{}' before initialize", request.method);
        }

        let method = request.method.clone();
        let response = tokio::select! {
            biased;
            response = handler.handle(request) => response,
            _ = session.cancelled() => {
                log::info!("Session cancelled during '{}', abandoning request", method);
                break;
            }
        };

        if let Some(response) = response {
            if let Err(e) = sink.send(response).await {
                log::warn!("Failed to write to agent: {}", e);
                break;
            }
        }
    }

    session.cancel();
    drop(rx);
    let _ = reader_task.await;
    sink.close().await;

    log::info!(
        "Agent session ended: {} requests, {} notifications, {} rejected",
        summary.requests,
        summary.notifications,
        summary.rejected
    );
    Ok(summary)
}
