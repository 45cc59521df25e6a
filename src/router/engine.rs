//! Routing & Correlation Engine
//!
//! Turns a namespaced tool call into one `toolInvocation` on the owning
//! application's connection and waits for the `toolResponse` carrying the
//! same correlation id. Every call ends in exactly one `ToolResult`: the
//! application's, or a failure for not-found, not-connected, timeout or
//! disconnect.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::RouteError;
use crate::id::ConnectionId;
use crate::ipc::{MessageSink, ToolResult, WireMessage};
use crate::registry::AppRegistry;

/// Default deadline for a routed call.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Ceiling for tools known to be slow (screenshots and the like).
pub const DEFAULT_SLOW_CALL_TIMEOUT: Duration = Duration::from_secs(120);

/// Per-tool deadlines, keyed on the unprefixed tool name.
#[derive(Debug, Clone)]
pub struct TimeoutPolicy {
    default: Duration,
    slow: Duration,
    slow_tools: HashSet<String>,
}

impl TimeoutPolicy {
    pub fn new(default: Duration) -> Self {
        Self {
            default,
            slow: default,
            slow_tools: HashSet::new(),
        }
    }

    /// Give `tools` the longer `ceiling`.
    pub fn with_slow_tools<I, S>(mut self, ceiling: Duration, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.slow = ceiling;
        self.slow_tools = tools.into_iter().map(Into::into).collect();
        self
    }

    pub fn for_tool(&self, tool: &str) -> Duration {
        if self.slow_tools.contains(tool) {
            self.slow
        } else {
            self.default
        }
    }

    /// Longest deadline any call can get.
    pub fn ceiling(&self) -> Duration {
        self.default.max(self.slow)
    }
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_CALL_TIMEOUT)
            .with_slow_tools(DEFAULT_SLOW_CALL_TIMEOUT, ["capture_screenshot"])
    }
}

/// A call waiting for its `toolResponse`. Resolved at most once.
struct PendingInvocation {
    connection_id: ConnectionId,
    app_name: String,
    sender: oneshot::Sender<ToolResult>,
    deadline: Instant,
}

/// Diagnostic view of one outstanding call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingInfo {
    pub correlation_id: u64,
    pub connection_id: ConnectionId,
    pub app_name: String,
    pub remaining: Duration,
}

/// Removes the pending entry however the waiting call ends, including when
/// the caller's future is dropped.
struct PendingGuard<'a> {
    pending: &'a DashMap<u64, PendingInvocation>,
    correlation_id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.correlation_id);
    }
}

pub struct Router {
    registry: Arc<AppRegistry>,
    connections: DashMap<ConnectionId, Arc<MessageSink<WireMessage>>>,
    pending: DashMap<u64, PendingInvocation>,
    next_correlation: AtomicU64,
    timeouts: TimeoutPolicy,
}

impl Router {
    pub fn new(registry: Arc<AppRegistry>, timeouts: TimeoutPolicy) -> Self {
        Self {
            registry,
            connections: DashMap::new(),
            pending: DashMap::new(),
            next_correlation: AtomicU64::new(1),
            timeouts,
        }
    }

    pub fn registry(&self) -> &Arc<AppRegistry> {
        &self.registry
    }

    pub fn timeouts(&self) -> &TimeoutPolicy {
        &self.timeouts
    }

    /// Make an application connection's write half available for routing.
    pub fn attach(&self, connection_id: &ConnectionId, sink: Arc<MessageSink<WireMessage>>) {
        self.connections.insert(connection_id.clone(), sink);
    }

    fn next_correlation_id(&self) -> u64 {
        self.next_correlation.fetch_add(1, Ordering::SeqCst)
    }

    /// Route a call and always produce a terminal result.
    pub async fn call_tool(&self, namespaced_name: &str, parameters: Value) -> ToolResult {
        match self.route(namespaced_name, parameters).await {
            Ok(result) => result,
            Err(e) => {
                tracing::info!(tool = %namespaced_name, error = %e, "Tool call failed before completion");
                e.into()
            }
        }
    }

    /// Route a call, separating routing failures from the application's result.
    pub async fn route(
        &self,
        namespaced_name: &str,
        parameters: Value,
    ) -> std::result::Result<ToolResult, RouteError> {
        let resolved = self
            .registry
            .find_app_by_tool(namespaced_name)
            .ok_or_else(|| RouteError::ToolNotFound(namespaced_name.to_string()))?;

        let sink = self
            .connections
            .get(&resolved.connection_id)
            .map(|s| Arc::clone(s.value()))
            .filter(|s| s.is_open())
            .ok_or_else(|| RouteError::AppNotConnected(resolved.app_name.clone()))?;

        let correlation_id = self.next_correlation_id();
        let timeout = self.timeouts.for_tool(&resolved.tool);
        let (sender, mut receiver) = oneshot::channel();

        self.pending.insert(
            correlation_id,
            PendingInvocation {
                connection_id: resolved.connection_id.clone(),
                app_name: resolved.app_name.clone(),
                sender,
                deadline: Instant::now() + timeout,
            },
        );
        let _guard = PendingGuard {
            pending: &self.pending,
            correlation_id,
        };

        tracing::debug!(
            correlation_id,
            connection_id = %resolved.connection_id,
            tool = %resolved.tool,
            "Forwarding tool invocation"
        );

        let invocation = WireMessage::ToolInvocation {
            correlation_id,
            tool: resolved.tool.clone(),
            parameters,
        };
        if let Err(e) = sink.send(invocation).await {
            return Err(RouteError::SendFailed {
                app: resolved.app_name,
                reason: e.to_string(),
            });
        }

        let outcome = tokio::time::timeout(timeout, &mut receiver).await;
        let timeout_ms = timeout.as_millis() as u64;
        match outcome {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => Err(RouteError::Disconnected(resolved.app_name)),
            Err(_) => {
                if self.pending.remove(&correlation_id).is_some() {
                    tracing::warn!(
                        correlation_id,
                        tool = %namespaced_name,
                        timeout_ms,
                        "Tool call timed out"
                    );
                    return Err(RouteError::Timeout {
                        tool: namespaced_name.to_string(),
                        timeout_ms,
                    });
                }
                // A response claimed the entry at the deadline; its send is
                // already underway.
                receiver.await.map_err(|_| RouteError::Timeout {
                    tool: namespaced_name.to_string(),
                    timeout_ms,
                })
            }
        }
    }

    /// Deliver a `toolResponse` received on `connection_id`.
    ///
    /// Returns false if nothing was waiting: a late, duplicate or unknown id.
    pub fn resolve(&self, connection_id: &ConnectionId, correlation_id: u64, result: ToolResult) -> bool {
        match self
            .pending
            .remove_if(&correlation_id, |_, p| &p.connection_id == connection_id)
        {
            Some((_, pending)) => {
                if pending.sender.send(result).is_err() {
                    tracing::debug!(correlation_id, "Caller gave up before response was delivered");
                }
                true
            }
            None => {
                if self.pending.contains_key(&correlation_id) {
                    tracing::warn!(
                        correlation_id,
                        connection_id = %connection_id,
                        "Response for a call owned by another connection, discarding"
                    );
                } else {
                    tracing::debug!(
                        correlation_id,
                        connection_id = %connection_id,
                        "No pending call for response (late or duplicate), discarding"
                    );
                }
                false
            }
        }
    }

    /// Tear down routing state for a closed connection.
    ///
    /// Marks the registration disconnected and fails every call still waiting
    /// on it. Returns how many calls were failed.
    pub fn connection_closed(&self, connection_id: &ConnectionId) -> usize {
        if let Some((_, sink)) = self.connections.remove(connection_id) {
            sink.mark_closed();
        }
        let app = self.registry.mark_disconnected(connection_id);

        let orphaned: Vec<u64> = self
            .pending
            .iter()
            .filter(|p| &p.connection_id == connection_id)
            .map(|p| *p.key())
            .collect();

        let mut failed = 0;
        for correlation_id in orphaned {
            if let Some((_, pending)) = self.pending.remove(&correlation_id) {
                let result = RouteError::Disconnected(pending.app_name.clone()).into();
                let _ = pending.sender.send(result);
                failed += 1;
            }
        }

        tracing::info!(
            connection_id = %connection_id,
            app = app.as_deref().unwrap_or("<unregistered>"),
            failed_calls = failed,
            "Application connection closed"
        );
        failed
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Outstanding calls, ordered by correlation id.
    pub fn pending(&self) -> Vec<PendingInfo> {
        let now = Instant::now();
        let mut infos: Vec<_> = self
            .pending
            .iter()
            .map(|p| PendingInfo {
                correlation_id: *p.key(),
                connection_id: p.connection_id.clone(),
                app_name: p.app_name.clone(),
                remaining: p.deadline.saturating_duration_since(now),
            })
            .collect();
        infos.sort_by_key(|p| p.correlation_id);
        infos
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::{ToolDefinition, message_stream};
    use futures::StreamExt;
    use serde_json::json;
    use tokio::io::DuplexStream;

    type AppSide = crate::ipc::MessageStream<DuplexStream, WireMessage>;

    /// Router with one registered application whose invocations can be read
    /// from the returned stream.
    fn setup(app: &str, tool_names: &[&str], timeouts: TimeoutPolicy) -> (Arc<Router>, ConnectionId, AppSide) {
        let registry = Arc::new(AppRegistry::new());
        let router = Arc::new(Router::new(registry, timeouts));
        let conn = ConnectionId::generate();
        let (router_end, app_end) = tokio::io::duplex(64 * 1024);
        router.attach(&conn, Arc::new(MessageSink::new(router_end)));
        router.registry().register_app(
            &conn,
            app,
            tool_names.iter().map(|n| ToolDefinition::new(*n, "")).collect(),
        );
        (router, conn, message_stream(app_end))
    }

    async fn next_invocation(stream: &mut AppSide) -> (u64, String, Value) {
        match stream.next().await.unwrap().unwrap() {
            WireMessage::ToolInvocation {
                correlation_id,
                tool,
                parameters,
            } => (correlation_id, tool, parameters),
            other => panic!("expected invocation, got {:?}", other),
        }
    }

    #[test]
    fn test_timeout_policy() {
        let policy = TimeoutPolicy::new(Duration::from_secs(30))
            .with_slow_tools(Duration::from_secs(120), ["capture_screenshot"]);
        assert_eq!(policy.for_tool("click"), Duration::from_secs(30));
        assert_eq!(policy.for_tool("capture_screenshot"), Duration::from_secs(120));
        assert_eq!(policy.ceiling(), Duration::from_secs(120));
    }

    #[tokio::test]
    async fn test_round_trip() {
        let (router, conn, mut app) = setup("Writer", &["SaveFile"], TimeoutPolicy::default());

        let caller = {
            let router = Arc::clone(&router);
            tokio::spawn(async move { router.call_tool("Writer:SaveFile", json!({"path": "a.txt"})).await })
        };

        let (id, tool, params) = next_invocation(&mut app).await;
        assert_eq!(id, 1);
        assert_eq!(tool, "SaveFile");
        assert_eq!(params, json!({"path": "a.txt"}));

        assert!(router.resolve(&conn, id, ToolResult::success(json!({"bytesWritten": 12}))));
        let result = caller.await.unwrap();
        assert!(result.success);
        assert_eq!(result.data.unwrap()["bytesWritten"], 12);
        assert_eq!(router.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_tool_fails_without_traffic() {
        let (router, _conn, _app) = setup("Writer", &["SaveFile"], TimeoutPolicy::default());
        let err = router.route("Ghost:Anything", json!({})).await.unwrap_err();
        assert_eq!(err, RouteError::ToolNotFound("Ghost:Anything".into()));
        assert_eq!(router.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_unwritable_connection_fails_fast() {
        let (router, conn, _app) = setup("Writer", &["SaveFile"], TimeoutPolicy::default());
        router.connections.get(&conn).unwrap().mark_closed();

        let err = router.route("Writer:SaveFile", json!({})).await.unwrap_err();
        assert_eq!(err, RouteError::AppNotConnected("Writer".into()));
    }

    #[tokio::test]
    async fn test_out_of_order_responses() {
        let (router, conn, mut app) = setup("Writer", &["Echo"], TimeoutPolicy::default());

        let callers: Vec<_> = (0..5)
            .map(|i| {
                let router = Arc::clone(&router);
                tokio::spawn(async move { router.call_tool("Writer:Echo", json!({"n": i})).await })
            })
            .collect();

        let mut invocations = Vec::new();
        for _ in 0..5 {
            invocations.push(next_invocation(&mut app).await);
        }
        assert_eq!(router.pending_count(), 5);

        // Answer in reverse, echoing each call's own parameter
        for (id, _, params) in invocations.iter().rev() {
            assert!(router.resolve(&conn, *id, ToolResult::success(params["n"].clone())));
        }

        for (i, caller) in callers.into_iter().enumerate() {
            let result = caller.await.unwrap();
            assert_eq!(result.data, Some(json!(i)));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_isolated_to_one_call() {
        let policy = TimeoutPolicy::new(Duration::from_secs(30))
            .with_slow_tools(Duration::from_secs(120), ["Slow"]);
        let (router, conn, mut app) = setup("Writer", &["Fast", "Slow"], policy);

        let fast = {
            let router = Arc::clone(&router);
            tokio::spawn(async move { router.call_tool("Writer:Fast", json!({})).await })
        };
        let (fast_id, _, _) = next_invocation(&mut app).await;

        let slow = {
            let router = Arc::clone(&router);
            tokio::spawn(async move { router.call_tool("Writer:Slow", json!({})).await })
        };
        let (slow_id, _, _) = next_invocation(&mut app).await;

        let fast_result = fast.await.unwrap();
        assert!(!fast_result.success);
        assert!(fast_result.error_message().contains("timed out after 30000ms"));

        // Slow call still waiting and unaffected
        assert_eq!(router.pending_count(), 1);
        assert!(!router.resolve(&conn, fast_id, ToolResult::success(json!("late"))));
        assert!(router.resolve(&conn, slow_id, ToolResult::success(json!("ok"))));
        assert_eq!(slow.await.unwrap().data, Some(json!("ok")));
    }

    #[tokio::test]
    async fn test_disconnect_fails_pending_promptly() {
        let (router, conn, mut app) = setup("Writer", &["SaveFile"], TimeoutPolicy::default());

        let caller = {
            let router = Arc::clone(&router);
            tokio::spawn(async move { router.call_tool("Writer:SaveFile", json!({})).await })
        };
        next_invocation(&mut app).await;

        assert_eq!(router.connection_closed(&conn), 1);
        let result = tokio::time::timeout(Duration::from_secs(1), caller)
            .await
            .unwrap()
            .unwrap();
        assert!(!result.success);
        assert!(result.error_message().contains("disconnected"));

        // Connection no longer routable
        let err = router.route("Writer:SaveFile", json!({})).await.unwrap_err();
        assert_eq!(err, RouteError::ToolNotFound("Writer:SaveFile".into()));
    }

    #[tokio::test]
    async fn test_response_from_wrong_connection_ignored() {
        let (router, _conn, mut app) = setup("Writer", &["SaveFile"], TimeoutPolicy::default());

        let caller = {
            let router = Arc::clone(&router);
            tokio::spawn(async move { router.call_tool("Writer:SaveFile", json!({})).await })
        };
        let (id, _, _) = next_invocation(&mut app).await;

        let intruder = ConnectionId::from("intruder");
        assert!(!router.resolve(&intruder, id, ToolResult::success(json!("spoofed"))));
        assert_eq!(router.pending_count(), 1);
        caller.abort();
    }

    #[tokio::test]
    async fn test_dropped_caller_cleans_pending() {
        let (router, _conn, mut app) = setup("Writer", &["SaveFile"], TimeoutPolicy::default());

        let caller = {
            let router = Arc::clone(&router);
            tokio::spawn(async move { router.call_tool("Writer:SaveFile", json!({})).await })
        };
        next_invocation(&mut app).await;
        assert_eq!(router.pending_count(), 1);

        caller.abort();
        let _ = caller.await;
        assert_eq!(router.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_pending_snapshot() {
        let (router, conn, mut app) = setup("Writer", &["SaveFile"], TimeoutPolicy::default());
        let caller = {
            let router = Arc::clone(&router);
            tokio::spawn(async move { router.call_tool("Writer:SaveFile", json!({})).await })
        };
        let (id, _, _) = next_invocation(&mut app).await;

        let pending = router.pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].correlation_id, id);
        assert_eq!(pending[0].connection_id, conn);
        assert_eq!(pending[0].app_name, "Writer");
        assert!(pending[0].remaining <= DEFAULT_CALL_TIMEOUT);
        caller.abort();
    }

    #[tokio::test]
    async fn test_correlation_ids_never_reused() {
        let (router, conn, mut app) = setup("Writer", &["Echo"], TimeoutPolicy::default());
        let mut seen = Vec::new();
        for _ in 0..3 {
            let caller = {
                let router = Arc::clone(&router);
                tokio::spawn(async move { router.call_tool("Writer:Echo", json!({})).await })
            };
            let (id, _, _) = next_invocation(&mut app).await;
            router.resolve(&conn, id, ToolResult::success(json!(null)));
            caller.await.unwrap();
            seen.push(id);
        }
        assert_eq!(seen, vec![1, 2, 3]);
    }
}
