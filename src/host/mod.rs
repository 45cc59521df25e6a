//! Tool Host - embedded in each application
//!
//! Owns the application's tool registry and makes it callable through the
//! router. Tool names are registered and invoked unprefixed; the router adds
//! the `app:` namespace when aggregating.

pub mod connection;
pub mod handler;
pub mod memory;
pub mod selector;
pub mod ui;

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;

use crate::ipc::{ToolDefinition, ToolResult, WireMessage};

pub use connection::DEFAULT_RECONNECT_DELAY;
pub use handler::{FnHandler, Params, ToolHandler};
pub use memory::MemorySurface;
pub use selector::{Selector, SelectorError};
pub use ui::{Bounds, MouseButton, UiElement, UiSurface, register_ui_tools};

struct RegisteredTool {
    definition: ToolDefinition,
    handler: Arc<dyn ToolHandler>,
}

pub struct ToolHost {
    app_name: String,
    tools: DashMap<String, RegisteredTool>,
    secret: Option<String>,
}

impl ToolHost {
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            tools: DashMap::new(),
            secret: None,
        }
    }

    /// Shared secret presented when registering with the router.
    pub fn with_secret(mut self, secret: Option<String>) -> Self {
        self.secret = secret.filter(|s| !s.is_empty());
        self
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    /// Add or replace a tool. Returns true if an existing tool was replaced.
    ///
    /// Only affects the catalog sent on the next (re)connection.
    pub fn register_tool(&self, definition: ToolDefinition, handler: impl ToolHandler + 'static) -> bool {
        let name = definition.name.clone();
        let replaced = self
            .tools
            .insert(
                name.clone(),
                RegisteredTool {
                    definition,
                    handler: Arc::new(handler),
                },
            )
            .is_some();
        if replaced {
            log::warn!("Tool '{}' registered twice on '{}', last registration wins", name, self.app_name);
        }
        replaced
    }

    pub fn unregister_tool(&self, name: &str) -> bool {
        self.tools.remove(name).is_some()
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn tool_count(&self) -> usize {
        self.tools.len()
    }

    /// Current catalog, sorted by name.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<_> = self.tools.iter().map(|t| t.definition.clone()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// The full registration message for a new connection.
    pub fn registration(&self) -> WireMessage {
        WireMessage::Register {
            app_name: self.app_name.clone(),
            tools: self.definitions(),
            secret: self.secret.clone(),
        }
    }

    /// Run the handler for an unprefixed tool name.
    ///
    /// Unknown tools and panicking handlers become failure results.
    pub async fn dispatch(&self, tool: &str, parameters: Value) -> ToolResult {
        let Some(handler) = self.tools.get(tool).map(|t| Arc::clone(&t.handler)) else {
            log::warn!("Invocation of unknown tool '{}' on '{}'", tool, self.app_name);
            return ToolResult::failure(format!("Unknown tool: {}", tool));
        };

        match tokio::spawn(async move { handler.call(parameters).await }).await {
            Ok(result) => result,
            Err(e) => {
                log::error!("Tool '{}' failed: {}", tool, e);
                ToolResult::failure(format!("Tool '{}' failed unexpectedly", tool))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn echo() -> FnHandler<impl Fn(Value) -> std::future::Ready<ToolResult> + Send + Sync> {
        FnHandler::new(|params: Value| std::future::ready(ToolResult::success(params)))
    }

    #[tokio::test]
    async fn test_dispatch_by_unprefixed_name() {
        let host = ToolHost::new("Writer");
        host.register_tool(ToolDefinition::new("SaveFile", "Save"), echo());

        let result = host.dispatch("SaveFile", json!({"path": "a.txt"})).await;
        assert!(result.success);
        assert_eq!(result.data, Some(json!({"path": "a.txt"})));
    }

    #[tokio::test]
    async fn test_unknown_tool_fails() {
        let host = ToolHost::new("Writer");
        let result = host.dispatch("Writer:SaveFile", json!({})).await;
        assert!(!result.success);
        assert_eq!(result.error_message(), "Unknown tool: Writer:SaveFile");
    }

    #[tokio::test]
    async fn test_last_registration_wins() {
        let host = ToolHost::new("Writer");
        assert!(!host.register_tool(ToolDefinition::new("x", "first"), echo()));
        assert!(host.register_tool(
            ToolDefinition::new("x", "second"),
            FnHandler::new(|_: Value| async { ToolResult::failure("second") }),
        ));

        assert_eq!(host.tool_count(), 1);
        assert_eq!(host.definitions()[0].description, "second");
        assert_eq!(host.dispatch("x", json!({})).await.error_message(), "second");
    }

    #[tokio::test]
    async fn test_panicking_handler_becomes_failure() {
        let host = ToolHost::new("Writer");
        struct Panicking;

        #[async_trait::async_trait]
        impl ToolHandler for Panicking {
            async fn call(&self, _parameters: Value) -> ToolResult {
                panic!("handler bug")
            }
        }

        host.register_tool(ToolDefinition::new("boom", ""), Panicking);
        let result = host.dispatch("boom", json!({})).await;
        assert!(!result.success);
        assert!(result.error_message().contains("boom"));
    }

    #[test]
    fn test_registration_carries_sorted_catalog() {
        let host = ToolHost::new("Writer").with_secret(Some("pw".into()));
        host.register_tool(ToolDefinition::new("b", ""), echo());
        host.register_tool(ToolDefinition::new("a", ""), echo());

        let WireMessage::Register { app_name, tools, secret } = host.registration() else {
            panic!("expected register");
        };
        assert_eq!(app_name, "Writer");
        assert_eq!(secret.as_deref(), Some("pw"));
        let names: Vec<_> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn test_empty_secret_is_none() {
        let host = ToolHost::new("Writer").with_secret(Some(String::new()));
        assert!(matches!(host.registration(), WireMessage::Register { secret: None, .. }));
    }

    #[test]
    fn test_unregister() {
        let host = ToolHost::new("Writer");
        host.register_tool(ToolDefinition::new("a", ""), echo());
        assert!(host.unregister_tool("a"));
        assert!(!host.has_tool("a"));
    }
}
