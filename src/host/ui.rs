//! Baseline UI tools
//!
//! Every UI-bearing host exposes the same six tools over its `UiSurface`.
//! Parameter problems fail fast with a failure result.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::Result;
use crate::ipc::{ToolDefinition, ToolResult};

use super::ToolHost;
use super::handler::{FnHandler, Params};
use super::selector::Selector;

pub const CLICK_AT: &str = "click_at";
pub const TYPE_TEXT: &str = "type_text";
pub const CAPTURE_SCREENSHOT: &str = "capture_screenshot";
pub const GET_ELEMENT_TREE: &str = "get_element_tree";
pub const FIND_ELEMENT: &str = "find_element";
pub const WAIT_FOR_ELEMENT: &str = "wait_for_element";

const DEFAULT_WAIT_MS: u64 = 5_000;
/// Stays under the router's default call deadline.
const MAX_WAIT_MS: u64 = 25_000;
const WAIT_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Bounds {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self { x, y, width, height }
    }

    pub fn contains(&self, x: f64, y: f64) -> bool {
        x >= self.x && y >= self.y && x < self.x + self.width && y < self.y + self.height
    }
}

/// One node of an application's accessible element tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UiElement {
    pub id: String,
    pub role: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub bounds: Bounds,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<UiElement>,
}

impl UiElement {
    pub fn new(id: impl Into<String>, role: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: role.into(),
            name: name.into(),
            bounds: Bounds::default(),
            text: None,
            children: Vec::new(),
        }
    }

    pub fn with_bounds(mut self, bounds: Bounds) -> Self {
        self.bounds = bounds;
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn with_child(mut self, child: UiElement) -> Self {
        self.children.push(child);
        self
    }

    /// Copy of the tree cut off below `depth` (0 keeps only this node).
    pub fn pruned(&self, depth: u64) -> UiElement {
        let mut copy = self.clone();
        if depth == 0 {
            copy.children.clear();
        } else {
            copy.children = self.children.iter().map(|c| c.pruned(depth - 1)).collect();
        }
        copy
    }

    /// Deepest element whose bounds contain the point.
    pub fn hit_test(&self, x: f64, y: f64) -> Option<&UiElement> {
        if !self.bounds.contains(x, y) {
            return None;
        }
        self.children
            .iter()
            .rev()
            .find_map(|c| c.hit_test(x, y))
            .or(Some(self))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MouseButton {
    #[default]
    Left,
    Right,
    Middle,
}

impl MouseButton {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "left" => Some(Self::Left),
            "right" => Some(Self::Right),
            "middle" => Some(Self::Middle),
            _ => None,
        }
    }
}

/// The application's window, as seen by the baseline tools.
#[async_trait]
pub trait UiSurface: Send + Sync {
    async fn click_at(&self, x: f64, y: f64, button: MouseButton) -> Result<()>;

    async fn type_text(&self, text: &str) -> Result<()>;

    /// PNG-encoded capture of the surface.
    async fn capture_screenshot(&self) -> Result<Vec<u8>>;

    async fn element_tree(&self) -> Result<UiElement>;
}

/// Register the six baseline tools on `host`.
pub fn register_ui_tools(host: &ToolHost, surface: Arc<dyn UiSurface>) {
    let s = Arc::clone(&surface);
    host.register_tool(
        ToolDefinition::new(CLICK_AT, "Click at window coordinates").with_schema(json!({
            "type": "object",
            "properties": {
                "x": {"type": "number"},
                "y": {"type": "number"},
                "button": {"type": "string", "enum": ["left", "right", "middle"]}
            },
            "required": ["x", "y"]
        })),
        FnHandler::new(move |params: Value| {
            let s = Arc::clone(&s);
            async move { click_at(&*s, &params).await.unwrap_or_else(|e| e) }
        }),
    );

    let s = Arc::clone(&surface);
    host.register_tool(
        ToolDefinition::new(TYPE_TEXT, "Type text into the focused element").with_schema(json!({
            "type": "object",
            "properties": {"text": {"type": "string"}},
            "required": ["text"]
        })),
        FnHandler::new(move |params: Value| {
            let s = Arc::clone(&s);
            async move { type_text(&*s, &params).await.unwrap_or_else(|e| e) }
        }),
    );

    let s = Arc::clone(&surface);
    host.register_tool(
        ToolDefinition::new(CAPTURE_SCREENSHOT, "Capture the window as a PNG image"),
        FnHandler::new(move |_params: Value| {
            let s = Arc::clone(&s);
            async move { capture_screenshot(&*s).await }
        }),
    );

    let s = Arc::clone(&surface);
    host.register_tool(
        ToolDefinition::new(GET_ELEMENT_TREE, "Get the accessible element tree").with_schema(json!({
            "type": "object",
            "properties": {"maxDepth": {"type": "integer", "minimum": 0}}
        })),
        FnHandler::new(move |params: Value| {
            let s = Arc::clone(&s);
            async move { element_tree(&*s, &params).await.unwrap_or_else(|e| e) }
        }),
    );

    let s = Arc::clone(&surface);
    host.register_tool(
        ToolDefinition::new(FIND_ELEMENT, "Find elements matching a selector").with_schema(json!({
            "type": "object",
            "properties": {"selector": {"type": "string"}},
            "required": ["selector"]
        })),
        FnHandler::new(move |params: Value| {
            let s = Arc::clone(&s);
            async move { find_element(&*s, &params).await.unwrap_or_else(|e| e) }
        }),
    );

    let s = surface;
    host.register_tool(
        ToolDefinition::new(WAIT_FOR_ELEMENT, "Wait until an element matching a selector appears").with_schema(
            json!({
                "type": "object",
                "properties": {
                    "selector": {"type": "string"},
                    "timeoutMs": {"type": "integer", "minimum": 0, "maximum": MAX_WAIT_MS}
                },
                "required": ["selector"]
            }),
        ),
        FnHandler::new(move |params: Value| {
            let s = Arc::clone(&s);
            async move { wait_for_element(&*s, &params).await.unwrap_or_else(|e| e) }
        }),
    );
}

type ToolOutcome = std::result::Result<ToolResult, ToolResult>;

fn surface_failure(tool: &str, e: crate::error::ToolmuxError) -> ToolResult {
    ToolResult::failure(format!("{}: {}", tool, e))
}

fn parse_selector(params: &Params<'_>, tool: &str) -> std::result::Result<Selector, ToolResult> {
    let text = params.required_str("selector")?;
    Selector::parse(text).map_err(|e| ToolResult::failure(format!("{}: invalid selector '{}': {}", tool, text, e)))
}

async fn click_at(surface: &dyn UiSurface, value: &Value) -> ToolOutcome {
    let params = Params::new(CLICK_AT, value);
    let x = params.required_coordinate("x")?;
    let y = params.required_coordinate("y")?;
    let button = match params.optional_str("button")? {
        None => MouseButton::Left,
        Some(b) => MouseButton::parse(b).ok_or_else(|| {
            ToolResult::failure(format!("{}: unknown button '{}'", CLICK_AT, b))
        })?,
    };

    surface
        .click_at(x, y, button)
        .await
        .map_err(|e| surface_failure(CLICK_AT, e))?;
    Ok(ToolResult::success(json!({"clicked": true, "x": x, "y": y, "button": button})))
}

async fn type_text(surface: &dyn UiSurface, value: &Value) -> ToolOutcome {
    let params = Params::new(TYPE_TEXT, value);
    let text = params.required_str("text")?;
    surface
        .type_text(text)
        .await
        .map_err(|e| surface_failure(TYPE_TEXT, e))?;
    Ok(ToolResult::success(json!({"typed": text.chars().count()})))
}

async fn capture_screenshot(surface: &dyn UiSurface) -> ToolResult {
    match surface.capture_screenshot().await {
        Ok(png) => ToolResult::success(json!({
            "mimeType": "image/png",
            "data": BASE64.encode(png),
        })),
        Err(e) => surface_failure(CAPTURE_SCREENSHOT, e),
    }
}

async fn element_tree(surface: &dyn UiSurface, value: &Value) -> ToolOutcome {
    let params = Params::new(GET_ELEMENT_TREE, value);
    let depth = params.optional_u64("maxDepth")?;
    let tree = surface
        .element_tree()
        .await
        .map_err(|e| surface_failure(GET_ELEMENT_TREE, e))?;
    let tree = match depth {
        Some(depth) => tree.pruned(depth),
        None => tree,
    };
    to_result(&tree)
}

async fn find_element(surface: &dyn UiSurface, value: &Value) -> ToolOutcome {
    let params = Params::new(FIND_ELEMENT, value);
    let selector = parse_selector(&params, FIND_ELEMENT)?;
    let tree = surface
        .element_tree()
        .await
        .map_err(|e| surface_failure(FIND_ELEMENT, e))?;

    let matches = selector.find_all(&tree);
    match matches.first() {
        Some(first) => to_result(&json!({
            "element": first.pruned(0),
            "matchCount": matches.len(),
        })),
        None => Err(ToolResult::failure(format!(
            "{}: no element matches selector '{}'",
            FIND_ELEMENT, selector
        ))),
    }
}

async fn wait_for_element(surface: &dyn UiSurface, value: &Value) -> ToolOutcome {
    let params = Params::new(WAIT_FOR_ELEMENT, value);
    let selector = parse_selector(&params, WAIT_FOR_ELEMENT)?;
    let timeout_ms = params.optional_u64("timeoutMs")?.unwrap_or(DEFAULT_WAIT_MS);
    if timeout_ms > MAX_WAIT_MS {
        return Err(ToolResult::failure(format!(
            "{}: timeoutMs may not exceed {}",
            WAIT_FOR_ELEMENT, MAX_WAIT_MS
        )));
    }

    let started = tokio::time::Instant::now();
    let deadline = started + Duration::from_millis(timeout_ms);
    loop {
        let tree = surface
            .element_tree()
            .await
            .map_err(|e| surface_failure(WAIT_FOR_ELEMENT, e))?;
        if let Some(found) = selector.find_first(&tree) {
            return to_result(&json!({
                "element": found.pruned(0),
                "waitedMs": started.elapsed().as_millis() as u64,
            }));
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(ToolResult::failure(format!(
                "{}: no element matched '{}' within {}ms",
                WAIT_FOR_ELEMENT, selector, timeout_ms
            )));
        }
        tokio::time::sleep(WAIT_POLL).await;
    }
}

fn to_result<T: Serialize>(value: &T) -> ToolOutcome {
    serde_json::to_value(value)
        .map(ToolResult::success)
        .map_err(|e| ToolResult::failure(format!("Failed to encode result: {}", e)))
}
