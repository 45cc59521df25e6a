//! In-memory `UiSurface` backing the demo host and tests.

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};

use crate::error::{Result, ToolmuxError};

use super::ui::{Bounds, MouseButton, UiElement, UiSurface};

/// 1x1 PNG returned by `capture_screenshot`.
pub const PLACEHOLDER_PNG: [u8; 68] = [
    0x89, 0x50, 0x4e, 0x47, 0x0d, 0x0a, 0x1a, 0x0a, 0x00, 0x00, 0x00, 0x0d, 0x49, 0x48, 0x44, 0x52,
    0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x04, 0x00, 0x00, 0x00, 0xb5, 0x1c, 0x0c,
    0x02, 0x00, 0x00, 0x00, 0x0b, 0x49, 0x44, 0x41, 0x54, 0x78, 0xda, 0x63, 0x64, 0x60, 0x00, 0x00,
    0x00, 0x06, 0x00, 0x02, 0x30, 0x81, 0xd0, 0x2f, 0x00, 0x00, 0x00, 0x00, 0x49, 0x45, 0x4e, 0x44,
    0xae, 0x42, 0x60, 0x82,
];

#[derive(Debug, Clone, PartialEq)]
pub struct Click {
    pub x: f64,
    pub y: f64,
    pub button: MouseButton,
    /// Id of the element that was hit
    pub target: String,
}

pub struct MemorySurface {
    tree: RwLock<UiElement>,
    focused: Mutex<Option<String>>,
    clicks: Mutex<Vec<Click>>,
}

fn find_mut<'a>(element: &'a mut UiElement, id: &str) -> Option<&'a mut UiElement> {
    if element.id == id {
        return Some(element);
    }
    element.children.iter_mut().find_map(|c| find_mut(c, id))
}

impl MemorySurface {
    pub fn new(tree: UiElement) -> Self {
        Self {
            tree: RwLock::new(tree),
            focused: Mutex::new(None),
            clicks: Mutex::new(Vec::new()),
        }
    }

    /// A small editor window: toolbar with Save/Open buttons above a text area.
    pub fn demo(title: &str) -> Self {
        let toolbar = UiElement::new("toolbar", "toolbar", "")
            .with_bounds(Bounds::new(0.0, 0.0, 800.0, 40.0))
            .with_child(UiElement::new("save", "button", "Save").with_bounds(Bounds::new(10.0, 5.0, 80.0, 30.0)))
            .with_child(UiElement::new("open", "button", "Open").with_bounds(Bounds::new(100.0, 5.0, 80.0, 30.0)));
        let editor = UiElement::new("editor", "textbox", "Document")
            .with_bounds(Bounds::new(0.0, 40.0, 800.0, 560.0))
            .with_text("");
        let window = UiElement::new("window", "window", title)
            .with_bounds(Bounds::new(0.0, 0.0, 800.0, 600.0))
            .with_child(toolbar)
            .with_child(editor);
        Self::new(window)
    }

    pub async fn set_tree(&self, tree: UiElement) {
        *self.tree.write().await = tree;
    }

    /// Append `child` under the element with `parent_id`.
    pub async fn insert_child(&self, parent_id: &str, child: UiElement) -> Result<()> {
        let mut tree = self.tree.write().await;
        let parent = find_mut(&mut tree, parent_id)
            .ok_or_else(|| ToolmuxError::Surface(format!("No element with id '{}'", parent_id)))?;
        parent.children.push(child);
        Ok(())
    }

    pub async fn clicks(&self) -> Vec<Click> {
        self.clicks.lock().await.clone()
    }

    pub async fn focused(&self) -> Option<String> {
        self.focused.lock().await.clone()
    }

    pub async fn text_of(&self, id: &str) -> Option<String> {
        let mut tree = self.tree.write().await;
        find_mut(&mut tree, id).and_then(|e| e.text.clone())
    }
}

#[async_trait]
impl UiSurface for MemorySurface {
    async fn click_at(&self, x: f64, y: f64, button: MouseButton) -> Result<()> {
        let target = {
            let tree = self.tree.read().await;
            tree.hit_test(x, y)
                .map(|e| e.id.clone())
                .ok_or_else(|| ToolmuxError::Surface(format!("Point ({}, {}) is outside the window", x, y)))?
        };
        log::debug!("Click at ({}, {}) hit '{}'", x, y, target);
        *self.focused.lock().await = Some(target.clone());
        self.clicks.lock().await.push(Click { x, y, button, target });
        Ok(())
    }

    async fn type_text(&self, text: &str) -> Result<()> {
        let focused = self
            .focused
            .lock()
            .await
            .clone()
            .ok_or_else(|| ToolmuxError::Surface("No element has focus".into()))?;
        let mut tree = self.tree.write().await;
        let element = find_mut(&mut tree, &focused)
            .ok_or_else(|| ToolmuxError::Surface(format!("Focused element '{}' no longer exists", focused)))?;
        match element.text.as_mut() {
            Some(existing) => existing.push_str(text),
            None => {
                return Err(ToolmuxError::Surface(format!(
                    "Element '{}' does not accept text",
                    focused
                )));
            }
        }
        Ok(())
    }

    async fn capture_screenshot(&self) -> Result<Vec<u8>> {
        Ok(PLACEHOLDER_PNG.to_vec())
    }

    async fn element_tree(&self) -> Result<UiElement> {
        Ok(self.tree.read().await.clone())
    }
}
