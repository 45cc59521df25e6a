//! Tool handler trait and parameter helpers

use std::future::Future;

use async_trait::async_trait;
use serde_json::Value;

use crate::ipc::ToolResult;

/// Asynchronous function from arguments to a `ToolResult`.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, parameters: Value) -> ToolResult;
}

/// Adapts an async closure into a `ToolHandler`.
pub struct FnHandler<F>(F);

impl<F> FnHandler<F> {
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F, Fut> ToolHandler for FnHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = ToolResult> + Send,
{
    async fn call(&self, parameters: Value) -> ToolResult {
        (self.0)(parameters).await
    }
}

/// Typed access to invocation parameters. Each getter yields a failure
/// `ToolResult` ready to return.
pub struct Params<'a> {
    tool: &'a str,
    value: &'a Value,
}

impl<'a> Params<'a> {
    pub fn new(tool: &'a str, value: &'a Value) -> Self {
        Self { tool, value }
    }

    fn field(&self, key: &str) -> Option<&'a Value> {
        self.value.get(key).filter(|v| !v.is_null())
    }

    fn missing(&self, key: &str) -> ToolResult {
        ToolResult::failure(format!("{}: missing required parameter '{}'", self.tool, key))
    }

    fn invalid(&self, key: &str, expected: &str) -> ToolResult {
        ToolResult::failure(format!("{}: parameter '{}' must be {}", self.tool, key, expected))
    }

    pub fn required_str(&self, key: &str) -> Result<&'a str, ToolResult> {
        match self.field(key) {
            None => Err(self.missing(key)),
            Some(v) => v.as_str().ok_or_else(|| self.invalid(key, "a string")),
        }
    }

    pub fn optional_str(&self, key: &str) -> Result<Option<&'a str>, ToolResult> {
        match self.field(key) {
            None => Ok(None),
            Some(v) => v.as_str().map(Some).ok_or_else(|| self.invalid(key, "a string")),
        }
    }

    /// Finite, non-negative number.
    pub fn required_coordinate(&self, key: &str) -> Result<f64, ToolResult> {
        match self.field(key) {
            None => Err(self.missing(key)),
            Some(v) => v
                .as_f64()
                .filter(|n| n.is_finite() && *n >= 0.0)
                .ok_or_else(|| self.invalid(key, "a non-negative number")),
        }
    }

    pub fn optional_u64(&self, key: &str) -> Result<Option<u64>, ToolResult> {
        match self.field(key) {
            None => Ok(None),
            Some(v) => v.as_u64().map(Some).ok_or_else(|| self.invalid(key, "a non-negative integer")),
        }
    }
}
