//! BoxTool -- object-safe dynamic dispatch wrapper for Tool.
//!
//! 1. Define an object-safe `ToolDyn` trait with boxed futures
//! 2. Blanket-impl `ToolDyn` for all `T: Tool`
//! 3. `BoxTool` wraps `Box<dyn ToolDyn>` and delegates

use std::future::Future;
use std::pin::Pin;

use flowline_types::tool::{ToolContext, ToolMetadata, ToolResult};
use serde_json::Value;

use super::Tool;

/// Object-safe version of [`Tool`] with boxed futures.
pub trait ToolDyn: Send + Sync {
    fn metadata(&self) -> &ToolMetadata;

    fn execute_boxed<'a>(
        &'a self,
        input: &'a Value,
        ctx: &'a ToolContext,
    ) -> Pin<Box<dyn Future<Output = ToolResult> + Send + 'a>>;
}

/// Blanket implementation: any `Tool` automatically implements `ToolDyn`.
impl<T: Tool> ToolDyn for T {
    fn metadata(&self) -> &ToolMetadata {
        Tool::metadata(self)
    }

    fn execute_boxed<'a>(
        &'a self,
        input: &'a Value,
        ctx: &'a ToolContext,
    ) -> Pin<Box<dyn Future<Output = ToolResult> + Send + 'a>> {
        Box::pin(self.execute(input, ctx))
    }
}

/// Type-erased tool for registry storage.
pub struct BoxTool {
    inner: Box<dyn ToolDyn + Send + Sync>,
}

impl BoxTool {
    /// Wrap a concrete `Tool` in a type-erased box.
    pub fn new<T: Tool + 'static>(tool: T) -> Self {
        Self {
            inner: Box::new(tool),
        }
    }

    pub fn metadata(&self) -> &ToolMetadata {
        self.inner.metadata()
    }

    /// Registry name of the tool.
    pub fn name(&self) -> &str {
        &self.inner.metadata().name
    }

    pub async fn execute(&self, input: &Value, ctx: &ToolContext) -> ToolResult {
        self.inner.execute_boxed(input, ctx).await
    }
}

impl std::fmt::Debug for BoxTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxTool").field("name", &self.name()).finish()
    }
}
